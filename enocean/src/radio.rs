use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::stream::Stream;
use tokio::sync::mpsc;

use crate::Telegram;

/// Radio telegrams received by the transceiver, in arrival order.
///
/// The stream ends when the serial connection is lost.
pub struct TelegramReader {
    pub(crate) rx: mpsc::Receiver<Telegram>,
}

impl Stream for TelegramReader {
    type Item = Telegram;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
