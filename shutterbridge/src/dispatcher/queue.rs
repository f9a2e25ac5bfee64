use std::time::Duration;

use enocean::{Gateway, Packet};
use futures::future::{BoxFuture, FutureExt};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::{ErrorKind, Result};

/// Minimum gap between two telegrams, across all shutters.
pub const MIN_TELEGRAM_SPACING: Duration = Duration::from_millis(100);

/// Something that puts packets on the air. Implemented by the gateway, and by recorders in
/// tests.
pub trait Transmit: Send + Sync + 'static {
    fn transmit(&self, packet: Packet) -> BoxFuture<'static, enocean::Result<()>>;
}

impl Transmit for Gateway {
    fn transmit(&self, packet: Packet) -> BoxFuture<'static, enocean::Result<()>> {
        let gateway = self.clone();
        async move { gateway.transmit(packet).await }.boxed()
    }
}

#[derive(Debug)]
pub struct OutboundQueueEntry {
    pub packet: Packet,
    /// Gap to leave after the previous transmission before sending this one.
    pub min_delay: Duration,
    /// Describes the telegram in logs.
    pub label: String,
}

/// FIFO of telegrams waiting for the one radio.
#[derive(Clone)]
pub struct OutboundQueue {
    entries: mpsc::Sender<OutboundQueueEntry>,
}

impl OutboundQueue {
    pub fn new<T>(transmitter: T) -> Self
    where
        T: Transmit,
    {
        let (entries_tx, entries_rx) = mpsc::channel(64);

        let sender = Sender {
            transmitter,
            entries: entries_rx,
            last_sent: None,
        };
        tokio::spawn(sender.task());

        Self {
            entries: entries_tx,
        }
    }

    pub async fn push(&self, entry: OutboundQueueEntry) -> Result<()> {
        self.entries
            .send(entry)
            .await
            .map_err(|_| ErrorKind::ChannelError)?;
        Ok(())
    }
}

struct Sender<T> {
    transmitter: T,
    entries: mpsc::Receiver<OutboundQueueEntry>,
    last_sent: Option<Instant>,
}

impl<T> Sender<T>
where
    T: Transmit,
{
    async fn task(mut self) {
        while let Some(entry) = self.entries.recv().await {
            if let Some(last_sent) = self.last_sent {
                tokio::time::sleep_until(last_sent + entry.min_delay).await;
            }

            debug!("sending {}", entry.label);
            if let Err(error) = self.transmitter.transmit(entry.packet).await {
                warn!("could not send {}: {}", entry.label, error);
            }
            self.last_sent = Some(Instant::now());
        }
    }
}
