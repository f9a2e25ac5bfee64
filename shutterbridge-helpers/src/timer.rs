use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Delivers `event` on `events` once `delay` has elapsed.
///
/// The timer is never cancelled: receivers compare the event's generation against their current
/// one instead. If the receiver is gone by then, the event is dropped.
pub fn schedule<E>(events: mpsc::WeakSender<E>, delay: Duration, event: E) -> JoinHandle<()>
where
    E: Send + 'static,
{
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        if let Some(events) = events.upgrade() {
            let _ = events.send(event).await;
        }
    })
}
