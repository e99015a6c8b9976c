use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::OrchestratorError;

/// Connection state reported for a watched peer.
///
/// An event without an error is a heartbeat.
#[derive(Debug)]
pub struct WatchEvent {
    pub peer: String,
    pub error: Option<OrchestratorError>,
}

impl WatchEvent {
    pub fn heartbeat(peer: impl Into<String>) -> Self {
        Self {
            peer: peer.into(),
            error: None,
        }
    }

    pub fn failed(peer: impl Into<String>, error: OrchestratorError) -> Self {
        Self {
            peer: peer.into(),
            error: Some(error),
        }
    }
}

/// Consumes `events` until the first broken connection, then calls `cancel`
/// once and stops.
///
/// The task also ends when `ctx` is cancelled or the channel closes; in
/// either case `cancel` is not called.
pub fn watch_reconnects<F>(
    ctx: CancellationToken,
    cancel: F,
    mut events: mpsc::Receiver<WatchEvent>,
) -> JoinHandle<()>
where
    F: FnOnce() + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                biased;
                _ = ctx.cancelled() => {
                    debug!("Reconnect watch stopped");
                    return;
                }
                event = events.recv() => event,
            };
            let Some(event) = event else {
                debug!("Reconnect watch channel closed");
                return;
            };
            let Some(error) = event.error else {
                continue;
            };

            warn!(peer = %event.peer, error = %error, "Failed to reconnect to peer");
            cancel();
            return;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_cancel_called_once_after_error() {
        let (tx, rx) = mpsc::channel(8);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let ctx = CancellationToken::new();

        let handle = watch_reconnects(
            ctx.clone(),
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            rx,
        );

        tx.send(WatchEvent::heartbeat("10.0.0.5")).await.unwrap();
        tokio::task::yield_now().await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        tx.send(WatchEvent::failed(
            "10.0.0.5",
            OrchestratorError::connection_problem("10.0.0.5", "connection reset by peer"),
        ))
        .await
        .unwrap();
        handle.await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // The watcher is gone; later events are never consumed.
        assert!(tx
            .send(WatchEvent::failed("10.0.0.5", OrchestratorError::Cancelled))
            .await
            .is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stops_on_context_cancel() {
        let (tx, rx) = mpsc::channel(8);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let ctx = CancellationToken::new();

        let handle = watch_reconnects(
            ctx.clone(),
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            rx,
        );
        ctx.cancel();
        handle.await.unwrap();

        drop(tx);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stops_when_channel_closes() {
        let (tx, rx) = mpsc::channel::<WatchEvent>(8);
        let handle = watch_reconnects(CancellationToken::new(), || panic!("must not cancel"), rx);

        drop(tx);
        handle.await.unwrap();
    }
}
