use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::delivery::{DeliveryTarget, FeedEvent};
use crate::storage::SnapshotStore;

pub const DEFAULT_FEED_CAPACITY: usize = 256;

/// In-process broadcast of publish-cycle events.
///
/// The publisher is the only producer. Each broadcaster drains its own
/// receiver, so a slow broadcaster lags on its own and never holds up the
/// publisher or the other broadcasters.
#[derive(Clone)]
pub struct UpdateFeed {
    tx: broadcast::Sender<FeedEvent>,
}

impl Default for UpdateFeed {
    fn default() -> Self {
        Self::new(DEFAULT_FEED_CAPACITY)
    }
}

impl UpdateFeed {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FeedEvent> {
        self.tx.subscribe()
    }

    /// Publish an event; returns how many receivers it reached.
    pub fn publish(&self, event: FeedEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Drain this feed into `target` until the feed closes.
    ///
    /// If the target falls behind far enough to miss events it is re-based on
    /// the store's current snapshot.
    pub fn spawn_pump(&self, store: Arc<SnapshotStore>, target: Arc<dyn DeliveryTarget>) -> JoinHandle<()> {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if let Err(err) = target.deliver(&event) {
                            tracing::warn!(target_name = target.name(), "delivery failed: {err}");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(
                            target_name = target.name(),
                            missed,
                            "feed lagged; resyncing clients on the current snapshot"
                        );
                        if let Err(err) = target.resync(store.current()) {
                            tracing::warn!(target_name = target.name(), "resync failed: {err}");
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            tracing::debug!(target_name = target.name(), "feed closed");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DeliveryError;
    use crate::sync::delivery::CycleFailure;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl DeliveryTarget for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        fn deliver(&self, event: &FeedEvent) -> Result<(), DeliveryError> {
            let label = match event {
                FeedEvent::Committed(c) => format!("commit:{}", c.changes.sequence),
                FeedEvent::Failed(f) => format!("failed:{:?}", f.current_sequence()),
            };
            self.events.lock().push(label);
            Ok(())
        }

        fn resync(&self, _snapshot: Option<Arc<crate::storage::Snapshot>>) -> Result<(), DeliveryError> {
            self.events.lock().push("resync".into());
            Ok(())
        }
    }

    fn failure(seq: Option<u64>) -> FeedEvent {
        FeedEvent::Failed(Arc::new(CycleFailure::ReadError {
            current_sequence: seq,
            message: "gone".into(),
        }))
    }

    #[test]
    fn publish_without_receivers_is_harmless() {
        let feed = UpdateFeed::new(4);
        assert_eq!(feed.publish(failure(None)), 0);
    }

    #[tokio::test]
    async fn pump_forwards_in_order() {
        let feed = UpdateFeed::new(16);
        let recorder = Arc::new(Recorder::default());
        let pump = feed.spawn_pump(Arc::new(SnapshotStore::new()), recorder.clone());

        for seq in 0..3 {
            feed.publish(failure(Some(seq)));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(
            *recorder.events.lock(),
            vec!["failed:Some(0)", "failed:Some(1)", "failed:Some(2)"]
        );
        pump.abort();
    }

    #[tokio::test(flavor = "current_thread")]
    async fn lagging_pump_resyncs() {
        let feed = UpdateFeed::new(2);
        let recorder = Arc::new(Recorder::default());
        let pump = feed.spawn_pump(Arc::new(SnapshotStore::new()), recorder.clone());

        // the pump task cannot run until we yield, so these overflow its buffer
        for seq in 0..5 {
            feed.publish(failure(Some(seq)));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let events = recorder.events.lock().clone();
        assert_eq!(events[0], "resync");
        assert_eq!(events.last().map(String::as_str), Some("failed:Some(4)"));
        pump.abort();
    }
}
