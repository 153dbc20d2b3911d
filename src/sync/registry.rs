use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use super::delivery::{CycleFailure, DeliveryTarget, FeedEvent};
use crate::diff::ChangeSet;
use crate::error::{DeliveryError, SubscriberError};
use crate::storage::Snapshot;

/// Returned by `subscribe`; pass it back to `unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionHandle(u64);

impl SubscriptionHandle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct CallbackSubscriber<F> {
    callback: F,
}

impl<F> DeliveryTarget for CallbackSubscriber<F>
where
    F: Fn(&Snapshot, &ChangeSet) -> anyhow::Result<()> + Send + Sync,
{
    fn name(&self) -> &str {
        "callback"
    }

    fn deliver(&self, event: &FeedEvent) -> Result<(), DeliveryError> {
        match event {
            FeedEvent::Committed(c) => (self.callback)(&c.snapshot, &c.changes)
                .map_err(|e| DeliveryError::Rejected(format!("{e:#}"))),
            FeedEvent::Failed(_) => Ok(()),
        }
    }
}

struct FailureSubscriber<F> {
    callback: F,
}

impl<F> DeliveryTarget for FailureSubscriber<F>
where
    F: Fn(&CycleFailure) + Send + Sync,
{
    fn name(&self) -> &str {
        "failure-callback"
    }

    fn deliver(&self, event: &FeedEvent) -> Result<(), DeliveryError> {
        if let FeedEvent::Failed(failure) = event {
            (self.callback)(failure);
        }
        Ok(())
    }
}

/// Outcome of one synchronous dispatch round.
#[derive(Debug, Clone, Default)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failures: Vec<SubscriberError>,
}

/// In-process subscribers, notified synchronously in subscription order.
#[derive(Default)]
pub struct SubscriberRegistry {
    next_id: AtomicU64,
    subscribers: RwLock<Vec<(SubscriptionHandle, Arc<dyn DeliveryTarget>)>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback invoked with the full current snapshot and the
    /// change set after every commit.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionHandle
    where
        F: Fn(&Snapshot, &ChangeSet) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.subscribe_target(Arc::new(CallbackSubscriber { callback }))
    }

    /// Register a callback for cycles that fail schema validation or reading.
    pub fn subscribe_failures<F>(&self, callback: F) -> SubscriptionHandle
    where
        F: Fn(&CycleFailure) + Send + Sync + 'static,
    {
        self.subscribe_target(Arc::new(FailureSubscriber { callback }))
    }

    pub fn subscribe_target(&self, target: Arc<dyn DeliveryTarget>) -> SubscriptionHandle {
        let handle = SubscriptionHandle(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut subscribers = self.subscribers.write();
        subscribers.push((handle, target));
        tracing::info!(%handle, total = subscribers.len(), "added subscriber");
        handle
    }

    /// Remove a subscriber. Takes effect from the next dispatch; returns
    /// whether the handle was registered.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|(h, _)| *h != handle);
        let removed = subscribers.len() != before;
        if removed {
            tracing::info!(%handle, total = subscribers.len(), "removed subscriber");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.read().is_empty()
    }

    /// Deliver `event` to every subscriber registered when the dispatch
    /// started. Errors and panics are captured per subscriber; a failing
    /// subscriber stays registered.
    pub fn dispatch(&self, event: &FeedEvent) -> DispatchReport {
        let targets: Vec<(SubscriptionHandle, Arc<dyn DeliveryTarget>)> = self.subscribers.read().clone();
        let mut report = DispatchReport::default();

        for (handle, target) in targets {
            let failure = match catch_unwind(AssertUnwindSafe(|| target.deliver(event))) {
                Ok(Ok(())) => {
                    report.delivered += 1;
                    continue;
                }
                Ok(Err(err)) => SubscriberError::Failed {
                    handle: handle.id(),
                    message: err.to_string(),
                },
                Err(payload) => SubscriberError::Panicked {
                    handle: handle.id(),
                    message: panic_message(payload.as_ref()),
                },
            };
            tracing::error!(%handle, "error in subscriber callback: {failure}");
            report.failures.push(failure);
        }

        report
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Committed;
    use parking_lot::Mutex;

    fn committed(sequence: u64) -> FeedEvent {
        FeedEvent::Committed(Committed {
            snapshot: Arc::new(Snapshot::new(sequence, Vec::new(), Vec::new(), None)),
            changes: Arc::new(ChangeSet::empty(sequence)),
        })
    }

    #[test]
    fn callbacks_run_in_subscription_order() {
        let registry = SubscriberRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for name in ["first", "second", "third"] {
            let log = log.clone();
            registry.subscribe(move |_, changes| {
                log.lock().push(format!("{name}:{}", changes.sequence));
                Ok(())
            });
        }

        let report = registry.dispatch(&committed(7));
        assert_eq!(report.delivered, 3);
        assert_eq!(*log.lock(), vec!["first:7", "second:7", "third:7"]);
    }

    #[test]
    fn failing_callbacks_are_isolated() {
        let registry = SubscriberRegistry::new();
        let reached = Arc::new(Mutex::new(0));

        let bad = registry.subscribe(|_, _| anyhow::bail!("disk full"));
        let panicky = registry.subscribe(|_, _| panic!("boom"));
        {
            let reached = reached.clone();
            registry.subscribe(move |_, _| {
                *reached.lock() += 1;
                Ok(())
            });
        }

        let report = registry.dispatch(&committed(0));
        assert_eq!(report.delivered, 1);
        assert_eq!(*reached.lock(), 1);
        assert_eq!(report.failures.len(), 2);
        assert_eq!(report.failures[0].handle(), bad.id());
        assert!(matches!(
            &report.failures[1],
            SubscriberError::Panicked { handle, message } if *handle == panicky.id() && message == "boom"
        ));

        // still registered
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.dispatch(&committed(1)).failures.len(), 2);
    }

    #[test]
    fn unsubscribe_stops_future_deliveries() {
        let registry = SubscriberRegistry::new();
        let count = Arc::new(Mutex::new(0));
        let handle = {
            let count = count.clone();
            registry.subscribe(move |_, _| {
                *count.lock() += 1;
                Ok(())
            })
        };

        registry.dispatch(&committed(0));
        assert!(registry.unsubscribe(handle));
        assert!(!registry.unsubscribe(handle));
        registry.dispatch(&committed(1));
        assert_eq!(*count.lock(), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn subscribing_during_dispatch_does_not_disturb_it() {
        let registry = Arc::new(SubscriberRegistry::new());
        let calls = Arc::new(Mutex::new(0));
        {
            let registry_ref = Arc::downgrade(&registry);
            let calls = calls.clone();
            registry.subscribe(move |_, _| {
                *calls.lock() += 1;
                if let Some(registry) = registry_ref.upgrade() {
                    registry.subscribe(|_, _| Ok(()));
                }
                Ok(())
            });
        }

        let report = registry.dispatch(&committed(0));
        assert_eq!(report.delivered, 1);
        assert_eq!(registry.len(), 2);
        assert_eq!(*calls.lock(), 1);
    }

    #[test]
    fn failure_subscribers_see_only_failures() {
        let registry = SubscriberRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            registry.subscribe_failures(move |failure| seen.lock().push(failure.current_sequence()));
        }

        registry.dispatch(&committed(0));
        registry.dispatch(&FeedEvent::Failed(Arc::new(CycleFailure::SchemaError {
            current_sequence: Some(0),
            errors: Vec::new(),
        })));
        assert_eq!(*seen.lock(), vec![Some(0)]);
    }
}
