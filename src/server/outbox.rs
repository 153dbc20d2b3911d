use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

struct Queue<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Bounded per-client queue. Pushing never waits: when full, the oldest
/// unsent item is discarded to make room.
pub struct Outbox<T> {
    capacity: usize,
    queue: Mutex<Queue<T>>,
    ready: Notify,
    dropped: AtomicU64,
}

impl<T> Outbox<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            queue: Mutex::new(Queue {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            ready: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Queue `item`. Returns false if the outbox was already closed.
    pub fn push(&self, item: T) -> bool {
        {
            let mut queue = self.queue.lock();
            if queue.closed {
                return false;
            }
            if queue.items.len() == self.capacity {
                queue.items.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.items.push_back(item);
        }
        self.ready.notify_one();
        true
    }

    /// Discard everything queued and queue `item` alone.
    pub fn replace_all(&self, item: T) -> bool {
        {
            let mut queue = self.queue.lock();
            if queue.closed {
                return false;
            }
            let discarded = queue.items.len() as u64;
            queue.items.clear();
            self.dropped.fetch_add(discarded, Ordering::Relaxed);
            queue.items.push_back(item);
        }
        self.ready.notify_one();
        true
    }

    /// Wait for the next item. `None` once closed; items still queued at
    /// close are discarded.
    pub async fn pop(&self) -> Option<T> {
        loop {
            {
                let mut queue = self.queue.lock();
                if queue.closed {
                    return None;
                }
                if let Some(item) = queue.items.pop_front() {
                    return Some(item);
                }
            }
            self.ready.notified().await;
        }
    }

    pub fn close(&self) {
        self.queue.lock().closed = true;
        self.ready.notify_waiters();
        self.ready.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.queue.lock().closed
    }

    pub fn len(&self) -> usize {
        self.queue.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Items discarded because the client was not keeping up.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn overflow_drops_oldest() {
        let outbox = Outbox::new(3);
        for i in 0..5 {
            assert!(outbox.push(i));
        }
        assert_eq!(outbox.dropped(), 2);
        assert_eq!(outbox.pop().await, Some(2));
        assert_eq!(outbox.pop().await, Some(3));
        assert_eq!(outbox.pop().await, Some(4));
        assert!(outbox.is_empty());
    }

    #[tokio::test]
    async fn pop_waits_for_push() {
        let outbox = Arc::new(Outbox::new(4));
        let reader = {
            let outbox = outbox.clone();
            tokio::spawn(async move { outbox.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        outbox.push("hello");
        assert_eq!(reader.await.unwrap(), Some("hello"));
    }

    #[tokio::test]
    async fn close_wakes_waiting_reader() {
        let outbox: Arc<Outbox<u8>> = Arc::new(Outbox::new(4));
        let reader = {
            let outbox = outbox.clone();
            tokio::spawn(async move { outbox.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        outbox.close();
        assert_eq!(reader.await.unwrap(), None);
        assert!(!outbox.push(1));
    }

    #[tokio::test]
    async fn replace_all_keeps_only_the_new_item() {
        let outbox = Outbox::new(4);
        outbox.push(1);
        outbox.push(2);
        outbox.replace_all(9);
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox.dropped(), 2);
        assert_eq!(outbox.pop().await, Some(9));
    }
}
