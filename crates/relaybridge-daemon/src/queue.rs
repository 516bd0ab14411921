//! Single-flight FIFO request queue.
//!
//! Items wait in arrival order; at most one is in flight to the worker. The
//! queue itself is plain data: the bridge coordinator is its only owner and
//! decides when to dispatch.

use std::collections::VecDeque;

use tokio::time::Instant;

use relaybridge_core::config::OverflowPolicy;

/// One inbound request waiting for the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    /// Message text forwarded to the worker.
    pub payload: String,
    /// Identity the response is addressed to.
    pub reply_to: String,
    pub enqueued_at: Instant,
    /// Dispatches that reached the worker so far.
    pub attempts: u32,
}

impl WorkItem {
    pub fn new(payload: impl Into<String>, reply_to: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            reply_to: reply_to.into(),
            enqueued_at: Instant::now(),
            attempts: 0,
        }
    }
}

/// Result of a successful [`RequestQueue::enqueue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Appended; `depth` is the number of waiting items.
    Queued { depth: usize },
    /// Appended after evicting the oldest waiting item.
    DroppedOldest { evicted: WorkItem, depth: usize },
}

/// Errors from queue operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Request queue full ({capacity} items)")]
    Full { capacity: usize },
}

/// FIFO of waiting items plus the in-flight slot.
#[derive(Debug, Default)]
pub struct RequestQueue {
    items: VecDeque<WorkItem>,
    in_flight: Option<WorkItem>,
    capacity: Option<usize>,
    overflow: OverflowPolicy,
}

impl RequestQueue {
    /// Unbounded queue.
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Queue holding at most `capacity` waiting items.
    pub fn bounded(capacity: usize, overflow: OverflowPolicy) -> Self {
        Self {
            capacity: Some(capacity),
            overflow,
            ..Self::default()
        }
    }

    /// Append an item. Never blocks; a full bounded queue applies its
    /// overflow policy.
    pub fn enqueue(&mut self, item: WorkItem) -> Result<EnqueueOutcome, QueueError> {
        if let Some(capacity) = self.capacity
            && self.items.len() >= capacity
        {
            return match self.overflow {
                OverflowPolicy::Reject => Err(QueueError::Full { capacity }),
                OverflowPolicy::DropOldest => {
                    let Some(evicted) = self.items.pop_front() else {
                        return Err(QueueError::Full { capacity });
                    };
                    self.items.push_back(item);
                    Ok(EnqueueOutcome::DroppedOldest {
                        evicted,
                        depth: self.items.len(),
                    })
                }
            };
        }

        self.items.push_back(item);
        Ok(EnqueueOutcome::Queued {
            depth: self.items.len(),
        })
    }

    /// Take the front item, but only while nothing is in flight.
    pub fn pop_next(&mut self) -> Option<WorkItem> {
        if self.in_flight.is_some() {
            return None;
        }
        self.items.pop_front()
    }

    /// Put an item back at the front. Capacity is not checked: the item
    /// was already admitted once.
    pub fn requeue_front(&mut self, item: WorkItem) {
        self.items.push_front(item);
    }

    /// Occupy the in-flight slot.
    pub fn mark_in_flight(&mut self, item: WorkItem) {
        debug_assert!(self.in_flight.is_none(), "in-flight slot already occupied");
        self.in_flight = Some(item);
    }

    /// Free the in-flight slot, returning the item that occupied it.
    pub fn complete(&mut self) -> Option<WorkItem> {
        self.in_flight.take()
    }

    pub fn in_flight(&self) -> Option<&WorkItem> {
        self.in_flight.as_ref()
    }

    pub const fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Number of waiting items, excluding the in-flight one.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn item(payload: &str) -> WorkItem {
        WorkItem::new(payload, "abc")
    }

    #[test]
    fn fifo_order() {
        let mut queue = RequestQueue::unbounded();
        for p in ["a", "b", "c"] {
            queue.enqueue(item(p)).unwrap();
        }
        let first = queue.pop_next().unwrap();
        assert_eq!(first.payload, "a");
        queue.mark_in_flight(first);
        queue.complete();
        assert_eq!(queue.pop_next().unwrap().payload, "b");
    }

    #[test]
    fn nothing_dispatched_while_in_flight() {
        let mut queue = RequestQueue::unbounded();
        queue.enqueue(item("a")).unwrap();
        queue.enqueue(item("b")).unwrap();

        let a = queue.pop_next().unwrap();
        queue.mark_in_flight(a);
        assert!(queue.is_busy());
        assert!(queue.pop_next().is_none());
        assert_eq!(queue.len(), 1);

        assert_eq!(queue.complete().unwrap().payload, "a");
        assert!(!queue.is_busy());
        assert_eq!(queue.pop_next().unwrap().payload, "b");
    }

    #[test]
    fn requeue_goes_to_front() {
        let mut queue = RequestQueue::unbounded();
        queue.enqueue(item("a")).unwrap();
        queue.enqueue(item("b")).unwrap();
        let a = queue.pop_next().unwrap();
        queue.requeue_front(a);
        assert_eq!(queue.pop_next().unwrap().payload, "a");
    }

    #[test]
    fn bounded_reject() {
        let mut queue = RequestQueue::bounded(2, OverflowPolicy::Reject);
        queue.enqueue(item("a")).unwrap();
        assert_eq!(
            queue.enqueue(item("b")).unwrap(),
            EnqueueOutcome::Queued { depth: 2 }
        );
        assert!(matches!(
            queue.enqueue(item("c")),
            Err(QueueError::Full { capacity: 2 })
        ));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn bounded_drop_oldest() {
        let mut queue = RequestQueue::bounded(2, OverflowPolicy::DropOldest);
        queue.enqueue(item("a")).unwrap();
        queue.enqueue(item("b")).unwrap();
        let outcome = queue.enqueue(item("c")).unwrap();
        let EnqueueOutcome::DroppedOldest { evicted, depth } = outcome else {
            panic!("expected eviction");
        };
        assert_eq!(evicted.payload, "a");
        assert_eq!(depth, 2);
        assert_eq!(queue.pop_next().unwrap().payload, "b");
    }

    #[test]
    fn in_flight_item_does_not_count_against_capacity() {
        let mut queue = RequestQueue::bounded(1, OverflowPolicy::Reject);
        queue.enqueue(item("a")).unwrap();
        let a = queue.pop_next().unwrap();
        queue.mark_in_flight(a);
        queue.enqueue(item("b")).unwrap();
        assert_eq!(queue.in_flight().unwrap().payload, "a");
    }

    #[test]
    fn requeue_ignores_capacity() {
        let mut queue = RequestQueue::bounded(1, OverflowPolicy::Reject);
        queue.enqueue(item("a")).unwrap();
        let a = queue.pop_next().unwrap();
        queue.enqueue(item("b")).unwrap();
        queue.requeue_front(a);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop_next().unwrap().payload, "a");
    }
}
