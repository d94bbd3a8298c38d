//! Bounded, lossy hand-off toward the push sink
//!
//! `offer` never waits: below capacity it appends, at capacity it either
//! overwrites the oldest queued reading of the same series or evicts the
//! oldest reading overall and counts the drop.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;

use crate::counters::QueueCounters;
use crate::store::Reading;

/// What happened to an offered reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    Queued,
    /// Replaced a queued reading of the same series
    Coalesced,
    /// Queued after evicting the oldest unrelated reading
    DroppedOldest,
}

#[derive(Debug)]
pub struct PushQueue {
    capacity: usize,
    items: Mutex<VecDeque<Arc<Reading>>>,
    notify: Notify,
    counters: QueueCounters,
}

impl PushQueue {
    pub fn new(capacity: usize, counters: QueueCounters) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            counters,
        }
    }

    pub fn offer(&self, reading: Arc<Reading>) -> Offer {
        let outcome = {
            let mut items = self.items.lock();
            if items.len() < self.capacity {
                items.push_back(reading);
                Offer::Queued
            } else if let Some(slot) = items.iter_mut().find(|queued| queued.same_series(&reading)) {
                *slot = reading;
                Offer::Coalesced
            } else {
                items.pop_front();
                items.push_back(reading);
                Offer::DroppedOldest
            }
        };

        self.counters.offered.inc();
        match outcome {
            Offer::Queued => {},
            Offer::Coalesced => self.counters.coalesced.inc(),
            Offer::DroppedOldest => self.counters.dropped.inc(),
        }

        self.notify.notify_one();
        outcome
    }

    /// Take up to `max` readings, oldest first
    pub fn drain(&self, max: usize) -> Vec<Arc<Reading>> {
        let mut items = self.items.lock();
        let count = max.min(items.len());
        items.drain(..count).collect()
    }

    /// Resolves after the next offer, or immediately if one happened since the last wait
    pub async fn notified(&self) {
        self.notify.notified().await;
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::protocol::Value;
    use crate::store::LabelSet;
    use crate::counters::Counters;
    use chrono::Utc;

    fn new_queue(capacity: usize) -> (PushQueue, Counters) {
        let counters = Counters::new().unwrap();
        (PushQueue::new(capacity, counters.push_queue()), counters)
    }

    fn reading(oid: u32, value: f32) -> Arc<Reading> {
        Arc::new(Reading {
            oid,
            metric: "rctmon_test",
            labels: LabelSet::from_pairs([("inverter", "test")]),
            value: Value::Float(value),
            observed_at: Utc::now(),
        })
    }

    #[test]
    fn test_appends_below_capacity_without_coalescing() {
        let (queue, counters) = new_queue(4);
        assert_eq!(queue.offer(reading(1, 1.0)), Offer::Queued);
        assert_eq!(queue.offer(reading(1, 2.0)), Offer::Queued);
        assert_eq!(queue.len(), 2);
        assert_eq!(counters.push_queue_offered.get(), 2);
        assert_eq!(counters.push_queue_coalesced.get(), 0);
    }

    #[test]
    fn test_full_queue_coalesces_same_series() {
        let (queue, counters) = new_queue(3);
        queue.offer(reading(1, 1.0));
        queue.offer(reading(2, 1.0));
        queue.offer(reading(3, 1.0));

        assert_eq!(queue.offer(reading(2, 5.0)), Offer::Coalesced);
        let items = queue.drain(10);
        let values: Vec<_> = items.iter().map(|r| (r.oid, r.value.clone())).collect();
        assert_eq!(
            values,
            vec![
                (1, Value::Float(1.0)),
                (2, Value::Float(5.0)),
                (3, Value::Float(1.0))
            ]
        );
        assert_eq!(counters.push_queue_coalesced.get(), 1);
        assert_eq!(counters.push_queue_dropped.get(), 0);
    }

    #[test]
    fn test_full_queue_evicts_oldest_unrelated() {
        let (queue, counters) = new_queue(3);
        for oid in 1..=3 {
            queue.offer(reading(oid, 0.0));
        }

        // N more readings for one new series: one eviction, the rest coalesce
        for i in 0..10 {
            queue.offer(reading(99, i as f32));
        }

        assert_eq!(queue.len(), 3);
        assert_eq!(counters.push_queue_offered.get(), 13);
        assert_eq!(counters.push_queue_coalesced.get(), 9);
        assert_eq!(counters.push_queue_dropped.get(), 1);

        let items = queue.drain(10);
        assert_eq!(items.iter().map(|r| r.oid).collect::<Vec<_>>(), vec![2, 3, 99]);
        assert_eq!(items[2].value, Value::Float(9.0));
    }

    #[test]
    fn test_drain_respects_max() {
        let (queue, _counters) = new_queue(10);
        for oid in 0..5 {
            queue.offer(reading(oid, 0.0));
        }
        assert_eq!(queue.drain(2).len(), 2);
        assert_eq!(queue.len(), 3);
        assert!(queue.drain(0).is_empty());
    }

    #[tokio::test]
    async fn test_offer_wakes_waiter() {
        let (queue, _counters) = new_queue(2);
        let queue = Arc::new(queue);
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                queue.notified().await;
                queue.drain(10).len()
            })
        };
        tokio::task::yield_now().await;
        queue.offer(reading(1, 1.0));
        assert_eq!(waiter.await.unwrap(), 1);
    }
}
