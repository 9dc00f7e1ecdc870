//! Per-priority batching
//!
//! At most one open batch exists per priority. Everything here runs under
//! the coordinator's batch mutex; a flush takes the batch out of its slot
//! so two concurrent flushers can never both see the same items.

use super::types::Outbound;
use crate::clock::elapsed_between;
use crate::types::AckPriority;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Batch {
    pub priority: AckPriority,
    pub items: Vec<Outbound>,
    pub created_at: DateTime<Utc>,
}

impl Batch {
    fn new(priority: AckPriority, created_at: DateTime<Utc>) -> Self {
        Self {
            priority,
            items: Vec::new(),
            created_at,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_due(&self, now: DateTime<Utc>, max_size: usize, timeout: Duration) -> bool {
        self.items.len() >= max_size || elapsed_between(self.created_at, now) >= timeout
    }
}

#[derive(Debug)]
pub struct BatchSlots {
    open: HashMap<AckPriority, Batch>,
    max_size: usize,
    timeout: Duration,
}

impl BatchSlots {
    pub fn new(max_size: usize, timeout: Duration) -> Self {
        Self {
            open: HashMap::new(),
            max_size,
            timeout,
        }
    }

    /// Queues `item`. Returns the batch if this insert filled it.
    pub fn push(&mut self, item: Outbound, now: DateTime<Utc>) -> Option<Batch> {
        let priority = item.priority;
        let batch = self
            .open
            .entry(priority)
            .or_insert_with(|| Batch::new(priority, now));
        batch.items.push(item);

        // A batch that aged past its timeout between ticks goes out with
        // the item that found it.
        if batch.is_due(now, self.max_size, self.timeout) {
            return self.open.remove(&priority);
        }
        None
    }

    /// Removes every batch that is full or old enough, highest priority first.
    pub fn take_due(&mut self, now: DateTime<Utc>) -> Vec<Batch> {
        let mut due = Vec::new();
        for priority in AckPriority::ALL {
            let ready = self
                .open
                .get(&priority)
                .map(|b| b.is_due(now, self.max_size, self.timeout))
                .unwrap_or(false);
            if ready {
                if let Some(batch) = self.open.remove(&priority) {
                    due.push(batch);
                }
            }
        }
        due
    }

    /// Removes the batch for `priority` regardless of age.
    pub fn take(&mut self, priority: AckPriority) -> Option<Batch> {
        self.open.remove(&priority).filter(|b| !b.is_empty())
    }

    pub fn take_all(&mut self) -> Vec<Batch> {
        AckPriority::ALL
            .into_iter()
            .filter_map(|p| self.take(p))
            .collect()
    }

    pub fn queued(&self, priority: AckPriority) -> usize {
        self.open.get(&priority).map(Batch::len).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{Heartbeat, SyncMessage};
    use crate::session::AckId;
    use crate::types::{DataHash, PeerId};

    fn item(priority: AckPriority, n: u64, now: DateTime<Utc>) -> Outbound {
        Outbound {
            id: AckId::compose(1, n, 0),
            recipients: vec![PeerId::from("peer")],
            message: SyncMessage::Heartbeat(Heartbeat {
                sender: PeerId::from("me"),
                hash: DataHash::new("H"),
            }),
            priority,
            created_at: now,
            retry_count: 0,
        }
    }

    #[test]
    fn one_short_of_full_waits_for_timeout() {
        let start = Utc::now();
        let mut slots = BatchSlots::new(3, Duration::from_millis(500));
        assert!(slots.push(item(AckPriority::Medium, 1, start), start).is_none());
        assert!(slots.push(item(AckPriority::Medium, 2, start), start).is_none());

        let almost = start + chrono::Duration::milliseconds(499);
        assert!(slots.take_due(almost).is_empty());
        assert_eq!(slots.queued(AckPriority::Medium), 2);

        let expired = start + chrono::Duration::milliseconds(500);
        let due = slots.take_due(expired);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].len(), 2);
        assert_eq!(slots.queued(AckPriority::Medium), 0);
    }

    #[test]
    fn reaching_max_size_flushes_immediately() {
        let start = Utc::now();
        let mut slots = BatchSlots::new(3, Duration::from_secs(3600));
        slots.push(item(AckPriority::High, 1, start), start);
        slots.push(item(AckPriority::High, 2, start), start);
        let full = slots.push(item(AckPriority::High, 3, start), start).unwrap();

        assert_eq!(full.len(), 3);
        let order: Vec<u64> = full
            .items
            .iter()
            .map(|o| o.id.parse().unwrap().sequence)
            .collect();
        assert_eq!(order, vec![1, 2, 3]);
        assert_eq!(slots.queued(AckPriority::High), 0);
    }

    #[test]
    fn priorities_batch_independently() {
        let start = Utc::now();
        let mut slots = BatchSlots::new(2, Duration::from_secs(1));
        slots.push(item(AckPriority::Low, 1, start), start);
        slots.push(item(AckPriority::High, 2, start), start);
        assert_eq!(slots.queued(AckPriority::Low), 1);
        assert_eq!(slots.queued(AckPriority::High), 1);

        let all = slots.take_all();
        let priorities: Vec<_> = all.iter().map(|b| b.priority).collect();
        assert_eq!(priorities, vec![AckPriority::High, AckPriority::Low]);
    }

    #[test]
    fn aged_batch_leaves_with_the_next_item() {
        let start = Utc::now();
        let mut slots = BatchSlots::new(10, Duration::from_millis(500));
        assert!(slots.push(item(AckPriority::Medium, 1, start), start).is_none());

        let late = start + chrono::Duration::milliseconds(750);
        let batch = slots
            .push(item(AckPriority::Medium, 2, late), late)
            .expect("aged batch should flush on insert");
        assert_eq!(batch.len(), 2);
        assert_eq!(slots.queued(AckPriority::Medium), 0);
    }
}
