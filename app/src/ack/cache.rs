//! Bounded cache of the newest outcome per peer

use super::types::{Acknowledgment, CachedOutcome};
use crate::clock::to_chrono;
use crate::types::PeerId;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::time::Duration;

/// Oldest entry at the front.
#[derive(Debug)]
pub struct OutcomeCache {
    entries: VecDeque<CachedOutcome>,
    max_size: usize,
    expiration: Duration,
}

impl OutcomeCache {
    pub fn new(max_size: usize, expiration: Duration) -> Self {
        Self {
            entries: VecDeque::new(),
            max_size,
            expiration,
        }
    }

    /// Replaces whatever was cached for the same peer.
    pub fn insert(&mut self, acknowledgment: Acknowledgment, now: DateTime<Utc>) {
        self.entries
            .retain(|e| e.acknowledgment.recipient != acknowledgment.recipient);
        self.entries.push_back(CachedOutcome {
            acknowledgment,
            cached_at: now,
        });
        while self.entries.len() > self.max_size {
            self.entries.pop_front();
        }
    }

    pub fn get(&self, peer: &PeerId) -> Option<&CachedOutcome> {
        self.entries
            .iter()
            .find(|e| e.acknowledgment.recipient == *peer)
    }

    /// Purges expired entries, then trims to the size cap oldest-first.
    pub fn cleanup(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        let cutoff = now - to_chrono(self.expiration);
        self.entries.retain(|e| e.cached_at >= cutoff);
        while self.entries.len() > self.max_size {
            self.entries.pop_front();
        }
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CachedOutcome> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::AckId;
    use crate::types::{AckPriority, DataHash};

    fn ack(peer: &str, n: u64, at: DateTime<Utc>) -> Acknowledgment {
        Acknowledgment::new(
            AckId::compose(1, n, 0),
            PeerId::from(peer),
            DataHash::new("H"),
            AckPriority::Medium,
            at,
        )
    }

    #[test]
    fn keeps_only_newest_outcome_per_peer() {
        let now = Utc::now();
        let mut cache = OutcomeCache::new(10, Duration::from_secs(60));
        cache.insert(ack("a", 1, now), now);
        cache.insert(ack("b", 2, now), now);
        cache.insert(ack("a", 3, now), now);

        assert_eq!(cache.len(), 2);
        let a = cache.get(&PeerId::from("a")).unwrap();
        assert_eq!(a.acknowledgment.id, AckId::compose(1, 3, 0));
    }

    #[test]
    fn cleanup_bounds_age_and_size() {
        let start = Utc::now();
        let mut cache = OutcomeCache::new(3, Duration::from_secs(30 * 60));
        for (i, peer) in ["a", "b", "c"].iter().enumerate() {
            let at = start + chrono::Duration::minutes(i as i64 * 10);
            cache.insert(ack(peer, i as u64, at), at);
        }

        let now = start + chrono::Duration::minutes(35);
        let removed = cache.cleanup(now);
        assert_eq!(removed, 1);
        assert!(cache.get(&PeerId::from("a")).is_none());

        let cutoff = now - chrono::Duration::minutes(30);
        assert!(cache.len() <= 3);
        assert!(cache.iter().all(|e| e.cached_at >= cutoff));
    }

    #[test]
    fn insert_evicts_oldest_past_cap() {
        let now = Utc::now();
        let mut cache = OutcomeCache::new(2, Duration::from_secs(60));
        cache.insert(ack("a", 1, now), now);
        cache.insert(ack("b", 2, now), now);
        cache.insert(ack("c", 3, now), now);

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&PeerId::from("a")).is_none());
        assert!(cache.get(&PeerId::from("c")).is_some());
    }
}
