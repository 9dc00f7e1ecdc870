//! Exponential backoff for failed sends

use super::types::Outbound;
use crate::clock::to_chrono;
use crate::config::AcknowledgmentConfiguration;
use crate::types::AckPriority;
use chrono::{DateTime, Utc};
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

/// Share of the computed delay that may be added as jitter.
pub const JITTER_FACTOR: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn from_config(config: &AcknowledgmentConfiguration) -> Self {
        Self {
            base_delay: Duration::from_millis(config.base_retry_delay_ms),
            max_delay: Duration::from_millis(config.max_retry_delay_ms),
            max_attempts: config.max_retry_attempts,
        }
    }

    /// `min(base * 2^retry_count, max)`
    pub fn delay_without_jitter(&self, retry_count: u32) -> Duration {
        let factor = 2u32.checked_pow(retry_count).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Uniform in `[0, JITTER_FACTOR * delay]`.
    pub fn jitter_for<R: Rng + ?Sized>(&self, delay: Duration, rng: &mut R) -> Duration {
        let ceiling = delay.as_nanos() as f64 * JITTER_FACTOR;
        if ceiling < 1.0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(rng.gen_range(0..=ceiling as u64))
    }

    pub fn delay(&self, retry_count: u32) -> Duration {
        let delay = self.delay_without_jitter(retry_count);
        delay + self.jitter_for(delay, &mut rand::thread_rng())
    }

    pub fn can_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_attempts
    }
}

#[derive(Debug, Clone)]
struct ScheduledRetry {
    item: Outbound,
    next_retry_at: DateTime<Utc>,
}

/// Retries waiting for their backoff to elapse, one queue per priority.
#[derive(Debug, Default)]
pub struct RetryQueue {
    queues: HashMap<AckPriority, VecDeque<ScheduledRetry>>,
}

impl RetryQueue {
    pub fn schedule(&mut self, item: Outbound, next_retry_at: DateTime<Utc>) {
        self.queues
            .entry(item.priority)
            .or_default()
            .push_back(ScheduledRetry {
                item,
                next_retry_at,
            });
    }

    /// Removes and returns every item whose backoff elapsed, highest
    /// priority first.
    pub fn take_ready(&mut self, now: DateTime<Utc>) -> Vec<Outbound> {
        let mut ready = Vec::new();
        for priority in AckPriority::ALL {
            let Some(queue) = self.queues.get_mut(&priority) else {
                continue;
            };
            let (due, waiting): (VecDeque<_>, VecDeque<_>) =
                queue.drain(..).partition(|r| r.next_retry_at <= now);
            *queue = waiting;
            ready.extend(due.into_iter().map(|r| r.item));
        }
        ready
    }

    pub fn len(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Deadline for a retry scheduled at `now`.
pub fn retry_deadline(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    now + to_chrono(delay)
}
