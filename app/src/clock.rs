//! Injectable time source
//!
//! Every deadline in the subsystem (batch age, send timeouts, retry schedules,
//! cache expiry, session sweeps) is computed against a [`Clock`] so tests can
//! drive time by hand instead of racing real timers.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> DateTime<Utc>;
}

pub type SharedClock = Arc<dyn Clock>;

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Starts at the current wall-clock time.
    pub fn starting_now() -> Self {
        Self::new(Utc::now())
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += to_chrono(by);
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Converts a std duration, clamping absurd values to a century.
pub fn to_chrono(duration: Duration) -> chrono::Duration {
    let century = chrono::Duration::days(36_500);
    chrono::Duration::from_std(duration)
        .map(|d| d.min(century))
        .unwrap_or(century)
}

/// Time between `earlier` and `later`, zero if `later` is not after `earlier`.
pub fn elapsed_between(earlier: DateTime<Utc>, later: DateTime<Utc>) -> Duration {
    (later - earlier).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_moves_only_when_advanced() {
        let clock = ManualClock::starting_now();
        let start = clock.now();
        assert_eq!(clock.now(), start);

        clock.advance(Duration::from_millis(1500));
        assert_eq!(elapsed_between(start, clock.now()), Duration::from_millis(1500));
    }

    #[test]
    fn elapsed_is_zero_for_reversed_instants() {
        let clock = ManualClock::starting_now();
        let start = clock.now();
        clock.advance(Duration::from_secs(5));
        assert_eq!(elapsed_between(clock.now(), start), Duration::ZERO);
    }

    #[test]
    fn oversized_durations_clamp_to_a_century() {
        let century = chrono::Duration::days(36_500);
        assert_eq!(to_chrono(Duration::MAX), century);
        assert_eq!(to_chrono(Duration::from_secs(10_000_000_000_000)), century);
        assert_eq!(to_chrono(Duration::from_secs(90)), chrono::Duration::seconds(90));

        let clock = ManualClock::starting_now();
        assert!(clock.now() + to_chrono(Duration::MAX) > clock.now());
    }
}
