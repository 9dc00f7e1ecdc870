//! High-latency activity windows
//!
//! While the local player is in an instance or similar activity, replies
//! take longer and the user should not be flooded with warnings. Both
//! concerns hang off the same flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::*;

#[derive(Debug)]
pub struct ActivityMonitor {
    active: AtomicBool,
    warning_shown: AtomicBool,
    multiplier: f64,
}

impl ActivityMonitor {
    pub fn new(multiplier: f64) -> Self {
        Self {
            active: AtomicBool::new(false),
            warning_shown: AtomicBool::new(false),
            multiplier,
        }
    }

    /// Returns true if this call opened the window.
    pub fn enter_activity(&self) -> bool {
        let entered = !self.active.swap(true, Ordering::SeqCst);
        if entered {
            info!("Entered high-latency activity, relaxing acknowledgment timeouts");
        }
        entered
    }

    pub fn leave_activity(&self) -> bool {
        let left = self.active.swap(false, Ordering::SeqCst);
        if left {
            self.warning_shown.store(false, Ordering::SeqCst);
            info!("Left high-latency activity");
        }
        left
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// `base` scaled by the activity multiplier while a window is open,
    /// saturating at [`Duration::MAX`].
    pub fn timeout_multiplier(&self, base: Duration) -> Duration {
        if !self.is_active() {
            return base;
        }
        let scaled = base.as_secs_f64() * self.multiplier;
        if scaled.is_nan() || scaled < 0.0 {
            return base;
        }
        Duration::try_from_secs_f64(scaled).unwrap_or(Duration::MAX)
    }

    /// True for exactly one caller per activity window.
    pub fn warn_once(&self) -> bool {
        self.is_active()
            && self
                .warning_shown
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
    }
}

impl Default for ActivityMonitor {
    fn default() -> Self {
        Self::new(3.0)
    }
}
