//! Repair backoff for tunnel links
//!
//! Additive jitter around a fixed base: `base + base * jitter * U[0,1)`.
//! The delay does not grow with the attempt count; repairs are unlimited.

use rand::Rng;
use std::time::Duration;
use tracing::debug;

/// Repair delay configuration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RepairBackoff {
    /// Fixed base delay
    pub base: Duration,
    /// Jitter factor (0.0 = no jitter)
    pub jitter: f64,
}

impl RepairBackoff {
    pub fn new(base: Duration, jitter: f64) -> Self {
        Self {
            base,
            jitter: jitter.max(0.0),
        }
    }

    /// Delay before the next relaunch
    pub fn next_delay(&self) -> Duration {
        let sample = rand::thread_rng().gen::<f64>();
        let delay = self.delay_for(sample);
        debug!("Repair backoff: {:?} (base {:?})", delay, self.base);
        delay
    }

    /// Delay for a given uniform sample in `[0, 1)`
    pub fn delay_for(&self, sample: f64) -> Duration {
        let sample = sample.clamp(0.0, 1.0);
        self.base + self.base.mul_f64(self.jitter * sample)
    }
}
