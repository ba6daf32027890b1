//! Restart and reconnect backoff schedules.
//!
//! One schedule serves both recovery paths: projection restarts after a
//! stream or handler failure, and transport reconnects after a disconnect.
//! Delays grow exponentially from `min_backoff` by `factor` per attempt,
//! cap at `max_backoff`, and carry a random jitter so a fleet of workers
//! restarting together does not reconnect in lockstep.

use rand::Rng;
use std::time::Duration;

/// Fraction of the base delay added as random jitter.
const JITTER_FACTOR: f64 = 0.2;

/// Exponential backoff schedule.
///
/// # Schedule (defaults: min 200 ms, max 5 s, factor 1.1)
///
/// ```text
/// Attempt  Base delay
/// -------  ----------
/// 1        200ms
/// 2        220ms
/// 3        242ms
/// ...
/// 35       ~5s (capped)
/// ```
#[derive(Debug, Clone)]
pub struct RestartBackoff {
    min_backoff: Duration,
    max_backoff: Duration,
    factor: f64,
}

impl RestartBackoff {
    pub fn new(min_backoff: Duration, max_backoff: Duration, factor: f64) -> Self {
        Self {
            min_backoff,
            max_backoff,
            factor: if factor < 1.0 { 1.0 } else { factor },
        }
    }

    pub fn min_backoff(&self) -> Duration {
        self.min_backoff
    }

    pub fn max_backoff(&self) -> Duration {
        self.max_backoff
    }

    /// Base delay for a 1-indexed attempt, without jitter.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt <= 1 {
            return self.min_backoff;
        }
        let multiplier = self.factor.powi((attempt - 1) as i32);
        let delay = Duration::from_secs_f64(self.min_backoff.as_secs_f64() * multiplier);
        std::cmp::min(delay, self.max_backoff)
    }

    /// Delay for an attempt with jitter applied.
    ///
    /// Never below the base delay; at most `base * (1 + JITTER_FACTOR)`.
    pub fn next_delay(&self, attempt: usize) -> Duration {
        let base = self.delay_for_attempt(attempt);
        let jitter = rand::thread_rng().gen_range(0.0..JITTER_FACTOR);
        Duration::from_secs_f64(base.as_secs_f64() * (1.0 + jitter))
    }
}

impl Default for RestartBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(200), Duration::from_secs(5), 1.1)
    }
}
