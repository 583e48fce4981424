//! Exponential backoff with jitter.

use std::time::Duration;

/// `min(base * factor^attempt + jitter, cap)`, jitter uniform in `[0, max_jitter)`.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub factor: f64,
    pub cap: Duration,
    pub max_jitter: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            factor: 1.5,
            cap: Duration::from_secs(60),
            max_jitter: Duration::from_secs(1),
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            ..Self::default()
        }
    }

    /// Jitter-free component for `attempt`, already capped.
    pub fn deterministic(&self, attempt: u32) -> Duration {
        let exp = self.factor.powi(attempt.min(64) as i32);
        let millis = self.base.as_millis() as f64 * exp;
        let capped = millis.min(self.cap.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Wait before retry number `attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let jitter = self.max_jitter.mul_f64(rand::random::<f64>());
        (self.deterministic(attempt) + jitter).min(self.cap)
    }
}
