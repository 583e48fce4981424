//! Sliding call window used to enforce requests-per-minute and burst limits.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

pub const MINUTE: Duration = Duration::from_secs(60);
pub const BURST_SPAN: Duration = Duration::from_secs(1);

/// Dispatch timestamps from the last minute, oldest first.
#[derive(Debug, Default)]
pub struct RateWindow {
    calls: VecDeque<Instant>,
}

impl RateWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop timestamps older than one minute.
    pub fn prune(&mut self, now: Instant) {
        while let Some(oldest) = self.calls.front() {
            if now.saturating_duration_since(*oldest) >= MINUTE {
                self.calls.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn record(&mut self, now: Instant) {
        self.calls.push_back(now);
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    /// `None` if a call may be dispatched now, otherwise the instant to recheck.
    ///
    /// Assumes `prune(now)` has already run.
    pub fn next_slot(&self, now: Instant, per_minute: usize, burst: usize) -> Option<Instant> {
        if per_minute > 0 && self.calls.len() >= per_minute {
            let idx = self.calls.len() - per_minute;
            return Some(self.calls[idx] + MINUTE);
        }

        if burst > 0 {
            let recent: Vec<_> = self
                .calls
                .iter()
                .rev()
                .take_while(|t| now.saturating_duration_since(**t) < BURST_SPAN)
                .collect();
            if recent.len() >= burst {
                // `recent` is newest first; the slot frees when the burst-th newest ages out.
                return Some(*recent[burst - 1] + BURST_SPAN);
            }
        }

        None
    }
}
