//! Exponential backoff with jitter, used independently by each of the
//! orchestrator's peer loops.

use rand::Rng;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const BASE_SECS: f64 = 1.0;
const MAX_SECS: f64 = 60.0;
const JITTER_LOW: f64 = 0.75;
const JITTER_HIGH: f64 = 1.25;

/// Tracks consecutive failures for one loop and produces the next sleep
/// duration. `Reset` on success; `Next` doubles the prior interval (capped)
/// and multiplies by a uniform jitter factor.
#[derive(Debug)]
pub struct Backoff {
    consecutive_failures: u32,
}

impl Backoff {
    pub fn new() -> Self {
        Backoff {
            consecutive_failures: 0,
        }
    }

    /// Returns the next sleep duration and advances the internal failure
    /// count. Call this once per failed iteration.
    pub fn next(&mut self) -> Duration {
        let exponent = self.consecutive_failures;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let doubled = (BASE_SECS * 2f64.powi(exponent as i32)).min(MAX_SECS);
        let jitter = rand::thread_rng().gen_range(JITTER_LOW..JITTER_HIGH);
        Duration::from_secs_f64(doubled * jitter)
    }

    /// Clears the failure count. Call this after a successful iteration.
    pub fn reset(&mut self) {
        self.consecutive_failures = 0;
    }

    /// Sleeps for `self.next()`, returning early if `token` is cancelled.
    /// Returns `true` if the sleep completed, `false` if cancelled first.
    pub async fn sleep_cancellable(&mut self, token: &CancellationToken) -> bool {
        let dur = self.next();
        tokio::select! {
            _ = tokio::time::sleep(dur) => true,
            _ = token.cancelled() => false,
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_and_caps() {
        let mut b = Backoff::new();
        let mut prev_upper = 0.0;
        for _ in 0..10 {
            let d = b.next().as_secs_f64();
            // Allow for jitter: the value must never exceed 1.25x the capped max.
            assert!(d <= MAX_SECS * JITTER_HIGH + 0.001);
            assert!(d >= 0.0);
            prev_upper = prev_upper.max(d);
        }
        assert!(prev_upper > BASE_SECS);
    }

    #[test]
    fn reset_restarts_from_base() {
        let mut b = Backoff::new();
        b.next();
        b.next();
        b.next();
        b.reset();
        let d = b.next().as_secs_f64();
        assert!(d <= BASE_SECS * JITTER_HIGH + 0.001);
        assert!(d >= BASE_SECS * JITTER_LOW - 0.001);
    }
}
