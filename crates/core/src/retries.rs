//! The exponential back-off schedule for retryable failures.

use std::time::Duration;

/// Default delays in seconds: immediate, 30 s, 1 min, 1 h, 1 d, 5 d.
pub const DEFAULT_RETRY_DELAYS_SECS: [u64; 6] = [0, 30, 60, 3600, 86400, 432_000];

/// Default number of attempts before a file is permanently failed.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// A non-decreasing delay table indexed by a file's retry counter.
#[derive(Clone, Debug)]
pub struct RetrySchedule {
    delays: Vec<Duration>,
    max_retries: u32,
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self::new(&DEFAULT_RETRY_DELAYS_SECS, DEFAULT_MAX_RETRIES)
    }
}

impl RetrySchedule {
    /// Build from a table of delays in seconds. An empty table means every
    /// retry is immediate.
    pub fn new(delays_secs: &[u64], max_retries: u32) -> Self {
        Self {
            delays: delays_secs.iter().map(|s| Duration::from_secs(*s)).collect(),
            max_retries,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// The delay before the attempt following `retries` failures. Indexes
    /// past the end of the table clamp to the final entry.
    pub fn delay_for(&self, retries: u32) -> Duration {
        if self.delays.is_empty() {
            return Duration::ZERO;
        }
        let idx = (retries as usize).min(self.delays.len() - 1);
        self.delays[idx]
    }

    /// Whether a file with this retry count is out of attempts.
    pub fn exhausted(&self, retries: u32) -> bool {
        retries >= self.max_retries
    }
}
