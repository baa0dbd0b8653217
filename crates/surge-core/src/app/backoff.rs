//! Backoff between local attempts of one dispatch unit.

use std::time::Duration;

/// Linear backoff: the wait after attempt `n` is `base * n`.
///
/// Example with base = 500ms:
/// - after attempt 1: 500ms
/// - after attempt 2: 1s
/// - after attempt 3: 1.5s
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinearBackoff {
    pub base: Duration,
}

impl LinearBackoff {
    pub fn new(base: Duration) -> Self {
        Self { base }
    }

    /// `attempt` is 1-indexed; 0 is treated as 1.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base.saturating_mul(attempt.max(1))
    }
}
