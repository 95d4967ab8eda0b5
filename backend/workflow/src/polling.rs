//! OCR polling schedule.
//!
//! Waits between polls grow geometrically up to a cap. The schedule is a pure
//! function of the policy, so a replayed instance walks the same sequence of
//! `ocr.poll.{n}` / `ocr.wait.{n}` steps as the first execution.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PollPolicy {
    /// Wait after the first poll.
    pub initial_delay_ms: u64,
    pub factor: f64,
    pub max_delay_ms: u64,
    /// Upper bound on poll calls.
    pub max_attempts: u32,
    /// Upper bound on the sum of planned waits.
    pub max_total_wait_ms: u64,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            factor: 1.5,
            max_delay_ms: 15_000,
            max_attempts: 60,
            max_total_wait_ms: 10 * 60 * 1_000,
        }
    }
}

impl PollPolicy {
    /// Wait planned after poll `attempt` (1-indexed).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let ms = self.initial_delay_ms as f64 * self.factor.powi((attempt - 1) as i32);
        Duration::from_millis(ms.min(self.max_delay_ms as f64) as u64)
    }

    /// Planned waits between consecutive polls. Ends when either the attempt
    /// bound or the wait budget would be exceeded.
    pub fn waits(&self) -> PollWaits<'_> {
        PollWaits {
            policy: self,
            attempt: 0,
            waited: Duration::ZERO,
        }
    }

    /// Worst-case time spent waiting before giving up.
    pub fn total_budget(&self) -> Duration {
        self.waits().sum()
    }
}

pub struct PollWaits<'a> {
    policy: &'a PollPolicy,
    attempt: u32,
    waited: Duration,
}

impl Iterator for PollWaits<'_> {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        // A wait is only useful if another poll may follow it.
        if self.attempt + 1 >= self.policy.max_attempts {
            return None;
        }
        self.attempt += 1;
        let delay = self.policy.delay_after(self.attempt);
        let waited = self.waited + delay;
        if waited > Duration::from_millis(self.policy.max_total_wait_ms) {
            return None;
        }
        self.waited = waited;
        Some(delay)
    }
}
