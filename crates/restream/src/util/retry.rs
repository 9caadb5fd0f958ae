use std::{collections::VecDeque, time::Duration};

use tokio::time::Instant;

/// Exponential backoff bounded by a ceiling.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    ceiling: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, ceiling: Duration) -> Self {
        Self {
            base,
            ceiling,
            attempt: 0,
        }
    }

    /// Delay before the next attempt. Each call doubles the following delay.
    pub fn next_delay(&mut self) -> Duration {
        let factor = 1u32.checked_shl(self.attempt).unwrap_or(u32::MAX);
        self.attempt = self.attempt.saturating_add(1);
        self.base.saturating_mul(factor).min(self.ceiling)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Counts hard failures inside a sliding time window.
#[derive(Debug, Clone)]
pub struct RetryBudget {
    limit: u32,
    window: Duration,
    failures: VecDeque<Instant>,
}

impl RetryBudget {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit: limit.max(1),
            window,
            failures: VecDeque::new(),
        }
    }

    /// Record a failure. Returns `true` once the budget is exhausted.
    pub fn fail(&mut self) -> bool {
        let now = Instant::now();
        while let Some(first) = self.failures.front() {
            if now.duration_since(*first) > self.window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
        self.failures.push_back(now);
        self.failures.len() as u32 >= self.limit
    }

    pub fn failures(&self) -> u32 {
        self.failures.len() as u32
    }

    pub fn reset(&mut self) {
        self.failures.clear();
    }
}
