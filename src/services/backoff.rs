//! Capped exponential backoff.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Option<Duration>,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            current: None,
        }
    }

    /// Delay to wait before the next retry: `initial`, then doubling up to `max`.
    pub fn next_delay(&mut self) -> Duration {
        let next = match self.current {
            None => self.initial,
            Some(prev) => prev.saturating_mul(2).min(self.max),
        };
        self.current = Some(next);
        next
    }

    pub fn reset(&mut self) {
        self.current = None;
    }

    /// Whether any failure has been recorded since the last reset.
    pub fn is_backing_off(&self) -> bool {
        self.current.is_some()
    }
}
