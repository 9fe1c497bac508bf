//! Reconnect Backoff
//!
//! Doubling delay with a hard ceiling. The policy is pure: callers keep the
//! current delay and ask for the next one.

use std::time::Duration;

pub const DEFAULT_BACKOFF_FLOOR: Duration = Duration::from_secs(1);
pub const DEFAULT_BACKOFF_CEILING: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    floor: Duration,
    ceiling: Duration,
}

impl BackoffPolicy {
    /// Create a policy. A ceiling below the floor is raised to the floor.
    pub fn new(floor: Duration, ceiling: Duration) -> Self {
        Self {
            floor,
            ceiling: ceiling.max(floor),
        }
    }

    pub fn floor(&self) -> Duration {
        self.floor
    }

    pub fn ceiling(&self) -> Duration {
        self.ceiling
    }

    /// Delay to use after `current` has been slept
    pub fn next(&self, current: Duration) -> Duration {
        current
            .checked_mul(2)
            .unwrap_or(self.ceiling)
            .clamp(self.floor, self.ceiling)
    }

    /// Delay to use at the start of a new failure run
    pub fn reset(&self) -> Duration {
        self.floor
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_BACKOFF_FLOOR, DEFAULT_BACKOFF_CEILING)
    }
}
