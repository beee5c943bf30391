//! Retry delay schedules
//!
//! Two schedules cover every retry site: a fixed pause between connect
//! attempts, and the doubling per-partition backoff the fixer applies to
//! failed streams (1s, 2s, 4s, ... capped at 64s, reset on success).

use std::time::Duration;

use serde::Deserialize;

/// First step of the partition backoff schedule
pub const BACKOFF_FLOOR: Duration = Duration::from_secs(1);

/// Ceiling of the partition backoff schedule
pub const BACKOFF_CAP: Duration = Duration::from_secs(64);

/// Delay schedule between repeated attempts of one operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Delay {
    /// Same pause before every attempt
    Fixed { delay: Duration },
    /// `base * 2^(attempt-1)`, capped
    Exponential { base: Duration, cap: Duration },
}

impl Delay {
    /// No pause between attempts
    pub const NONE: Delay = Delay::Fixed {
        delay: Duration::ZERO,
    };

    pub fn fixed(delay: Duration) -> Self {
        Self::Fixed { delay }
    }

    /// Pause before attempt `attempt` (1-based)
    pub fn calculate(&self, attempt: u32) -> Duration {
        match self {
            Self::Fixed { delay } => *delay,
            Self::Exponential { base, cap } => {
                let shift = attempt.saturating_sub(1).min(32);
                base.saturating_mul(1u32 << shift.min(31)).min(*cap)
            }
        }
    }
}

/// Next step of the per-partition backoff schedule
///
/// Zero means "no pending backoff"; the first failure starts at
/// [`BACKOFF_FLOOR`] and each further failure doubles up to [`BACKOFF_CAP`].
pub fn next_partition_backoff(current: Duration) -> Duration {
    if current.is_zero() {
        BACKOFF_FLOOR
    } else {
        current.saturating_mul(2).min(BACKOFF_CAP)
    }
}

#[cfg(test)]
#[path = "delay_test.rs"]
mod tests;
