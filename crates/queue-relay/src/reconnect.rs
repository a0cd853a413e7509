//! # Reconnect Policy Module
//!
//! Delay schedule used by the event-driven client between losing a broker
//! connection and trying to open a new one.
//!
//! The default is a fixed two second delay. Exponential backoff with jitter is
//! available for deployments where many clients reconnect to one broker at once.

use rand::Rng;
use std::time::Duration;

/// Delay schedule between reconnect attempts
///
/// # Examples
///
/// ```rust
/// use queue_relay::reconnect::ReconnectPolicy;
/// use std::time::Duration;
///
/// let policy = ReconnectPolicy::default();
/// assert_eq!(policy.delay_for(0), Duration::from_secs(2));
/// assert_eq!(policy.delay_for(7), Duration::from_secs(2));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum ReconnectPolicy {
    /// Always wait the same amount of time
    Fixed { delay: Duration },

    /// Grow the delay by `multiplier` per consecutive failed attempt, capped at `max_delay`
    ExponentialBackoff {
        initial_delay: Duration,
        max_delay: Duration,
        multiplier: f64,
        /// Jitter range as a fraction of the delay (0.25 = ±25%)
        jitter_percent: f64,
    },
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::fixed(Self::DEFAULT_DELAY)
    }
}

impl ReconnectPolicy {
    /// Delay used when nothing else is configured
    pub const DEFAULT_DELAY: Duration = Duration::from_secs(2);

    pub fn fixed(delay: Duration) -> Self {
        Self::Fixed { delay }
    }

    /// Exponential backoff with ±25% jitter
    pub fn exponential(initial_delay: Duration, max_delay: Duration, multiplier: f64) -> Self {
        Self::ExponentialBackoff {
            initial_delay,
            max_delay,
            multiplier,
            jitter_percent: 0.25,
        }
    }

    /// Set custom jitter percentage (0.0 to 1.0); no effect on fixed delays
    pub fn with_jitter_percent(self, percent: f64) -> Self {
        match self {
            Self::ExponentialBackoff {
                initial_delay,
                max_delay,
                multiplier,
                ..
            } => Self::ExponentialBackoff {
                initial_delay,
                max_delay,
                multiplier,
                jitter_percent: percent.clamp(0.0, 1.0),
            },
            fixed => fixed,
        }
    }

    /// Disable jitter
    pub fn without_jitter(self) -> Self {
        self.with_jitter_percent(0.0)
    }

    /// Delay before reconnect attempt number `attempt` (0-based, reset after
    /// every successful connection)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self {
            Self::Fixed { delay } => *delay,
            Self::ExponentialBackoff {
                initial_delay,
                max_delay,
                multiplier,
                jitter_percent,
            } => {
                let exponent = attempt.min(i32::MAX as u32) as i32;
                let base_secs = initial_delay.as_secs_f64() * multiplier.powi(exponent);
                let capped_secs = base_secs.min(max_delay.as_secs_f64());

                let final_secs = if *jitter_percent > 0.0 {
                    add_jitter(capped_secs, *jitter_percent)
                } else {
                    capped_secs
                };

                Duration::from_secs_f64(final_secs)
            }
        }
    }
}

/// Random variation in range [delay * (1-jitter), delay * (1+jitter)]
fn add_jitter(delay_secs: f64, jitter_percent: f64) -> f64 {
    let jitter_range = delay_secs * jitter_percent;
    let jitter = rand::rng().random_range(-jitter_range..=jitter_range);

    (delay_secs + jitter).max(0.0)
}

#[cfg(test)]
#[path = "reconnect_tests.rs"]
mod tests;
