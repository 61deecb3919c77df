//! Retry policies and backoff calculation

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Fixed failure taxonomy used to select a retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Connectivity failures: resets, DNS, unreachable hosts
    Network,
    /// Credential and authorization failures
    Auth,
    /// Local resource failures: disk, memory, file handles
    System,
    /// Explicit throttling by a remote service
    RateLimit,
    /// Transient conditions expected to clear on their own
    Temporary,
    /// Anything the classifier chain could not place
    #[default]
    Unknown,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Network => write!(f, "network"),
            Self::Auth => write!(f, "auth"),
            Self::System => write!(f, "system"),
            Self::RateLimit => write!(f, "rate_limit"),
            Self::Temporary => write!(f, "temporary"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

impl ErrorClass {
    /// All classes, for building policy tables
    pub const ALL: [ErrorClass; 6] = [
        Self::Network,
        Self::Auth,
        Self::System,
        Self::RateLimit,
        Self::Temporary,
        Self::Unknown,
    ];

    /// Default retry policy for this class
    pub fn default_policy(&self) -> RetryPolicy {
        match self {
            Self::Network => RetryPolicy {
                max_attempts: 5,
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(60),
                backoff: Backoff::Exponential,
                multiplier: 2.0,
                jitter: true,
            },
            Self::Auth => RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_secs(5),
                max_delay: Duration::from_secs(60),
                backoff: Backoff::Exponential,
                multiplier: 2.0,
                jitter: false,
            },
            Self::System => RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::from_secs(10),
                max_delay: Duration::from_secs(120),
                backoff: Backoff::Exponential,
                multiplier: 1.5,
                jitter: false,
            },
            Self::RateLimit => RetryPolicy {
                max_attempts: 10,
                base_delay: Duration::from_secs(30),
                max_delay: Duration::from_secs(300),
                backoff: Backoff::Linear,
                multiplier: 1.0,
                jitter: true,
            },
            Self::Temporary => RetryPolicy {
                max_attempts: 5,
                base_delay: Duration::from_secs(2),
                max_delay: Duration::from_secs(60),
                backoff: Backoff::Exponential,
                multiplier: 1.5,
                jitter: true,
            },
            Self::Unknown => RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_secs(5),
                max_delay: Duration::from_secs(60),
                backoff: Backoff::Exponential,
                multiplier: 2.0,
                jitter: false,
            },
        }
    }
}

/// Shape of the delay curve between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    /// base * attempt
    Linear,
    /// base * multiplier^(attempt - 1)
    Exponential,
    /// base, every time
    Fixed,
}

/// Per-class retry policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum attempts before giving up
    pub max_attempts: u32,

    /// Delay before the second attempt
    pub base_delay: Duration,

    /// Upper bound on any computed delay
    pub max_delay: Duration,

    /// Delay curve shape
    pub backoff: Backoff,

    /// Growth factor for exponential backoff
    pub multiplier: f64,

    /// Scale the delay by a uniform factor in [0.5, 1.0]
    pub jitter: bool,
}

impl RetryPolicy {
    /// Compute the delay to apply after the given attempt (1-indexed)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let base = self.base_delay.as_secs_f64();
        let raw = match self.backoff {
            Backoff::Linear => base * attempt as f64,
            Backoff::Exponential => base * self.multiplier.powi((attempt - 1) as i32),
            Backoff::Fixed => base,
        };
        let capped = raw.min(self.max_delay.as_secs_f64());

        let scaled = if self.jitter {
            let factor = rand::rng().random_range(0.5..=1.0);
            debug!(attempt, capped, factor, "RetryPolicy::delay_for: applying jitter");
            capped * factor
        } else {
            capped
        };

        Duration::from_secs_f64(scaled.max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exponential(base_secs: f64, multiplier: f64) -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_secs_f64(base_secs),
            max_delay: Duration::from_secs(60),
            backoff: Backoff::Exponential,
            multiplier,
            jitter: false,
        }
    }

    #[test]
    fn test_exponential_sequence() {
        let policy = exponential(1.0, 2.0);
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(4), Duration::from_secs(8));
    }

    #[test]
    fn test_exponential_capped_at_max_delay() {
        let mut policy = exponential(1.0, 2.0);
        policy.max_delay = Duration::from_secs(5);
        assert_eq!(policy.delay_for(10), Duration::from_secs(5));
    }

    #[test]
    fn test_linear_sequence() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(300),
            backoff: Backoff::Linear,
            multiplier: 1.0,
            jitter: false,
        };
        assert_eq!(policy.delay_for(1), Duration::from_secs(30));
        assert_eq!(policy.delay_for(2), Duration::from_secs(60));
        assert_eq!(policy.delay_for(10), Duration::from_secs(300));
        // 11 * 30 = 330, capped
        assert_eq!(policy.delay_for(11), Duration::from_secs(300));
    }

    #[test]
    fn test_fixed_sequence() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(7),
            max_delay: Duration::from_secs(60),
            backoff: Backoff::Fixed,
            multiplier: 1.0,
            jitter: false,
        };
        assert_eq!(policy.delay_for(1), Duration::from_secs(7));
        assert_eq!(policy.delay_for(5), Duration::from_secs(7));
    }

    #[test]
    fn test_jitter_stays_in_half_to_full_range() {
        let policy = RetryPolicy {
            jitter: true,
            ..exponential(4.0, 2.0)
        };
        for _ in 0..200 {
            let delay = policy.delay_for(1).as_secs_f64();
            assert!((2.0..=4.0).contains(&delay), "jittered delay out of range: {}", delay);
        }
    }

    #[test]
    fn test_default_policy_table() {
        let network = ErrorClass::Network.default_policy();
        assert_eq!(network.max_attempts, 5);
        assert_eq!(network.base_delay, Duration::from_secs(1));
        assert_eq!(network.backoff, Backoff::Exponential);

        let rate_limit = ErrorClass::RateLimit.default_policy();
        assert_eq!(rate_limit.max_attempts, 10);
        assert_eq!(rate_limit.base_delay, Duration::from_secs(30));
        assert_eq!(rate_limit.backoff, Backoff::Linear);

        let system = ErrorClass::System.default_policy();
        assert_eq!(system.max_attempts, 2);
        assert_eq!(system.multiplier, 1.5);

        let unknown = ErrorClass::Unknown.default_policy();
        assert_eq!(unknown.max_attempts, 3);
        assert_eq!(unknown.base_delay, Duration::from_secs(5));
    }

    #[test]
    fn test_error_class_display() {
        assert_eq!(ErrorClass::Network.to_string(), "network");
        assert_eq!(ErrorClass::RateLimit.to_string(), "rate_limit");
        assert_eq!(ErrorClass::Unknown.to_string(), "unknown");
    }
}
