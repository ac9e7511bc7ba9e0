//! Failure backoff policies for the snapkeep scheduler loop
//!
//! The scheduler never gives up on a failed iteration; it only decides how
//! long to wait before trying again. This crate owns that decision so the
//! delay is a named, configurable policy instead of a constant buried in the
//! loop body.

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Delay used after a failed iteration when no policy is configured
pub const DEFAULT_FAILURE_DELAY: Duration = Duration::from_secs(5 * 60);

/// Errors produced while parsing a policy string
#[derive(Error, Debug, PartialEq, Eq)]
pub enum PolicyParseError {
    #[error("Unknown retry policy '{0}' (expected 'fixed' or 'exponential')")]
    UnknownPolicy(String),
    #[error("Invalid duration '{value}' in retry policy: expected seconds or '<n>ms'")]
    InvalidSeconds { value: String },
    #[error("Retry policy '{0}' is missing a duration")]
    MissingDuration(String),
    #[error("Retry delays must be greater than zero")]
    ZeroDelay,
}

/// How long to wait after consecutive failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Always wait the same amount of time
    Fixed(Duration),
    /// Double the wait after each consecutive failure, capped at `max`
    Exponential { initial: Duration, max: Duration },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::Fixed(DEFAULT_FAILURE_DELAY)
    }
}

/// Whole seconds render bare, anything finer as `<n>ms`
struct DelayToken(Duration);

impl fmt::Display for DelayToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.subsec_nanos() == 0 {
            write!(f, "{}", self.0.as_secs())
        } else {
            write!(f, "{}ms", self.0.as_millis())
        }
    }
}

impl fmt::Display for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryPolicy::Fixed(delay) => write!(f, "fixed:{}", DelayToken(*delay)),
            RetryPolicy::Exponential { initial, max } => {
                write!(
                    f,
                    "exponential:{}:{}",
                    DelayToken(*initial),
                    DelayToken(*max)
                )
            }
        }
    }
}

fn parse_delay(value: Option<&str>, policy: &str) -> Result<Duration, PolicyParseError> {
    let value = value.ok_or_else(|| PolicyParseError::MissingDuration(policy.to_string()))?;
    let invalid = || PolicyParseError::InvalidSeconds {
        value: value.to_string(),
    };

    let trimmed = value.trim();
    let delay = match trimmed.strip_suffix("ms") {
        Some(millis) => Duration::from_millis(millis.trim().parse().map_err(|_| invalid())?),
        None => Duration::from_secs(trimmed.parse().map_err(|_| invalid())?),
    };
    if delay.is_zero() {
        return Err(PolicyParseError::ZeroDelay);
    }
    Ok(delay)
}

impl FromStr for RetryPolicy {
    type Err = PolicyParseError;

    /// Parse `fixed:<delay>` or `exponential:<initial>:<max>`
    ///
    /// A delay is whole seconds (`300`) or milliseconds (`250ms`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().split(':');
        let name = parts.next().unwrap_or_default().to_ascii_lowercase();

        match name.as_str() {
            "fixed" => Ok(RetryPolicy::Fixed(parse_delay(parts.next(), s)?)),
            "exponential" => {
                let initial = parse_delay(parts.next(), s)?;
                let max = parse_delay(parts.next(), s)?;
                Ok(RetryPolicy::Exponential {
                    initial,
                    max: max.max(initial),
                })
            }
            _ => Err(PolicyParseError::UnknownPolicy(s.to_string())),
        }
    }
}

/// Stateful delay source fed by the scheduler after each iteration
#[derive(Debug)]
pub struct FailureBackoff {
    policy: RetryPolicy,
    exponential: Option<ExponentialBackoff>,
    consecutive_failures: u32,
}

impl FailureBackoff {
    pub fn new(policy: RetryPolicy) -> Self {
        let exponential = match policy {
            RetryPolicy::Fixed(_) => None,
            RetryPolicy::Exponential { initial, max } => Some(
                ExponentialBackoffBuilder::new()
                    .with_initial_interval(initial)
                    .with_max_interval(max)
                    .with_multiplier(2.0)
                    .with_randomization_factor(0.0)
                    .with_max_elapsed_time(None)
                    .build(),
            ),
        };

        Self {
            policy,
            exponential,
            consecutive_failures: 0,
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Number of failures recorded since the last success
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Record a failure and return how long to wait before the next attempt
    pub fn next_delay(&mut self) -> Duration {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);

        let delay = match (&self.policy, self.exponential.as_mut()) {
            (RetryPolicy::Fixed(delay), _) => *delay,
            (RetryPolicy::Exponential { max, .. }, Some(exp)) => {
                exp.next_backoff().unwrap_or(*max)
            }
            (RetryPolicy::Exponential { initial, .. }, None) => *initial,
        };

        debug!(
            failures = self.consecutive_failures,
            delay_secs = delay.as_secs_f64(),
            "Computed failure backoff"
        );
        delay
    }

    /// Record a success; the next failure starts from the initial delay again
    pub fn reset(&mut self) {
        self.consecutive_failures = 0;
        if let Some(exp) = self.exponential.as_mut() {
            exp.reset();
        }
    }
}

impl Default for FailureBackoff {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_is_fixed_five_minutes() {
        let mut backoff = FailureBackoff::default();
        assert_eq!(backoff.next_delay(), Duration::from_secs(300));
        assert_eq!(backoff.next_delay(), Duration::from_secs(300));
        assert_eq!(backoff.consecutive_failures(), 2);
    }

    #[test]
    fn test_exponential_doubles_and_caps() {
        let mut backoff = FailureBackoff::new(RetryPolicy::Exponential {
            initial: Duration::from_secs(10),
            max: Duration::from_secs(35),
        });

        assert_eq!(backoff.next_delay(), Duration::from_secs(10));
        assert_eq!(backoff.next_delay(), Duration::from_secs(20));
        assert_eq!(backoff.next_delay(), Duration::from_secs(35));
        assert_eq!(backoff.next_delay(), Duration::from_secs(35));
    }

    #[test]
    fn test_reset_restarts_sequence() {
        let mut backoff = FailureBackoff::new(RetryPolicy::Exponential {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
        });

        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();

        assert_eq!(backoff.consecutive_failures(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_parse_policies() {
        assert_eq!(
            "fixed:120".parse::<RetryPolicy>().unwrap(),
            RetryPolicy::Fixed(Duration::from_secs(120))
        );
        assert_eq!(
            "exponential:30:600".parse::<RetryPolicy>().unwrap(),
            RetryPolicy::Exponential {
                initial: Duration::from_secs(30),
                max: Duration::from_secs(600),
            }
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            "linear:5".parse::<RetryPolicy>(),
            Err(PolicyParseError::UnknownPolicy(_))
        ));
        assert!(matches!(
            "fixed".parse::<RetryPolicy>(),
            Err(PolicyParseError::MissingDuration(_))
        ));
        assert!(matches!(
            "fixed:abc".parse::<RetryPolicy>(),
            Err(PolicyParseError::InvalidSeconds { .. })
        ));
        assert_eq!("fixed:0".parse::<RetryPolicy>(), Err(PolicyParseError::ZeroDelay));
    }

    #[test]
    fn test_display_round_trips_through_parse() {
        let policy = RetryPolicy::Exponential {
            initial: Duration::from_secs(5),
            max: Duration::from_secs(50),
        };
        assert_eq!(policy.to_string().parse::<RetryPolicy>().unwrap(), policy);
    }

    #[test]
    fn test_sub_second_delays_render_as_millis() {
        let policy = RetryPolicy::Fixed(Duration::from_millis(20));
        assert_eq!(policy.to_string(), "fixed:20ms");
        assert_eq!(policy.to_string().parse::<RetryPolicy>().unwrap(), policy);

        let policy = RetryPolicy::Exponential {
            initial: Duration::from_millis(1500),
            max: Duration::from_secs(60),
        };
        assert_eq!(policy.to_string(), "exponential:1500ms:60");
        assert_eq!(policy.to_string().parse::<RetryPolicy>().unwrap(), policy);
        assert_eq!("fixed:0ms".parse::<RetryPolicy>(), Err(PolicyParseError::ZeroDelay));
    }
}
