use std::time::Duration;

#[cfg(feature = "serialization")]
use serde::{Deserialize, Serialize};

/// Trait that controls how long an endpoint waits before re-attempting a failed transaction
///
/// Each worker owns its own instance. The delay is applied between attempts of the
/// same request; the number of attempts is bounded by the request's retry budget.
pub trait RetryStrategy: Send {
    /// Reset internal state. Called when a transaction completes at the transport level
    fn reset(&mut self);
    /// Return the delay before re-attempting after a transport level failure
    fn after_failed_attempt(&mut self) -> Duration;
}

/// Return the default [`RetryStrategy`] which retries immediately
pub fn default_retry_strategy() -> Box<dyn RetryStrategy> {
    immediate_retry_strategy()
}

/// Return a [`RetryStrategy`] that never waits between attempts
pub fn immediate_retry_strategy() -> Box<dyn RetryStrategy> {
    Box::new(Immediate)
}

/// Return a [`RetryStrategy`] that doubles on failure up to a maximum value
pub fn doubling_retry_strategy(min: Duration, max: Duration) -> Box<dyn RetryStrategy> {
    Doubling::create(min, max)
}

/// Serializable description of a [`RetryStrategy`]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serialization", serde(rename_all = "snake_case"))]
pub enum RetryConfig {
    /// retry right away
    #[default]
    Immediate,
    /// wait `min`, doubling after every consecutive failure up to `max`
    Doubling {
        /// first delay
        #[cfg_attr(feature = "serialization", serde(with = "humantime_serde"))]
        min: Duration,
        /// largest delay
        #[cfg_attr(feature = "serialization", serde(with = "humantime_serde"))]
        max: Duration,
    },
}

impl RetryConfig {
    /// Create a new strategy instance for one endpoint
    pub fn create(&self) -> Box<dyn RetryStrategy> {
        match *self {
            RetryConfig::Immediate => immediate_retry_strategy(),
            RetryConfig::Doubling { min, max } => doubling_retry_strategy(min, max),
        }
    }
}

struct Immediate;

impl RetryStrategy for Immediate {
    fn reset(&mut self) {}

    fn after_failed_attempt(&mut self) -> Duration {
        Duration::ZERO
    }
}

struct Doubling {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl Doubling {
    pub(crate) fn create(min: Duration, max: Duration) -> Box<dyn RetryStrategy> {
        Box::new(Doubling {
            min,
            max,
            current: min,
        })
    }
}

impl RetryStrategy for Doubling {
    fn reset(&mut self) {
        self.current = self.min;
    }

    fn after_failed_attempt(&mut self) -> Duration {
        let ret = self.current;
        self.current = std::cmp::min(2 * self.current, self.max);
        ret
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubling_saturates_at_max_and_resets() {
        let mut strategy =
            doubling_retry_strategy(Duration::from_millis(100), Duration::from_millis(350));

        assert_eq!(strategy.after_failed_attempt(), Duration::from_millis(100));
        assert_eq!(strategy.after_failed_attempt(), Duration::from_millis(200));
        assert_eq!(strategy.after_failed_attempt(), Duration::from_millis(350));
        assert_eq!(strategy.after_failed_attempt(), Duration::from_millis(350));

        strategy.reset();
        assert_eq!(strategy.after_failed_attempt(), Duration::from_millis(100));
    }

    #[test]
    fn default_strategy_does_not_wait() {
        let mut strategy = default_retry_strategy();
        assert_eq!(strategy.after_failed_attempt(), Duration::ZERO);
        assert_eq!(strategy.after_failed_attempt(), Duration::ZERO);
    }
}
