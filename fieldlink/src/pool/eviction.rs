use std::time::Duration;

#[cfg(feature = "serialization")]
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::pool::connection::{ConnectionHealth, ConnectionState};

/// Thresholds that decide when a pooled connection is discarded instead of reused
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serialization", serde(default))]
pub struct EvictionPolicy {
    /// idle connections older than this are closed
    #[cfg_attr(feature = "serialization", serde(with = "humantime_serde"))]
    pub max_idle: Duration,
    /// connections with more consecutive errors than this are closed
    pub max_consecutive_errors: u32,
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        Self {
            max_idle: Duration::from_secs(60),
            max_consecutive_errors: 0,
        }
    }
}

/// Why a connection was discarded
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EvictionReason {
    /// explicitly flagged as unusable
    Poisoned(String),
    /// too many consecutive communication errors
    TooManyErrors(u32),
    /// the transport failed or was closed
    Broken,
    /// unused for longer than the idle limit
    Idle(Duration),
    /// the owning pool was disposed
    Disposed,
}

impl std::fmt::Display for EvictionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EvictionReason::Poisoned(reason) => write!(f, "poisoned ({reason})"),
            EvictionReason::TooManyErrors(count) => {
                write!(f, "{count} consecutive errors")
            }
            EvictionReason::Broken => f.write_str("broken"),
            EvictionReason::Idle(idle) => write!(f, "idle for {} ms", idle.as_millis()),
            EvictionReason::Disposed => f.write_str("pool disposed"),
        }
    }
}

impl EvictionPolicy {
    /// Create a policy from its thresholds
    pub fn new(max_idle: Duration, max_consecutive_errors: u32) -> Self {
        Self {
            max_idle,
            max_consecutive_errors,
        }
    }

    /// Decide whether a connection in the given state must be discarded at `now`
    ///
    /// Pure function of the thresholds and the observed health. When several reasons apply
    /// the most specific one is reported: poison, error count, broken state, idle time.
    pub fn evaluate(&self, health: &ConnectionHealth, now: Instant) -> Option<EvictionReason> {
        if let Some(reason) = &health.poisoned {
            return Some(EvictionReason::Poisoned(reason.clone()));
        }

        if health.consecutive_errors > self.max_consecutive_errors {
            return Some(EvictionReason::TooManyErrors(health.consecutive_errors));
        }

        if health.state == ConnectionState::Broken {
            return Some(EvictionReason::Broken);
        }

        let idle = now.saturating_duration_since(health.last_used);
        if idle > self.max_idle {
            return Some(EvictionReason::Idle(idle));
        }

        None
    }
}
