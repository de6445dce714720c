use std::time::Duration;

#[cfg(feature = "serialization")]
use serde::{Deserialize, Serialize};

use crate::decode::DecodeLevel;
use crate::pool::EvictionPolicy;
use crate::retry::RetryConfig;

/// Settings shared by every pool and worker of a `TransportManager`
///
/// All durations deserialize from humantime notation, e.g. `"250ms"` or `"5s"`.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serialization", serde(default))]
pub struct TransportConfig {
    /// maximum number of requests waiting behind the in-flight one, per worker
    ///
    /// A serial link has one worker for all of its units, a TCP link one per unit.
    pub max_queued_requests: usize,
    /// largest response frame accepted before the response is considered malformed
    pub max_frame_size: usize,
    /// bound on establishing a TCP connection
    #[cfg_attr(feature = "serialization", serde(with = "humantime_serde"))]
    pub connect_timeout: Duration,
    /// logging of payloads and raw link traffic
    pub decode: DecodeLevel,
    /// delay between attempts of a failing request
    pub retry: RetryConfig,
    /// connection pool settings
    pub pool: PoolConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_queued_requests: 16,
            max_frame_size: 4096,
            connect_timeout: Duration::from_secs(5),
            decode: DecodeLevel::default(),
            retry: RetryConfig::default(),
            pool: PoolConfig::default(),
        }
    }
}

/// Connection pool settings
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serialization", serde(default))]
pub struct PoolConfig {
    /// cap on borrowed + idle connections to one TCP link
    ///
    /// Serial links and custom links are always capped at one connection.
    pub max_tcp_connections: usize,
    /// period of the background sweep over idle connections
    #[cfg_attr(feature = "serialization", serde(with = "humantime_serde"))]
    pub sweep_interval: Duration,
    /// when pooled connections are discarded
    pub eviction: EvictionPolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_tcp_connections: 2,
            sweep_interval: Duration::from_secs(5),
            eviction: EvictionPolicy::default(),
        }
    }
}
