//! Connection pooling and transaction execution for request/response field devices
//! using [Tokio](https://docs.rs/tokio) and Rust's `async/await` syntax.
//!
//! The crate does not know any wire protocol. A [`FrameCodec`] frames requests and
//! recognizes responses; the transport core takes care of everything around it.
//!
//! # Features
//!
//! * One connection pool per physical [`Link`] (TCP socket, serial port, or custom transport)
//! * At most one in-flight request per [`Endpoint`], strict FIFO with retries at the head
//! * Serial links are physically exclusive: one connection, shared by every unit on the line
//! * Health based eviction of pooled connections, checked on borrow, on return, and by a
//!   periodic sweep
//! * Bounded retry with timeouts, optional overall deadlines, and a uniform error type
//! * Periodic polling with skipped ticks instead of piled up requests
//! * Diagnostic event stream and `tracing` logging
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use fieldlink::*;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), RequestError> {
//!     let manager = TransportManager::new(
//!         TransportConfig::default(),
//!         DefaultConnectionFactory::default(),
//!         DelimitedCodec::default(),
//!     );
//!
//!     let channel = manager.channel(&Link::tcp("192.168.0.10", 4001).unit(UnitId::new(1)));
//!     let param = RequestParam::new(Duration::from_secs(1), 2).with_default_deadline();
//!
//!     let response = channel.submit(b"MEAS:TEMP?".to_vec(), param).await?;
//!     println!("{}", String::from_utf8_lossy(&response));
//!     Ok(())
//! }
//! ```

mod channel;
mod client;
mod codec;
mod config;
mod decode;
mod endpoint;
mod error;
mod events;
mod manager;
mod maybe_async;
mod pool;
mod retry;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use crate::client::*;
pub use crate::codec::*;
pub use crate::config::*;
pub use crate::decode::*;
pub use crate::endpoint::*;
pub use crate::error::*;
pub use crate::events::{EventKind, TransportEvent};
pub use crate::manager::TransportManager;
pub use crate::maybe_async::MaybeAsync;
pub use crate::pool::{
    AsyncStream, Connection, ConnectionFactory, ConnectionHealth, ConnectionState,
    DefaultConnectionFactory, EvictionPolicy, EvictionReason, PhysLayer, PoolStats,
};
pub use crate::retry::*;
