use tokio::time::Instant;

use crate::endpoint::Link;
use crate::pool::phys::PhysLayer;

/// Lifecycle state of a connection
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// the transport handle is usable
    Open,
    /// the transport failed or was closed, the connection will be destroyed
    Broken,
}

/// Observed health of a connection, the only input of the eviction decision
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionHealth {
    /// lifecycle state
    pub state: ConnectionState,
    /// communication errors since the last successful transaction
    pub consecutive_errors: u32,
    /// last time the connection completed or failed a transaction, or was created
    pub last_used: Instant,
    /// set when the connection must never be reused, with the reason
    pub poisoned: Option<String>,
}

impl ConnectionHealth {
    pub(crate) fn new(now: Instant) -> Self {
        Self {
            state: ConnectionState::Open,
            consecutive_errors: 0,
            last_used: now,
            poisoned: None,
        }
    }
}

/// A single open channel to a link, able to carry one transaction at a time
///
/// Exclusively owned either by its pool (while idle) or by one transaction (while borrowed).
#[derive(Debug)]
pub struct Connection {
    id: u64,
    link: Link,
    phys: Option<PhysLayer>,
    health: ConnectionHealth,
}

impl Connection {
    pub(crate) fn new(id: u64, link: Link, phys: PhysLayer) -> Self {
        Self {
            id,
            link,
            phys: Some(phys),
            health: ConnectionHealth::new(Instant::now()),
        }
    }

    /// Identifier unique within the owning pool, increasing with every creation
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Link the connection is attached to
    pub fn link(&self) -> &Link {
        &self.link
    }

    /// Current health snapshot
    pub fn health(&self) -> &ConnectionHealth {
        &self.health
    }

    /// True if the transport handle is still present and not flagged broken
    pub fn is_open(&self) -> bool {
        self.phys.is_some() && self.health.state == ConnectionState::Open
    }

    /// Flag the connection so that it is never reused
    pub fn poison(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::warn!("connection {} on {} poisoned: {}", self.id, self.link, reason);
        self.health.poisoned = Some(reason);
    }

    /// Close the transport handle
    ///
    /// Closing is best-effort and idempotent. Returns `true` if this call released the handle.
    pub fn close(&mut self) -> bool {
        self.health.state = ConnectionState::Broken;
        // dropping the stream closes the socket / port
        self.phys.take().is_some()
    }

    /// Move the transport handle and health into a new value, leaving a closed shell behind
    pub(crate) fn take(&mut self) -> Connection {
        let health = self.health.clone();
        self.health.state = ConnectionState::Broken;
        Connection {
            id: self.id,
            link: self.link.clone(),
            phys: self.phys.take(),
            health,
        }
    }

    pub(crate) fn phys(&mut self) -> Option<&mut PhysLayer> {
        self.phys.as_mut()
    }

    pub(crate) fn record_success(&mut self) {
        self.health.consecutive_errors = 0;
        self.health.last_used = Instant::now();
    }

    pub(crate) fn record_error(&mut self) {
        self.health.consecutive_errors = self.health.consecutive_errors.saturating_add(1);
        self.health.last_used = Instant::now();
    }

    pub(crate) fn mark_broken(&mut self) {
        self.health.state = ConnectionState::Broken;
    }
}
