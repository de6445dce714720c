use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::PoolConfig;
use crate::endpoint::{Link, LinkKind};
use crate::error::RequestError;
use crate::events::{EventKind, EventSink};

pub(crate) mod connection;
pub(crate) mod eviction;
pub(crate) mod factory;
pub(crate) mod phys;

pub use connection::{Connection, ConnectionHealth, ConnectionState};
pub use eviction::{EvictionPolicy, EvictionReason};
pub use factory::{ConnectionFactory, DefaultConnectionFactory};
pub use phys::{AsyncStream, PhysLayer};

/// Snapshot of a pool's bookkeeping
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// maximum number of borrowed + idle connections
    pub capacity: usize,
    /// connections waiting in the pool
    pub idle: usize,
    /// connections currently owned by a transaction
    pub borrowed: usize,
    /// connections created since the pool was created
    pub created: u64,
    /// connections destroyed since the pool was created
    pub evicted: u64,
}

/// Bounded cache of connections to a single [`Link`]
///
/// Handout is serialized by a fair semaphore sized to the link's capacity: serial and custom
/// links allow exactly one connection, TCP links [`PoolConfig::max_tcp_connections`].
/// Idle connections are checked against the [`EvictionPolicy`] when borrowed, when returned,
/// and periodically by a background sweep that lives as long as the pool.
#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("link", &self.shared.link)
            .field("stats", &self.stats())
            .finish()
    }
}

struct PoolShared {
    link: Link,
    capacity: usize,
    policy: EvictionPolicy,
    factory: Arc<dyn ConnectionFactory>,
    permits: Arc<Semaphore>,
    state: Mutex<PoolState>,
    events: EventSink,
    sweep: CancellationToken,
}

#[derive(Default)]
struct PoolState {
    idle: VecDeque<Connection>,
    next_id: u64,
    borrowed: usize,
    created: u64,
    evicted: u64,
    disposed: bool,
}

impl ConnectionPool {
    /// Create a pool for `link` and start its background sweep
    ///
    /// Must be called from within a Tokio runtime.
    pub(crate) fn new(
        link: Link,
        config: PoolConfig,
        factory: Arc<dyn ConnectionFactory>,
        events: EventSink,
    ) -> Self {
        let capacity = match link.kind() {
            LinkKind::Tcp => config.max_tcp_connections.max(1),
            // a serial line is physically exclusive
            LinkKind::Serial | LinkKind::Other => 1,
        };

        let shared = Arc::new(PoolShared {
            link,
            capacity,
            policy: config.eviction,
            factory,
            permits: Arc::new(Semaphore::new(capacity)),
            state: Mutex::new(PoolState::default()),
            events,
            sweep: CancellationToken::new(),
        });

        tokio::spawn(run_sweep(
            Arc::downgrade(&shared),
            config.sweep_interval,
            shared.sweep.clone(),
        ));

        Self { shared }
    }

    /// Link served by this pool
    pub fn link(&self) -> &Link {
        &self.shared.link
    }

    /// Borrow a connection, waiting for one to become available if the pool is at capacity
    ///
    /// Idle connections that fail validation or the eviction policy are destroyed on the way.
    /// If no idle connection is usable a new one is created through the factory.
    pub async fn borrow(&self) -> Result<PooledConnection, RequestError> {
        let permit = self
            .shared
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| RequestError::Disposed)?;

        while let Some(conn) = self.shared.pop_idle()? {
            match self.shared.check(&conn, Instant::now()) {
                None => {
                    tracing::trace!("reusing connection {} on {}", conn.id(), self.shared.link);
                    self.shared.state.lock().borrowed += 1;
                    return Ok(PooledConnection::new(conn, self.shared.clone(), permit));
                }
                // stale, never handed out
                Some(reason) => self.shared.evict(conn, reason),
            }
        }

        let conn = self.shared.create().await?;
        Ok(PooledConnection::new(conn, self.shared.clone(), permit))
    }

    /// Evaluate all idle connections against the eviction policy, destroying the stale ones
    ///
    /// Returns the number of connections destroyed. Runs periodically in the background.
    pub fn sweep(&self) -> usize {
        self.shared.sweep_idle(Instant::now())
    }

    /// Tear the pool down
    ///
    /// Idle connections are destroyed, waiting borrowers fail with [`RequestError::Disposed`],
    /// and borrowed connections are destroyed when they are released. Idempotent.
    pub fn dispose(&self) {
        self.shared.dispose()
    }

    /// True once [`ConnectionPool::dispose`] has been called
    pub fn is_disposed(&self) -> bool {
        self.shared.state.lock().disposed
    }

    /// Current bookkeeping
    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock();
        PoolStats {
            capacity: self.shared.capacity,
            idle: state.idle.len(),
            borrowed: state.borrowed,
            created: state.created,
            evicted: state.evicted,
        }
    }
}

impl PoolShared {
    fn pop_idle(&self) -> Result<Option<Connection>, RequestError> {
        let mut state = self.state.lock();
        if state.disposed {
            return Err(RequestError::Disposed);
        }
        // most recently used first, the others age out
        Ok(state.idle.pop_back())
    }

    fn check(&self, conn: &Connection, now: Instant) -> Option<EvictionReason> {
        if !self.factory.validate(conn) {
            return Some(EvictionReason::Broken);
        }
        self.policy.evaluate(conn.health(), now)
    }

    async fn create(&self) -> Result<Connection, RequestError> {
        let id = {
            let mut state = self.state.lock();
            state.next_id += 1;
            state.next_id
        };

        let phys = match self.factory.create(&self.link).get().await {
            Ok(phys) => phys,
            Err(err) => {
                tracing::warn!("unable to connect to {}: {}", self.link, err);
                return Err(RequestError::ConnectFailed(err.kind()));
            }
        };

        let mut conn = Connection::new(id, self.link.clone(), phys);

        {
            let mut state = self.state.lock();
            state.created += 1;
            if !state.disposed {
                state.borrowed += 1;
                drop(state);
                self.events
                    .link(&self.link, EventKind::ConnectionCreated { id });
                return Ok(conn);
            }
        }

        // disposed while connecting
        self.factory.destroy(&mut conn);
        self.state.lock().evicted += 1;
        Err(RequestError::Disposed)
    }

    fn release(&self, mut conn: Connection) {
        let reason = {
            let mut state = self.state.lock();
            state.borrowed = state.borrowed.saturating_sub(1);
            if state.disposed {
                Some(EvictionReason::Disposed)
            } else {
                match self.policy.evaluate(conn.health(), Instant::now()) {
                    None => {
                        state.idle.push_back(conn);
                        return;
                    }
                    reason => reason,
                }
            }
        };

        // the policy always reports broken connections
        let reason = reason.unwrap_or(EvictionReason::Broken);
        conn.mark_broken();
        self.evict(conn, reason);
    }

    fn evict(&self, mut conn: Connection, reason: EvictionReason) {
        let id = conn.id();
        self.factory.destroy(&mut conn);
        self.state.lock().evicted += 1;
        self.events
            .link(&self.link, EventKind::ConnectionEvicted { id, reason });
    }

    fn sweep_idle(&self, now: Instant) -> usize {
        let evicted: Vec<(Connection, EvictionReason)> = {
            let mut state = self.state.lock();
            let mut kept = VecDeque::with_capacity(state.idle.len());
            let mut evicted = Vec::new();
            for conn in state.idle.drain(..) {
                match self.check(&conn, now) {
                    None => kept.push_back(conn),
                    Some(reason) => evicted.push((conn, reason)),
                }
            }
            state.idle = kept;
            evicted
        };

        let count = evicted.len();
        for (conn, reason) in evicted {
            self.evict(conn, reason);
        }

        tracing::debug!("sweep of {} evicted {} connection(s)", self.link, count);
        count
    }

    fn dispose(&self) {
        let idle: Vec<Connection> = {
            let mut state = self.state.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
            state.idle.drain(..).collect()
        };

        self.permits.close();
        self.sweep.cancel();

        for conn in idle {
            self.evict(conn, EvictionReason::Disposed);
        }

        tracing::info!("connection pool for {} disposed", self.link);
    }
}

impl Drop for PoolShared {
    fn drop(&mut self) {
        self.sweep.cancel();
        let state = self.state.get_mut();
        for mut conn in state.idle.drain(..) {
            self.factory.destroy(&mut conn);
        }
    }
}

async fn run_sweep(pool: Weak<PoolShared>, period: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = interval.tick() => {}
        }

        match pool.upgrade() {
            Some(pool) => {
                pool.sweep_idle(Instant::now());
            }
            None => return,
        }
    }
}

/// A connection on loan from a [`ConnectionPool`]
///
/// Hand it back with [`PooledConnection::release_healthy`] or
/// [`PooledConnection::release_broken`]. Dropping it without doing either abandons the
/// connection, which is then destroyed.
pub struct PooledConnection {
    // field order matters: the connection goes back to the pool before the permit is released
    conn: Connection,
    released: bool,
    pool: Arc<PoolShared>,
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("conn", &self.conn)
            .finish()
    }
}

impl PooledConnection {
    fn new(conn: Connection, pool: Arc<PoolShared>, permit: OwnedSemaphorePermit) -> Self {
        Self {
            conn,
            released: false,
            pool,
            _permit: permit,
        }
    }

    /// Make the connection available to the next borrower
    ///
    /// The eviction policy still applies, e.g. to a poisoned connection.
    pub fn release_healthy(mut self) {
        self.released = true;
        self.pool.release(self.conn.take());
    }

    /// Destroy the connection; the next borrower gets a fresh one
    pub fn release_broken(mut self) {
        self.released = true;
        let mut conn = self.conn.take();
        conn.mark_broken();
        self.pool.release(conn);
    }
}

impl std::ops::Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl std::ops::DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.conn
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if !self.released {
            tracing::warn!(
                "connection {} on {} abandoned mid-transaction",
                self.conn.id(),
                self.conn.link()
            );
            let mut conn = self.conn.take();
            conn.mark_broken();
            self.pool.release(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::MaybeAsync;

    #[derive(Default)]
    struct CountingFactory {
        created: AtomicUsize,
        destroyed: AtomicUsize,
        fail: std::sync::atomic::AtomicBool,
    }

    impl ConnectionFactory for Arc<CountingFactory> {
        fn create(&self, _link: &Link) -> MaybeAsync<std::io::Result<PhysLayer>> {
            if self.fail.load(Ordering::SeqCst) {
                return MaybeAsync::ready(Err(std::io::ErrorKind::ConnectionRefused.into()));
            }
            self.created.fetch_add(1, Ordering::SeqCst);
            let (client, _server) = tokio::io::duplex(64);
            MaybeAsync::ready(Ok(PhysLayer::stream(client)))
        }

        fn destroy(&self, connection: &mut Connection) {
            if connection.close() {
                self.destroyed.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn pool(link: Link, config: PoolConfig) -> (ConnectionPool, Arc<CountingFactory>) {
        let factory = Arc::new(CountingFactory::default());
        let pool = ConnectionPool::new(link, config, Arc::new(factory.clone()), EventSink::new());
        (pool, factory)
    }

    fn serial() -> Link {
        Link::serial("/dev/ttyS1", crate::SerialSettings::default())
    }

    #[tokio::test]
    async fn reuses_healthy_connections() {
        let (pool, factory) = pool(serial(), PoolConfig::default());

        let conn = pool.borrow().await.unwrap();
        let id = conn.id();
        conn.release_healthy();

        let conn = pool.borrow().await.unwrap();
        assert_eq!(conn.id(), id);
        conn.release_healthy();

        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().idle, 1);
    }

    #[tokio::test]
    async fn broken_connections_are_never_reused() {
        let (pool, factory) = pool(serial(), PoolConfig::default());

        let conn = pool.borrow().await.unwrap();
        let id = conn.id();
        conn.release_broken();
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 1);

        let conn = pool.borrow().await.unwrap();
        assert_ne!(conn.id(), id);
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn error_counter_over_threshold_evicts_on_return() {
        let config = PoolConfig {
            eviction: EvictionPolicy::new(Duration::from_secs(60), 1),
            ..PoolConfig::default()
        };
        let (pool, factory) = pool(serial(), config);

        let mut conn = pool.borrow().await.unwrap();
        conn.record_error();
        conn.release_healthy();
        assert_eq!(pool.stats().idle, 1);

        let mut conn = pool.borrow().await.unwrap();
        conn.record_error();
        conn.release_healthy();
        assert_eq!(pool.stats().idle, 0);

        let conn = pool.borrow().await.unwrap();
        assert_eq!(conn.health().consecutive_errors, 0);
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn dropping_a_borrowed_connection_destroys_it() {
        let (pool, factory) = pool(serial(), PoolConfig::default());

        let conn = pool.borrow().await.unwrap();
        drop(conn);

        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().borrowed, 0);
        assert_eq!(pool.stats().idle, 0);
    }

    #[tokio::test]
    async fn serial_links_hand_out_one_connection_at_a_time() {
        let (pool, _factory) = pool(serial(), PoolConfig::default());
        assert_eq!(pool.stats().capacity, 1);

        let first = pool.borrow().await.unwrap();

        let second = pool.clone();
        let mut waiting = tokio_test::task::spawn(async move { second.borrow().await });
        assert!(waiting.poll().is_pending());

        first.release_healthy();
        assert!(waiting.is_woken());
        match waiting.poll() {
            std::task::Poll::Ready(Ok(conn)) => conn.release_healthy(),
            _ => panic!("expected the second borrow to complete"),
        }
    }

    #[tokio::test]
    async fn tcp_links_use_configured_capacity() {
        let config = PoolConfig {
            max_tcp_connections: 3,
            ..PoolConfig::default()
        };
        let (pool, factory) = pool(Link::tcp("10.0.0.1", 502), config);

        let a = pool.borrow().await.unwrap();
        let b = pool.borrow().await.unwrap();
        let c = pool.borrow().await.unwrap();
        assert_eq!(pool.stats().borrowed, 3);
        assert_eq!(factory.created.load(Ordering::SeqCst), 3);

        a.release_healthy();
        b.release_healthy();
        c.release_healthy();
        assert_eq!(pool.stats().idle, 3);
    }

    #[tokio::test]
    async fn connect_failures_are_reported() {
        let (pool, factory) = pool(serial(), PoolConfig::default());
        factory.fail.store(true, Ordering::SeqCst);

        let err = pool.borrow().await.unwrap_err();
        assert_eq!(
            err,
            RequestError::ConnectFailed(std::io::ErrorKind::ConnectionRefused)
        );
        // the permit was returned
        factory.fail.store(false, Ordering::SeqCst);
        assert!(pool.borrow().await.is_ok());
    }

    #[tokio::test]
    async fn sweep_evicts_idle_connections() {
        tokio::time::pause();
        let config = PoolConfig {
            sweep_interval: Duration::from_secs(1),
            eviction: EvictionPolicy::new(Duration::from_secs(5), 0),
            ..PoolConfig::default()
        };
        let (pool, factory) = pool(serial(), config);

        pool.borrow().await.unwrap().release_healthy();
        assert_eq!(pool.stats().idle, 1);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(pool.stats().idle, 1);

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(pool.stats().idle, 0);
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stale_connections_found_on_borrow_are_not_counted_as_borrowed() {
        tokio::time::pause();
        let config = PoolConfig {
            sweep_interval: Duration::from_secs(3600),
            eviction: EvictionPolicy::new(Duration::from_secs(5), 0),
            ..PoolConfig::default()
        };
        let (pool, factory) = pool(serial(), config);

        pool.borrow().await.unwrap().release_healthy();
        tokio::time::advance(Duration::from_secs(10)).await;

        let conn = pool.borrow().await.unwrap();
        assert_eq!(pool.stats().borrowed, 1);
        conn.release_healthy();

        assert_eq!(
            pool.stats(),
            PoolStats {
                capacity: 1,
                idle: 1,
                borrowed: 0,
                created: 2,
                evicted: 1,
            }
        );
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dispose_destroys_idle_and_returned_connections() {
        let config = PoolConfig {
            max_tcp_connections: 2,
            ..PoolConfig::default()
        };
        let (pool, factory) = pool(Link::tcp("10.0.0.1", 502), config);

        pool.borrow().await.unwrap().release_healthy();
        let borrowed = pool.borrow().await.unwrap();
        let other = pool.borrow().await.unwrap();
        other.release_healthy();
        assert_eq!(pool.stats().idle, 1);

        pool.dispose();
        pool.dispose();
        assert!(pool.is_disposed());
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 1);

        borrowed.release_healthy();
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 2);
        assert_eq!(pool.borrow().await.unwrap_err(), RequestError::Disposed);
    }

    #[tokio::test]
    async fn disposing_an_empty_pool_is_harmless() {
        let (pool, factory) = pool(serial(), PoolConfig::default());
        pool.dispose();
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 0);
        assert_eq!(pool.stats().evicted, 0);
    }
}
