use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::client::channel::spawn_worker;
use crate::client::executor::Executor;
use crate::client::message::{PendingRequest, ResponseResult};
use crate::client::task::Lane;
use crate::client::{Channel, Listener, PollHandle, RequestParam, Transaction};
use crate::codec::FrameCodec;
use crate::config::TransportConfig;
use crate::endpoint::{Endpoint, Link};
use crate::events::{EventSink, TransportEvent};
use crate::pool::{ConnectionFactory, ConnectionPool, PoolStats};

/// Owns every connection pool and worker of an application
///
/// Pools are keyed by [`Link`]. A serial or custom link has a single worker shared by all of
/// its units, a TCP link one worker per [`Endpoint`]. Both are created lazily on first use. Must be created from within a Tokio runtime. Dropping the last clone of the manager
/// shuts everything down.
#[derive(Clone)]
pub struct TransportManager {
    shared: Arc<ManagerShared>,
}

struct ManagerShared {
    config: TransportConfig,
    factory: Arc<dyn ConnectionFactory>,
    codec: Arc<dyn FrameCodec>,
    events: EventSink,
    links: Mutex<LinkMap>,
    shutdown: CancellationToken,
}

#[derive(Default)]
struct LinkMap {
    entries: HashMap<Link, LinkEntry>,
    next_id: u64,
}

struct LinkEntry {
    id: u64,
    pool: ConnectionPool,
    workers: HashMap<Lane, mpsc::Sender<PendingRequest>>,
    cancel: CancellationToken,
    bindings: usize,
}

impl LinkEntry {
    fn dispose(self) {
        self.cancel.cancel();
        self.pool.dispose();
    }
}

/// Keeps a link bound while any [`Channel`] created for it is alive
pub(crate) struct LinkBinding {
    link: Link,
    entry: u64,
    manager: Weak<ManagerShared>,
}

impl Drop for LinkBinding {
    fn drop(&mut self) {
        if let Some(manager) = self.manager.upgrade() {
            manager.unbind(&self.link, self.entry);
        }
    }
}

impl std::fmt::Debug for TransportManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportManager")
            .field("links", &self.shared.links.lock().entries.len())
            .finish()
    }
}

impl TransportManager {
    /// Create a manager that opens connections with `factory` and frames requests with `codec`
    pub fn new<F, C>(config: TransportConfig, factory: F, codec: C) -> Self
    where
        F: ConnectionFactory,
        C: FrameCodec,
    {
        Self {
            shared: Arc::new(ManagerShared {
                config,
                factory: Arc::new(factory),
                codec: Arc::new(codec),
                events: EventSink::new(),
                links: Mutex::new(LinkMap::default()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Bind `endpoint` and return a handle for submitting requests to it
    ///
    /// When the last channel bound to a link (including clones) is dropped, the link's pool
    /// and all of its workers are disposed.
    pub fn channel(&self, endpoint: &Endpoint) -> Channel {
        match self.shared.sender(endpoint, true) {
            Some((tx, entry)) => {
                let binding = Arc::new(LinkBinding {
                    link: endpoint.link.clone(),
                    entry,
                    manager: Arc::downgrade(&self.shared),
                });
                Channel::new(
                    endpoint.clone(),
                    tx,
                    self.shared.events.clone(),
                    Some(binding),
                )
            }
            None => self.closed_channel(endpoint),
        }
    }

    /// Submit a single request to `endpoint`
    ///
    /// Links first used through this method stay alive until [`TransportManager::dispose`]
    /// or [`TransportManager::shutdown`].
    pub fn submit(&self, endpoint: &Endpoint, payload: Vec<u8>, param: RequestParam) -> Transaction {
        self.unbound(endpoint).submit(payload, param)
    }

    /// Submit `supplier()` to `endpoint` every `interval`, delivering each result to `listener`
    pub fn register_poll<S>(
        &self,
        endpoint: &Endpoint,
        supplier: S,
        interval: Duration,
        param: RequestParam,
        listener: Box<dyn Listener<ResponseResult>>,
    ) -> PollHandle
    where
        S: FnMut() -> Vec<u8> + Send + 'static,
    {
        self.unbound(endpoint)
            .register_poll(supplier, interval, param, listener)
    }

    /// Stop a poll started with [`TransportManager::register_poll`]
    pub fn cancel_poll(&self, handle: PollHandle) {
        handle.cancel();
    }

    /// Subscribe to connection and request events
    ///
    /// Slow subscribers lose the oldest events.
    pub fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.shared.events.subscribe()
    }

    /// Statistics of the pool serving `link`, if the link is in use
    pub fn pool_stats(&self, link: &Link) -> Option<PoolStats> {
        self.shared
            .links
            .lock()
            .entries
            .get(link)
            .map(|entry| entry.pool.stats())
    }

    /// Tear down the pool and every worker of `link`
    ///
    /// Pending requests resolve with [`crate::RequestError::Disposed`]. Using the link again later
    /// creates a fresh pool. Returns false if the link was not in use.
    pub fn dispose(&self, link: &Link) -> bool {
        let entry = self.shared.links.lock().entries.remove(link);
        match entry {
            Some(entry) => {
                tracing::info!("disposing {}", link);
                entry.dispose();
                true
            }
            None => false,
        }
    }

    /// Dispose every link and refuse further requests
    pub fn shutdown(&self) {
        self.shared.shutdown();
    }

    fn unbound(&self, endpoint: &Endpoint) -> Channel {
        match self.shared.sender(endpoint, false) {
            Some((tx, _)) => Channel::new(endpoint.clone(), tx, self.shared.events.clone(), None),
            None => self.closed_channel(endpoint),
        }
    }

    fn closed_channel(&self, endpoint: &Endpoint) -> Channel {
        // the receiver is gone, every submission resolves with Disposed
        let (tx, _) = mpsc::channel(1);
        Channel::new(endpoint.clone(), tx, self.shared.events.clone(), None)
    }
}

impl ManagerShared {
    /// Sender of the endpoint's worker and id of its link entry, creating both if necessary
    fn sender(&self, endpoint: &Endpoint, bind: bool) -> Option<(mpsc::Sender<PendingRequest>, u64)> {
        if self.shutdown.is_cancelled() {
            return None;
        }

        let mut links = self.links.lock();
        let links = &mut *links;

        let entry = match links.entries.entry(endpoint.link.clone()) {
            std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::hash_map::Entry::Vacant(entry) => {
                links.next_id += 1;
                tracing::info!("creating pool for {}", endpoint.link);
                entry.insert(LinkEntry {
                    id: links.next_id,
                    pool: ConnectionPool::new(
                        endpoint.link.clone(),
                        self.config.pool,
                        self.factory.clone(),
                        self.events.clone(),
                    ),
                    workers: HashMap::new(),
                    cancel: self.shutdown.child_token(),
                    bindings: 0,
                })
            }
        };

        if bind {
            entry.bindings += 1;
        }

        let lane = Lane::of(endpoint);
        let tx = match entry.workers.get(&lane) {
            Some(tx) if !tx.is_closed() => tx.clone(),
            _ => {
                let executor = Executor::new(
                    entry.pool.clone(),
                    self.codec.clone(),
                    self.config.decode,
                    self.config.max_frame_size,
                    self.events.clone(),
                );
                let tx = spawn_worker(
                    lane.clone(),
                    self.config.max_queued_requests,
                    executor,
                    self.config.retry.create(),
                    entry.cancel.clone(),
                );
                entry.workers.insert(lane, tx.clone());
                tx
            }
        };

        Some((tx, entry.id))
    }

    fn unbind(&self, link: &Link, id: u64) {
        let entry = {
            let mut links = self.links.lock();
            match links.entries.get_mut(link) {
                Some(entry) if entry.id == id => {
                    entry.bindings = entry.bindings.saturating_sub(1);
                    if entry.bindings == 0 {
                        links.entries.remove(link)
                    } else {
                        None
                    }
                }
                // already disposed, possibly replaced by a newer entry
                _ => None,
            }
        };

        if let Some(entry) = entry {
            tracing::info!("last channel for {} dropped", link);
            entry.dispose();
        }
    }

    fn shutdown(&self) {
        self.shutdown.cancel();
        let entries: Vec<(Link, LinkEntry)> = self.links.lock().entries.drain().collect();
        for (link, entry) in entries {
            tracing::info!("disposing {}", link);
            entry.dispose();
        }
    }
}

impl Drop for ManagerShared {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::DelimitedCodec;
    use crate::endpoint::UnitId;
    use crate::error::RequestError;
    use crate::events::EventKind;
    use crate::mock::{MockFactory, MockReply};

    fn manager(factory: &MockFactory) -> TransportManager {
        TransportManager::new(
            TransportConfig::default(),
            factory.clone(),
            DelimitedCodec::default(),
        )
    }

    fn param() -> RequestParam {
        RequestParam::new(Duration::from_millis(100), 0)
    }

    #[tokio::test]
    async fn units_on_one_link_share_a_pool() {
        let factory = MockFactory::new(|_, _| MockReply::line("ok"));
        let manager = manager(&factory);
        let link = Link::serial("/dev/ttyS0", Default::default());

        let a = manager.channel(&link.unit(UnitId::new(1)));
        let b = manager.channel(&link.unit(UnitId::new(2)));
        assert_eq!(a.submit(b"1".to_vec(), param()).await, Ok(b"ok".to_vec()));
        assert_eq!(b.submit(b"2".to_vec(), param()).await, Ok(b"ok".to_vec()));

        let stats = manager.pool_stats(&link).unwrap();
        assert_eq!(stats.created, 1);
        assert_eq!(stats.capacity, 1);
    }

    #[tokio::test]
    async fn serial_retries_run_before_requests_of_other_units() {
        tokio::time::pause();
        let factory = MockFactory::new(|_, req| match req {
            b"A\n" => MockReply::Silent,
            _ => MockReply::Raw(req.to_vec()),
        });
        let manager = manager(&factory);
        let link = Link::serial("/dev/ttyS1", Default::default());

        let first = manager.channel(&link.unit(UnitId::new(1)));
        let second = manager.channel(&link.unit(UnitId::new(2)));
        let a = first.submit(b"A".to_vec(), RequestParam::new(Duration::from_millis(100), 1));
        let b = second.submit(b"B".to_vec(), param());

        assert_eq!(a.await, Err(RequestError::Timeout));
        assert_eq!(b.await, Ok(b"B".to_vec()));

        let sent: Vec<Vec<u8>> = factory.requests().into_iter().map(|(_, r)| r).collect();
        assert_eq!(sent, vec![b"A\n".to_vec(), b"A\n".to_vec(), b"B\n".to_vec()]);
        assert_eq!(manager.shared.links.lock().entries[&link].workers.len(), 1);
    }

    #[tokio::test]
    async fn tcp_units_get_their_own_worker() {
        let factory = MockFactory::new(|_, _| MockReply::line("ok"));
        let manager = manager(&factory);
        let link = Link::tcp("10.1.1.6", 502);

        for unit in 1..=3 {
            let endpoint = link.unit(UnitId::new(unit));
            assert_eq!(
                manager.submit(&endpoint, b"x".to_vec(), param()).await,
                Ok(b"ok".to_vec())
            );
        }
        assert_eq!(manager.shared.links.lock().entries[&link].workers.len(), 3);
    }

    #[tokio::test]
    async fn dropping_the_last_channel_disposes_the_link() {
        let factory = MockFactory::new(|_, _| MockReply::line("ok"));
        let manager = manager(&factory);
        let link = Link::tcp("10.1.1.1", 502);

        let first = manager.channel(&link.unit(UnitId::new(1)));
        let second = manager.channel(&link.unit(UnitId::new(2)));
        assert_eq!(first.submit(b"x".to_vec(), param()).await, Ok(b"ok".to_vec()));

        drop(first);
        assert!(manager.pool_stats(&link).is_some());

        drop(second);
        assert!(manager.pool_stats(&link).is_none());
        assert_eq!(factory.destroyed(), 1);
    }

    #[tokio::test]
    async fn submitted_links_live_until_disposed() {
        let factory = MockFactory::new(|_, _| MockReply::line("ok"));
        let manager = manager(&factory);
        let endpoint = Link::tcp("10.1.1.2", 502).unit(UnitId::new(1));

        assert_eq!(
            manager.submit(&endpoint, b"x".to_vec(), param()).await,
            Ok(b"ok".to_vec())
        );
        assert!(manager.pool_stats(&endpoint.link).is_some());

        assert!(manager.dispose(&endpoint.link));
        assert!(!manager.dispose(&endpoint.link));
        assert!(manager.pool_stats(&endpoint.link).is_none());

        // a fresh pool is created on demand
        assert_eq!(
            manager.submit(&endpoint, b"x".to_vec(), param()).await,
            Ok(b"ok".to_vec())
        );
        assert_eq!(factory.created(), 2);
    }

    #[tokio::test]
    async fn stale_bindings_do_not_dispose_a_new_entry() {
        let factory = MockFactory::new(|_, _| MockReply::line("ok"));
        let manager = manager(&factory);
        let endpoint = Link::tcp("10.1.1.3", 502).unit(UnitId::new(1));

        let old = manager.channel(&endpoint);
        manager.dispose(&endpoint.link);
        let new = manager.channel(&endpoint);

        drop(old);
        assert!(manager.pool_stats(&endpoint.link).is_some());
        assert_eq!(new.submit(b"x".to_vec(), param()).await, Ok(b"ok".to_vec()));
    }

    #[tokio::test]
    async fn shutdown_refuses_new_requests() {
        let factory = MockFactory::new(|_, _| MockReply::line("ok"));
        let manager = manager(&factory);
        let endpoint = Link::tcp("10.1.1.4", 502).unit(UnitId::new(1));
        let channel = manager.channel(&endpoint);

        manager.shutdown();
        manager.shutdown();

        assert_eq!(
            channel.submit(b"x".to_vec(), param()).await,
            Err(RequestError::Disposed)
        );
        assert_eq!(
            manager.submit(&endpoint, b"x".to_vec(), param()).await,
            Err(RequestError::Disposed)
        );
    }

    #[tokio::test]
    async fn publishes_events() {
        let factory = MockFactory::new(|_, _| MockReply::line("ERR 3 bad value"));
        let manager = manager(&factory);
        let mut events = manager.events();
        let endpoint = Link::tcp("10.1.1.5", 502).unit(UnitId::new(9));

        let _ = manager.submit(&endpoint, b"x".to_vec(), param()).await;

        let created = events.recv().await.unwrap();
        assert_eq!(created.kind, EventKind::ConnectionCreated { id: 1 });
        assert_eq!(created.unit, None);

        let failed = events.recv().await.unwrap();
        assert_eq!(failed.unit, Some(UnitId::new(9)));
        assert!(matches!(
            failed.kind,
            EventKind::RequestFailed(RequestError::RemoteRejected { code: 3, .. })
        ));
    }
}
