//! In-memory devices and a scriptable [`ConnectionFactory`] for tests and demos
//!
//! Every connection created by [`MockFactory`] is one end of a [`tokio::io::duplex`] pipe.
//! A device task serves the other end: each chunk it reads is treated as one request and
//! handed to the responder, whose [`MockReply`] decides what goes back.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use crate::endpoint::Link;
use crate::pool::{Connection, ConnectionFactory, PhysLayer};
use crate::MaybeAsync;

const PIPE_CAPACITY: usize = 4096;

/// What a simulated device does with a request
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MockReply {
    /// write these bytes back
    Raw(Vec<u8>),
    /// never answer, the request times out
    Silent,
    /// close the connection
    Hangup,
    /// wait, then behave like the inner reply
    Delayed(Duration, Box<MockReply>),
}

impl MockReply {
    /// a newline terminated text response
    pub fn line(text: &str) -> Self {
        let mut bytes = text.as_bytes().to_vec();
        bytes.push(b'\n');
        MockReply::Raw(bytes)
    }
}

type Responder = Box<dyn FnMut(&Link, &[u8]) -> MockReply + Send>;

/// Factory whose connections lead to simulated devices
///
/// Clones share all state, so a test can keep one clone for assertions.
#[derive(Clone)]
pub struct MockFactory {
    inner: Arc<Inner>,
}

struct Inner {
    responder: Mutex<Responder>,
    connect_failures: Mutex<VecDeque<std::io::ErrorKind>>,
    connect_delay: Mutex<Option<Duration>>,
    requests: Mutex<Vec<(Link, Vec<u8>)>>,
    active: Mutex<HashMap<Link, usize>>,
    max_active: Mutex<HashMap<Link, usize>>,
    created: AtomicUsize,
    destroyed: AtomicUsize,
    connect_attempts: AtomicUsize,
}

impl std::fmt::Debug for MockFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockFactory")
            .field("created", &self.created())
            .field("destroyed", &self.destroyed())
            .finish()
    }
}

impl MockFactory {
    /// Create a factory whose devices answer every request through `responder`
    pub fn new<F>(responder: F) -> Self
    where
        F: FnMut(&Link, &[u8]) -> MockReply + Send + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                responder: Mutex::new(Box::new(responder)),
                connect_failures: Mutex::new(VecDeque::new()),
                connect_delay: Mutex::new(None),
                requests: Mutex::new(Vec::new()),
                active: Mutex::new(HashMap::new()),
                max_active: Mutex::new(HashMap::new()),
                created: AtomicUsize::new(0),
                destroyed: AtomicUsize::new(0),
                connect_attempts: AtomicUsize::new(0),
            }),
        }
    }

    /// Make the next `count` connection attempts fail with `kind`
    pub fn fail_next_connects(&self, count: usize, kind: std::io::ErrorKind) {
        let mut failures = self.inner.connect_failures.lock();
        failures.extend(std::iter::repeat(kind).take(count));
    }

    /// Make every connection attempt take `delay`
    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        *self.inner.connect_delay.lock() = delay;
    }

    /// Number of connections successfully created
    pub fn created(&self) -> usize {
        self.inner.created.load(Ordering::SeqCst)
    }

    /// Number of connections destroyed
    pub fn destroyed(&self) -> usize {
        self.inner.destroyed.load(Ordering::SeqCst)
    }

    /// Number of calls to `create`, failed or not
    pub fn connect_attempts(&self) -> usize {
        self.inner.connect_attempts.load(Ordering::SeqCst)
    }

    /// Every request received by any device, in arrival order
    pub fn requests(&self) -> Vec<(Link, Vec<u8>)> {
        self.inner.requests.lock().clone()
    }

    /// Highest number of requests a link's devices were processing at the same time
    pub fn max_concurrent(&self, link: &Link) -> usize {
        self.inner
            .max_active
            .lock()
            .get(link)
            .copied()
            .unwrap_or(0)
    }
}

impl ConnectionFactory for MockFactory {
    fn create(&self, link: &Link) -> MaybeAsync<std::io::Result<PhysLayer>> {
        self.inner.connect_attempts.fetch_add(1, Ordering::SeqCst);

        if let Some(kind) = self.inner.connect_failures.lock().pop_front() {
            return MaybeAsync::ready(Err(kind.into()));
        }

        let delay = *self.inner.connect_delay.lock();
        match delay {
            None => MaybeAsync::ready(Ok(self.open(link))),
            Some(delay) => {
                let factory = self.clone();
                let link = link.clone();
                MaybeAsync::asynchronous(async move {
                    tokio::time::sleep(delay).await;
                    Ok(factory.open(&link))
                })
            }
        }
    }

    fn destroy(&self, connection: &mut Connection) {
        if connection.close() {
            self.inner.destroyed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl MockFactory {
    fn open(&self, link: &Link) -> PhysLayer {
        let (client, device) = tokio::io::duplex(PIPE_CAPACITY);
        self.inner.created.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(run_device(self.inner.clone(), link.clone(), device));
        PhysLayer::stream(client)
    }
}

impl Inner {
    fn begin(&self, link: &Link, request: &[u8]) -> MockReply {
        self.requests.lock().push((link.clone(), request.to_vec()));

        let active = {
            let mut active = self.active.lock();
            let count = active.entry(link.clone()).or_insert(0);
            *count += 1;
            *count
        };
        {
            let mut max = self.max_active.lock();
            let max = max.entry(link.clone()).or_insert(0);
            *max = (*max).max(active);
        }

        let mut responder = self.responder.lock();
        (*responder)(link, request)
    }

    fn end(&self, link: &Link) {
        if let Some(count) = self.active.lock().get_mut(link) {
            *count = count.saturating_sub(1);
        }
    }
}

async fn run_device(inner: Arc<Inner>, link: Link, mut io: DuplexStream) {
    let mut buffer = [0u8; PIPE_CAPACITY];
    loop {
        let count = match io.read(&mut buffer).await {
            Ok(0) | Err(_) => return,
            Ok(count) => count,
        };

        let mut reply = inner.begin(&link, &buffer[..count]);
        let result = loop {
            match reply {
                MockReply::Delayed(delay, next) => {
                    tokio::time::sleep(delay).await;
                    reply = *next;
                }
                MockReply::Raw(bytes) => break io.write_all(&bytes).await,
                MockReply::Silent => break Ok(()),
                MockReply::Hangup => {
                    inner.end(&link);
                    return;
                }
            }
        };
        inner.end(&link);

        if result.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_failures_come_first() {
        let factory = MockFactory::new(|_, _| MockReply::Silent);
        factory.fail_next_connects(2, std::io::ErrorKind::ConnectionRefused);
        let link = Link::tcp("sim", 1);

        assert!(factory.create(&link).get().await.is_err());
        assert!(factory.create(&link).get().await.is_err());
        assert!(factory.create(&link).get().await.is_ok());
        assert_eq!(factory.connect_attempts(), 3);
        assert_eq!(factory.created(), 1);
    }

    #[tokio::test]
    async fn devices_answer_through_the_responder() {
        let factory = MockFactory::new(|_, req| MockReply::Raw(req.iter().rev().copied().collect()));
        let link = Link::tcp("sim", 1);
        let mut phys = factory.create(&link).get().await.unwrap();

        phys.write(b"abc", Default::default()).await.unwrap();
        let mut buffer = [0u8; 8];
        let count = phys.read(&mut buffer, Default::default()).await.unwrap();

        assert_eq!(&buffer[..count], b"cba");
        assert_eq!(factory.requests(), vec![(link.clone(), b"abc".to_vec())]);
        assert_eq!(factory.max_concurrent(&link), 1);
    }
}
