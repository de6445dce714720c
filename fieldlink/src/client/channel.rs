use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, Sleep};
use tokio_util::sync::CancellationToken;

use crate::client::executor::Executor;
use crate::client::listener::Listener;
use crate::client::message::{PendingRequest, Promise, RequestParam, ResponseResult};
use crate::client::poll::{spawn_poll, PollHandle};
use crate::client::task::{Lane, WorkerTask};
use crate::endpoint::Endpoint;
use crate::error::RequestError;
use crate::events::{EventKind, EventSink};
use crate::manager::LinkBinding;
use crate::retry::RetryStrategy;

/// Handle used to submit requests to one [`Endpoint`]
///
/// Obtained from [`crate::TransportManager::channel`]. Cloning is cheap and every clone
/// feeds the same worker. The link stays bound while any channel created for it
/// (or any clone of one) is alive.
#[derive(Clone)]
pub struct Channel {
    endpoint: Endpoint,
    tx: mpsc::Sender<PendingRequest>,
    events: EventSink,
    _binding: Option<Arc<LinkBinding>>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl Channel {
    pub(crate) fn new(
        endpoint: Endpoint,
        tx: mpsc::Sender<PendingRequest>,
        events: EventSink,
        binding: Option<Arc<LinkBinding>>,
    ) -> Self {
        Self {
            endpoint,
            tx,
            events,
            _binding: binding,
        }
    }

    /// Endpoint this channel talks to
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Queue a request behind any in-flight or queued request sharing its worker
    ///
    /// Never blocks. If the worker queue is full the returned transaction is already
    /// complete with [`RequestError::QueueFull`]. Dropping the transaction before it
    /// starts executing removes the request without touching the link.
    pub fn submit(&self, payload: Vec<u8>, param: RequestParam) -> Transaction {
        let (tx, rx) = oneshot::channel();
        let request =
            PendingRequest::new(self.endpoint.clone(), payload, param, Promise::new(tx));
        let deadline = request.deadline;

        match self.tx.try_send(request) {
            Ok(()) => Transaction::pending(rx, deadline),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.events.endpoint(
                    &self.endpoint,
                    EventKind::RequestFailed(RequestError::QueueFull),
                );
                Transaction::failed(RequestError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.events.endpoint(
                    &self.endpoint,
                    EventKind::RequestFailed(RequestError::Disposed),
                );
                Transaction::failed(RequestError::Disposed)
            }
        }
    }

    /// Submit `supplier()` every `interval`, delivering each result to `listener`
    ///
    /// A tick is skipped while the previous request is still outstanding. Polling stops
    /// when the returned handle is dropped or cancelled, or when the endpoint is disposed.
    pub fn register_poll<S>(
        &self,
        supplier: S,
        interval: Duration,
        param: RequestParam,
        listener: Box<dyn Listener<ResponseResult>>,
    ) -> PollHandle
    where
        S: FnMut() -> Vec<u8> + Send + 'static,
    {
        spawn_poll(self.clone(), Box::new(supplier), interval, param, listener)
    }
}

/// Eventual outcome of a submitted request
///
/// Resolves exactly once with the response payload or a [`RequestError`]. A request with a
/// deadline resolves with [`RequestError::Timeout`] as soon as the deadline passes, even while
/// it is still queued behind other requests.
#[must_use = "dropping a transaction cancels the request if it has not started"]
#[derive(Debug)]
pub struct Transaction {
    inner: TransactionInner,
}

#[derive(Debug)]
enum TransactionInner {
    Failed(Option<RequestError>),
    Pending {
        rx: oneshot::Receiver<ResponseResult>,
        deadline: Option<Instant>,
        // armed on first poll so that submitting needs no runtime
        timer: Option<Pin<Box<Sleep>>>,
    },
}

impl Transaction {
    fn pending(rx: oneshot::Receiver<ResponseResult>, deadline: Option<Instant>) -> Self {
        Self {
            inner: TransactionInner::Pending {
                rx,
                deadline,
                timer: None,
            },
        }
    }

    pub(crate) fn failed(err: RequestError) -> Self {
        Self {
            inner: TransactionInner::Failed(Some(err)),
        }
    }
}

impl Future for Transaction {
    type Output = ResponseResult;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let inner = &mut self.get_mut().inner;
        match inner {
            TransactionInner::Failed(err) => {
                Poll::Ready(Err(err.take().unwrap_or(RequestError::Disposed)))
            }
            TransactionInner::Pending {
                rx,
                deadline,
                timer,
            } => {
                if let Poll::Ready(res) = Pin::new(rx).poll(cx) {
                    // the worker dropped the request without answering
                    return Poll::Ready(res.unwrap_or(Err(RequestError::Disposed)));
                }

                let Some(deadline) = *deadline else {
                    return Poll::Pending;
                };
                let timer =
                    timer.get_or_insert_with(|| Box::pin(tokio::time::sleep_until(deadline)));
                if timer.as_mut().poll(cx).is_pending() {
                    return Poll::Pending;
                }

                // closes the promise, the worker skips the request if it has not started
                *inner = TransactionInner::Failed(None);
                Poll::Ready(Err(RequestError::Timeout))
            }
        }
    }
}

/// Spawn the worker of `lane` and return the sending side of its queue
pub(crate) fn spawn_worker(
    lane: Lane,
    max_queued_requests: usize,
    executor: Executor,
    retry: Box<dyn RetryStrategy>,
    cancel: CancellationToken,
) -> mpsc::Sender<PendingRequest> {
    let (tx, rx) = mpsc::channel(max_queued_requests.max(1));
    let task = WorkerTask::new(lane, rx.into(), executor, retry, cancel);
    tokio::spawn(task.run());
    tx
}
