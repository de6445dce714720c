use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::endpoint::Endpoint;
use crate::error::RequestError;

/// Per-request timing and retry budget
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RequestParam {
    /// response timeout of a single attempt, started once the request is written
    pub timeout: Duration,
    /// number of additional attempts after a transport level failure
    pub max_retries: u32,
    /// bound on the whole request measured from submission, including queueing and retries
    pub deadline: Option<Duration>,
}

impl RequestParam {
    /// Create parameters without an overall deadline
    pub fn new(timeout: Duration, max_retries: u32) -> Self {
        Self {
            timeout,
            max_retries,
            deadline: None,
        }
    }

    /// Bound the whole request by `deadline`, measured from submission
    pub fn with_deadline(self, deadline: Duration) -> Self {
        Self {
            deadline: Some(deadline),
            ..self
        }
    }

    /// Bound the whole request by `timeout × (max_retries + 1)`
    pub fn with_default_deadline(self) -> Self {
        let attempts = self.max_retries.saturating_add(1);
        self.with_deadline(self.timeout.saturating_mul(attempts))
    }
}

pub(crate) type ResponseResult = Result<Vec<u8>, RequestError>;

pub(crate) struct Promise {
    tx: oneshot::Sender<ResponseResult>,
}

impl Promise {
    pub(crate) fn new(tx: oneshot::Sender<ResponseResult>) -> Self {
        Self { tx }
    }

    fn complete(self, result: ResponseResult) {
        // the caller may have stopped waiting
        self.tx.send(result).ok();
    }

    fn is_abandoned(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Everything the worker needs to execute a request
///
/// Dropping a pending request without completing it resolves the caller with
/// [`RequestError::Disposed`].
pub(crate) struct PendingRequest {
    /// unit the request is addressed to, the worker may serve every unit of a link
    pub(crate) endpoint: Endpoint,
    pub(crate) payload: Vec<u8>,
    pub(crate) timeout: Duration,
    pub(crate) retries_remaining: u32,
    /// number of attempts started so far
    pub(crate) attempts: u32,
    pub(crate) deadline: Option<Instant>,
    promise: Promise,
}

impl PendingRequest {
    pub(crate) fn new(
        endpoint: Endpoint,
        payload: Vec<u8>,
        param: RequestParam,
        promise: Promise,
    ) -> Self {
        Self {
            endpoint,
            payload,
            timeout: param.timeout,
            retries_remaining: param.max_retries,
            attempts: 0,
            deadline: param.deadline.map(|d| Instant::now() + d),
            promise,
        }
    }

    /// true if the caller dropped the transaction before it completed
    pub(crate) fn is_abandoned(&self) -> bool {
        self.promise.is_abandoned()
    }

    /// time left before the deadline, `None` if the request has no deadline
    pub(crate) fn remaining(&self, now: Instant) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(now))
    }

    pub(crate) fn reply(self, result: ResponseResult) {
        self.promise.complete(result)
    }

    pub(crate) fn fail(self, err: RequestError) {
        self.reply(Err(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Link, UnitId};

    fn endpoint() -> Endpoint {
        Link::tcp("10.0.0.7", 502).unit(UnitId::new(1))
    }

    #[test]
    fn default_deadline_covers_every_attempt() {
        let param = RequestParam::new(Duration::from_millis(100), 2).with_default_deadline();
        assert_eq!(param.deadline, Some(Duration::from_millis(300)));
    }

    #[tokio::test]
    async fn dropping_a_pending_request_closes_the_promise() {
        let (tx, rx) = oneshot::channel();
        let request = PendingRequest::new(
            endpoint(),
            vec![1],
            RequestParam::new(Duration::from_secs(1), 0),
            Promise::new(tx),
        );
        drop(request);
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn detects_abandoned_callers() {
        let (tx, rx) = oneshot::channel();
        let request = PendingRequest::new(
            endpoint(),
            vec![1],
            RequestParam::new(Duration::from_secs(1), 0),
            Promise::new(tx),
        );
        assert!(!request.is_abandoned());
        drop(rx);
        assert!(request.is_abandoned());
    }

    #[tokio::test]
    async fn remaining_time_counts_down_from_submission() {
        tokio::time::pause();
        let (tx, _rx) = oneshot::channel();
        let request = PendingRequest::new(
            endpoint(),
            vec![],
            RequestParam::new(Duration::from_secs(1), 0).with_deadline(Duration::from_secs(3)),
            Promise::new(tx),
        );

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(
            request.remaining(Instant::now()),
            Some(Duration::from_secs(2))
        );

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(request.remaining(Instant::now()), Some(Duration::ZERO));
    }
}
