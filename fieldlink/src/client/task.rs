use tokio_util::sync::CancellationToken;

use crate::channel::Receiver;
use crate::client::executor::{Executor, Outcome};
use crate::client::message::PendingRequest;
use crate::endpoint::{Endpoint, Link, LinkKind};
use crate::error::{RequestError, Shutdown};
use crate::retry::RetryStrategy;

/// The requests one worker is responsible for
///
/// A serial line, like a custom transport, carries a single exchange at a time for every unit
/// on it, so all of its units share one worker and one queue. Units behind a TCP link are
/// independent and each get their own.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) enum Lane {
    /// every unit of a link
    Line(Link),
    /// a single unit
    Unit(Endpoint),
}

impl Lane {
    pub(crate) fn of(endpoint: &Endpoint) -> Self {
        match endpoint.link.kind() {
            LinkKind::Tcp => Lane::Unit(endpoint.clone()),
            LinkKind::Serial | LinkKind::Other => Lane::Line(endpoint.link.clone()),
        }
    }
}

impl std::fmt::Display for Lane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Lane::Line(link) => write!(f, "{link}"),
            Lane::Unit(endpoint) => write!(f, "{endpoint}"),
        }
    }
}

/// Worker that serializes every request of a [`Lane`]
///
/// Requests are executed strictly in submission order, one at a time. A request that must be
/// retried is held in the front slot and attempted again before the queue is read.
pub(crate) struct WorkerTask {
    lane: Lane,
    rx: Receiver<PendingRequest>,
    front: Option<PendingRequest>,
    executor: Executor,
    retry: Box<dyn RetryStrategy>,
    cancel: CancellationToken,
}

impl WorkerTask {
    pub(crate) fn new(
        lane: Lane,
        rx: Receiver<PendingRequest>,
        executor: Executor,
        retry: Box<dyn RetryStrategy>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            lane,
            rx,
            front: None,
            executor,
            retry,
            cancel,
        }
    }

    pub(crate) async fn run(mut self) {
        tracing::debug!("worker for {} started", self.lane);

        let _ = self.process().await;

        // anything still pending resolves with Disposed
        let remaining = self.front.take().into_iter().chain(self.rx.close_and_drain());
        let mut count = 0;
        for request in remaining {
            request.fail(RequestError::Disposed);
            count += 1;
        }

        tracing::info!(
            "worker for {} stopped, {} pending request(s) disposed",
            self.lane,
            count
        );
    }

    async fn process(&mut self) -> Result<(), Shutdown> {
        loop {
            let request = self.next_request().await?;

            // dropped by the caller, or its deadline passed while it was queued
            if request.is_abandoned() {
                tracing::debug!("skipping request for {} abandoned by its caller", request.endpoint);
                continue;
            }

            let outcome = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    // dropping the attempt abandons its connection and disposes the request
                    return Err(Shutdown);
                }
                outcome = self.executor.execute(request) => outcome,
            };

            match outcome {
                Outcome::Done => self.retry.reset(),
                Outcome::Retry(request) => {
                    let delay = self.retry.after_failed_attempt();
                    self.front = Some(request);
                    if !delay.is_zero() {
                        tokio::select! {
                            _ = self.cancel.cancelled() => return Err(Shutdown),
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        }
    }

    async fn next_request(&mut self) -> Result<PendingRequest, Shutdown> {
        if let Some(request) = self.front.take() {
            return Ok(request);
        }

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Shutdown),
            request = self.rx.recv() => request,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::UnitId;

    #[test]
    fn serial_units_share_a_lane() {
        let line = Link::serial("/dev/ttyUSB1", Default::default());
        assert_eq!(
            Lane::of(&line.unit(UnitId::new(1))),
            Lane::of(&line.unit(UnitId::new(2)))
        );

        let other = Link::Other("can0".to_string());
        assert_eq!(
            Lane::of(&other.unit(UnitId::new(1))),
            Lane::of(&other.unit(UnitId::new(7)))
        );
    }

    #[test]
    fn tcp_units_have_their_own_lane() {
        let gateway = Link::tcp("10.0.0.3", 502);
        assert_ne!(
            Lane::of(&gateway.unit(UnitId::new(1))),
            Lane::of(&gateway.unit(UnitId::new(2)))
        );
        assert_eq!(
            Lane::of(&gateway.unit(UnitId::new(1))).to_string(),
            "tcp://10.0.0.3:502/0x01"
        );
    }
}
