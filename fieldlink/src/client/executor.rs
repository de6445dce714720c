use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::Instrument;

use crate::client::message::PendingRequest;
use crate::codec::{Decoded, FrameCodec};
use crate::decode::{BytesDisplay, DecodeLevel};
use crate::endpoint::UnitId;
use crate::error::RequestError;
use crate::events::{EventKind, EventSink};
use crate::pool::{Connection, ConnectionPool};

const READ_CHUNK: usize = 512;

/// What the worker must do after an attempt
pub(crate) enum Outcome {
    /// the request was resolved
    Done,
    /// the attempt failed and the request must be attempted again before anything else
    Retry(PendingRequest),
}

/// A valid exchange at the transport level
enum Exchange {
    Response(Vec<u8>),
    Rejected { code: u16, reason: String },
}

/// Runs single attempts of requests for the units served by one worker
///
/// Only the owning worker calls into the executor, so attempts never overlap.
pub(crate) struct Executor {
    pool: ConnectionPool,
    codec: Arc<dyn FrameCodec>,
    decode: DecodeLevel,
    max_frame_size: usize,
    events: EventSink,
    tx_buffer: Vec<u8>,
    rx_buffer: Vec<u8>,
    chunk: Box<[u8]>,
}

impl Executor {
    pub(crate) fn new(
        pool: ConnectionPool,
        codec: Arc<dyn FrameCodec>,
        decode: DecodeLevel,
        max_frame_size: usize,
        events: EventSink,
    ) -> Self {
        Self {
            pool,
            codec,
            decode,
            max_frame_size,
            events,
            tx_buffer: Vec::new(),
            rx_buffer: Vec::new(),
            chunk: vec![0; READ_CHUNK].into_boxed_slice(),
        }
    }

    /// Attempt the request once and decide between resolution and retry
    pub(crate) async fn execute(&mut self, mut request: PendingRequest) -> Outcome {
        let now = Instant::now();
        let remaining = request.remaining(now);

        if remaining == Some(Duration::ZERO) {
            self.fail(request, RequestError::Timeout);
            return Outcome::Done;
        }

        request.attempts += 1;
        let attempt = request.attempts;
        let timeout = match remaining {
            Some(remaining) => request.timeout.min(remaining),
            None => request.timeout,
        };

        let span = tracing::info_span!("transaction", endpoint = %request.endpoint, attempt);
        let result = self
            .attempt(request.endpoint.unit, &request.payload, timeout, request.deadline)
            .instrument(span)
            .await;

        let err = match result {
            Ok(response) => {
                request.reply(Ok(response));
                return Outcome::Done;
            }
            Err(err) => err,
        };

        let expired = request.remaining(Instant::now()) == Some(Duration::ZERO);
        if err.is_retryable() && request.retries_remaining > 0 && !expired {
            request.retries_remaining -= 1;
            tracing::warn!(
                "attempt {} on {} failed: {} ({} retries left)",
                attempt,
                request.endpoint,
                err,
                request.retries_remaining
            );
            self.events.endpoint(
                &request.endpoint,
                EventKind::RequestRetried {
                    attempt,
                    cause: err,
                },
            );
            return Outcome::Retry(request);
        }

        self.fail(request, err);
        Outcome::Done
    }

    fn fail(&self, request: PendingRequest, err: RequestError) {
        self.events
            .endpoint(&request.endpoint, EventKind::RequestFailed(err.clone()));
        request.fail(err);
    }

    async fn attempt(
        &mut self,
        unit: UnitId,
        payload: &[u8],
        timeout: Duration,
        deadline: Option<Instant>,
    ) -> Result<Vec<u8>, RequestError> {
        // waiting for the link counts against the deadline, not the response timeout
        let mut conn = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, self.pool.borrow()).await??,
            None => self.pool.borrow().await?,
        };

        self.tx_buffer.clear();
        self.codec
            .encode(unit, payload, &mut self.tx_buffer);

        if self.decode.payload.enabled() {
            tracing::info!(
                "PAYLOAD TX - {}",
                BytesDisplay::new(self.decode.payload.data_enabled(), payload)
            );
        }

        match self.exchange(&mut conn, unit, payload, timeout).await {
            Ok(Exchange::Response(response)) => {
                if self.decode.payload.enabled() {
                    tracing::info!(
                        "PAYLOAD RX - {}",
                        BytesDisplay::new(self.decode.payload.data_enabled(), &response)
                    );
                }
                conn.record_success();
                conn.release_healthy();
                Ok(response)
            }
            Ok(Exchange::Rejected { code, reason }) => {
                // a valid answer, the link is fine
                conn.record_success();
                conn.release_healthy();
                Err(RequestError::RemoteRejected { code, reason })
            }
            Err(err) => {
                conn.record_error();
                if err.breaks_connection() {
                    conn.release_broken();
                } else {
                    conn.release_healthy();
                }
                Err(err)
            }
        }
    }

    async fn exchange(
        &mut self,
        conn: &mut Connection,
        unit: UnitId,
        request: &[u8],
        timeout: Duration,
    ) -> Result<Exchange, RequestError> {
        let level = self.decode.physical;
        let phys = conn
            .phys()
            .ok_or(RequestError::Io(std::io::ErrorKind::NotConnected))?;

        phys.write(&self.tx_buffer, level).await?;

        let deadline = Instant::now() + timeout;
        self.rx_buffer.clear();

        loop {
            let count = tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(RequestError::Timeout);
                }
                res = phys.read(&mut self.chunk, level) => res?,
            };

            if count == 0 {
                return Err(RequestError::Io(std::io::ErrorKind::UnexpectedEof));
            }

            self.rx_buffer.extend_from_slice(&self.chunk[..count]);
            if self.rx_buffer.len() > self.max_frame_size {
                return Err(RequestError::MalformedResponse(format!(
                    "response exceeds {} bytes",
                    self.max_frame_size
                )));
            }

            match self.codec.decode(unit, request, &self.rx_buffer) {
                Decoded::Incomplete => continue,
                Decoded::Response(response) => return Ok(Exchange::Response(response)),
                Decoded::Rejected { code, reason } => {
                    return Ok(Exchange::Rejected { code, reason })
                }
                Decoded::Malformed(reason) => {
                    return Err(RequestError::MalformedResponse(reason))
                }
                Decoded::IdentityMismatch(reason) => {
                    conn.poison(reason.as_str());
                    return Err(RequestError::MalformedResponse(reason));
                }
            }
        }
    }
}
