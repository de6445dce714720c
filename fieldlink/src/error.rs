/// Terminal outcome of a request that did not produce a response
///
/// Every request resolves exactly once, either with the response payload or with one of
/// these errors. Transport level kinds are retried by the executor before they are
/// reported; semantic kinds are reported immediately.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    /// the factory could not establish a connection (network unreachable, port busy)
    #[error("unable to connect: {0:?}")]
    ConnectFailed(std::io::ErrorKind),
    /// the connection failed while reading or writing (reset, broken pipe, closed)
    #[error("i/o error: {0:?}")]
    Io(std::io::ErrorKind),
    /// no response was received within the timeout or the overall deadline expired
    #[error("timeout occurred before receiving a response")]
    Timeout,
    /// bytes were received but could not be decoded as a valid response frame
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    /// the device answered with a protocol level error
    #[error("request rejected by the remote device (code {code}): {reason}")]
    RemoteRejected {
        /// protocol specific error code
        code: u16,
        /// description provided by the codec
        reason: String,
    },
    /// the endpoint request queue is full
    #[error("request queue is full")]
    QueueFull,
    /// the endpoint was disposed while the request was pending
    #[error("endpoint was disposed")]
    Disposed,
}

impl RequestError {
    /// True for transport level failures the executor may retry on a fresh connection
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RequestError::ConnectFailed(_)
                | RequestError::Io(_)
                | RequestError::Timeout
                | RequestError::MalformedResponse(_)
        )
    }

    /// True when the failure leaves the connection in an unknown state
    pub(crate) fn breaks_connection(&self) -> bool {
        matches!(
            self,
            RequestError::Io(_) | RequestError::Timeout | RequestError::MalformedResponse(_)
        )
    }
}

impl From<std::io::Error> for RequestError {
    fn from(err: std::io::Error) -> Self {
        RequestError::Io(err.kind())
    }
}

impl From<tokio::time::error::Elapsed> for RequestError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        RequestError::Timeout
    }
}

/// Error type that indicates that a queue or task has been shut down
#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("the task was shut down")]
pub struct Shutdown;

impl From<Shutdown> for RequestError {
    fn from(_: Shutdown) -> Self {
        RequestError::Disposed
    }
}
