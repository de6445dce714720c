use tokio::sync::broadcast;

use crate::endpoint::{Endpoint, Link, UnitId};
use crate::error::RequestError;
use crate::pool::EvictionReason;

const EVENT_CAPACITY: usize = 256;

/// Diagnostic event emitted by pools and workers
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportEvent {
    /// link the event relates to
    pub link: Link,
    /// unit the event relates to, if it concerns a request
    pub unit: Option<UnitId>,
    /// what happened
    pub kind: EventKind,
}

/// Kinds of [`TransportEvent`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EventKind {
    /// the factory created a new connection
    ConnectionCreated {
        /// pool-local connection id
        id: u64,
    },
    /// a connection was discarded
    ConnectionEvicted {
        /// pool-local connection id
        id: u64,
        /// why it was discarded
        reason: EvictionReason,
    },
    /// an attempt failed and the request is being retried
    RequestRetried {
        /// number of the attempt that failed, starting at 1
        attempt: u32,
        /// failure of that attempt
        cause: RequestError,
    },
    /// the request resolved with a terminal error
    RequestFailed(RequestError),
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventKind::ConnectionCreated { id } => write!(f, "connection {id} created"),
            EventKind::ConnectionEvicted { id, reason } => {
                write!(f, "connection {id} evicted: {reason}")
            }
            EventKind::RequestRetried { attempt, cause } => {
                write!(f, "attempt {attempt} failed ({cause}), retrying")
            }
            EventKind::RequestFailed(err) => write!(f, "request failed: {err}"),
        }
    }
}

/// Publishes events to subscribers and to the log
#[derive(Clone, Debug)]
pub(crate) struct EventSink {
    tx: broadcast::Sender<TransportEvent>,
}

impl EventSink {
    pub(crate) fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.tx.subscribe()
    }

    pub(crate) fn link(&self, link: &Link, kind: EventKind) {
        self.emit(TransportEvent {
            link: link.clone(),
            unit: None,
            kind,
        })
    }

    pub(crate) fn endpoint(&self, endpoint: &Endpoint, kind: EventKind) {
        self.emit(TransportEvent {
            link: endpoint.link.clone(),
            unit: Some(endpoint.unit),
            kind,
        })
    }

    fn emit(&self, event: TransportEvent) {
        match &event.kind {
            EventKind::ConnectionCreated { .. } => {
                tracing::info!("{} - {}", event.link, event.kind)
            }
            _ => tracing::warn!("{} - {}", event.link, event.kind),
        }
        // no subscribers is fine
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_events() {
        let sink = EventSink::new();
        let mut rx = sink.subscribe();
        let link = Link::tcp("127.0.0.1", 502);

        sink.link(&link, EventKind::ConnectionCreated { id: 7 });
        sink.endpoint(
            &link.unit(UnitId::new(4)),
            EventKind::RequestFailed(RequestError::Timeout),
        );

        let first = rx.recv().await.unwrap();
        assert_eq!(first.kind, EventKind::ConnectionCreated { id: 7 });
        assert_eq!(first.unit, None);

        let second = rx.recv().await.unwrap();
        assert_eq!(second.unit, Some(UnitId::new(4)));
        assert_eq!(second.kind, EventKind::RequestFailed(RequestError::Timeout));
    }

    #[test]
    fn emitting_without_subscribers_is_harmless() {
        let sink = EventSink::new();
        sink.link(&Link::Other("x".to_string()), EventKind::ConnectionCreated { id: 1 });
    }
}
