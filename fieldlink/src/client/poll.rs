use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::client::channel::{Channel, Transaction};
use crate::client::listener::Listener;
use crate::client::message::{RequestParam, ResponseResult};
use crate::error::RequestError;

pub(crate) type Supplier = Box<dyn FnMut() -> Vec<u8> + Send>;

/// Handle to a periodic poll
///
/// Polling stops when the handle is dropped or [`PollHandle::cancel`] is called.
#[derive(Debug)]
pub struct PollHandle {
    cancel: CancellationToken,
    skipped: Arc<AtomicU64>,
}

impl PollHandle {
    /// Stop polling. Idempotent
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// True once the poll has stopped, either cancelled or because its endpoint was disposed
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Number of ticks skipped because the previous request was still outstanding
    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }
}

impl Drop for PollHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub(crate) fn spawn_poll(
    channel: Channel,
    supplier: Supplier,
    interval: Duration,
    param: RequestParam,
    listener: Box<dyn Listener<ResponseResult>>,
) -> PollHandle {
    let cancel = CancellationToken::new();
    let skipped = Arc::new(AtomicU64::new(0));

    let task = PollTask {
        channel,
        supplier,
        param,
        listener,
        skipped: skipped.clone(),
    };
    tokio::spawn(task.run(interval, cancel.clone()));

    PollHandle { cancel, skipped }
}

struct PollTask {
    channel: Channel,
    supplier: Supplier,
    param: RequestParam,
    listener: Box<dyn Listener<ResponseResult>>,
    skipped: Arc<AtomicU64>,
}

impl PollTask {
    async fn run(mut self, period: Duration, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        // at most one outstanding request per registration
        let mut in_flight: Option<Transaction> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = next_result(&mut in_flight), if in_flight.is_some() => {
                    in_flight = None;
                    let disposed = result == Err(RequestError::Disposed);
                    self.listener.update(result).get().await;
                    if disposed {
                        tracing::info!("{} disposed, poll stopped", self.channel.endpoint());
                        cancel.cancel();
                        break;
                    }
                }
                _ = interval.tick() => {
                    if in_flight.is_some() {
                        let skipped = self.skipped.fetch_add(1, Ordering::Relaxed) + 1;
                        tracing::debug!(
                            "poll of {} still outstanding, tick skipped ({} total)",
                            self.channel.endpoint(),
                            skipped
                        );
                    } else {
                        let payload = (self.supplier)();
                        in_flight = Some(self.channel.submit(payload, self.param));
                    }
                }
            }
        }
    }
}

async fn next_result(in_flight: &mut Option<Transaction>) -> ResponseResult {
    match in_flight {
        Some(transaction) => transaction.await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::listener::ChannelListener;
    use crate::codec::DelimitedCodec;
    use crate::mock::{MockFactory, MockReply};
    use crate::{Link, TransportConfig, TransportManager, UnitId};

    fn manager(factory: &MockFactory) -> TransportManager {
        TransportManager::new(
            TransportConfig::default(),
            factory.clone(),
            DelimitedCodec::default(),
        )
    }

    #[tokio::test]
    async fn delivers_every_result_to_the_listener() {
        tokio::time::pause();
        let factory = MockFactory::new(|_, _| MockReply::line("7"));
        let manager = manager(&factory);
        let channel = manager.channel(&Link::tcp("10.0.0.9", 502).unit(UnitId::new(1)));

        let (listener, mut rx) = ChannelListener::create(8);
        let handle = channel.register_poll(
            || b"temp".to_vec(),
            Duration::from_secs(1),
            RequestParam::new(Duration::from_millis(100), 0),
            Box::new(listener),
        );

        for _ in 0..3 {
            assert_eq!(rx.recv().await, Some(Ok(b"7".to_vec())));
        }
        assert_eq!(handle.skipped(), 0);
    }

    #[tokio::test]
    async fn skips_ticks_while_a_request_is_outstanding() {
        tokio::time::pause();
        let factory = MockFactory::new(|_, _| {
            MockReply::Delayed(Duration::from_millis(2500), Box::new(MockReply::line("slow")))
        });
        let manager = manager(&factory);
        let channel = manager.channel(&Link::tcp("10.0.0.9", 502).unit(UnitId::new(1)));

        let (listener, mut rx) = ChannelListener::create(8);
        let handle = channel.register_poll(
            || b"slow".to_vec(),
            Duration::from_secs(1),
            RequestParam::new(Duration::from_secs(5), 0),
            Box::new(listener),
        );

        assert_eq!(rx.recv().await, Some(Ok(b"slow".to_vec())));
        // ticks at 1s and 2s happened during the first request
        assert_eq!(handle.skipped(), 2);
        assert_eq!(factory.requests().len(), 1);
    }

    #[tokio::test]
    async fn dropping_the_handle_stops_polling() {
        tokio::time::pause();
        let factory = MockFactory::new(|_, _| MockReply::line("1"));
        let manager = manager(&factory);
        let channel = manager.channel(&Link::tcp("10.0.0.9", 502).unit(UnitId::new(1)));

        let (listener, mut rx) = ChannelListener::create(8);
        let handle = channel.register_poll(
            || b"x".to_vec(),
            Duration::from_secs(1),
            RequestParam::new(Duration::from_millis(100), 0),
            Box::new(listener),
        );
        assert!(rx.recv().await.is_some());

        drop(handle);
        // the task ends and drops the listener, closing the channel
        while rx.recv().await.is_some() {}
        let polled = factory.requests().len();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(factory.requests().len(), polled);
    }
}
