//! Helpers shared by the integration tests

use std::time::Duration;

use fieldlink::mock::{MockFactory, MockReply};
use fieldlink::*;

/// Manager over simulated devices using the delimiter codec
pub fn manager(factory: &MockFactory, config: TransportConfig) -> TransportManager {
    TransportManager::new(config, factory.clone(), DelimitedCodec::default())
}

/// A serial line with default settings
pub fn serial_link() -> Link {
    Link::serial("/dev/ttyUSB0", SerialSettings::default())
}

/// A TCP link with the given last address octet
pub fn tcp_link(host: u8) -> Link {
    Link::tcp(format!("192.168.0.{host}"), 4001)
}

/// Request parameters with a timeout in milliseconds and a retry budget
pub fn param(timeout_ms: u64, retries: u32) -> RequestParam {
    RequestParam::new(Duration::from_millis(timeout_ms), retries)
}

/// Reply with the received frame, after `delay`
pub fn echo(delay: Duration) -> impl FnMut(&Link, &[u8]) -> MockReply + Send + 'static {
    move |_, request| {
        let reply = MockReply::Raw(request.to_vec());
        if delay.is_zero() {
            reply
        } else {
            MockReply::Delayed(delay, Box::new(reply))
        }
    }
}

/// Payloads of every request received by the devices, without the delimiter
pub fn received(factory: &MockFactory) -> Vec<String> {
    factory
        .requests()
        .into_iter()
        .map(|(_, frame)| String::from_utf8_lossy(&frame).trim_end().to_string())
        .collect()
}

/// Drain every event published so far
pub fn drain_events(rx: &mut tokio::sync::broadcast::Receiver<TransportEvent>) -> Vec<EventKind> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event.kind);
    }
    events
}
