use std::time::Duration;

use crate::endpoint::Link;
use crate::pool::connection::Connection;
use crate::pool::phys::PhysLayer;
use crate::MaybeAsync;

/// Creates, validates, and destroys connections for links
///
/// `create` makes exactly one attempt; retry policy belongs to the transaction executor.
pub trait ConnectionFactory: Send + Sync + 'static {
    /// Open a new transport handle for `link`
    fn create(&self, link: &Link) -> MaybeAsync<std::io::Result<PhysLayer>>;

    /// Cheap health check run before an idle connection is handed out
    fn validate(&self, connection: &Connection) -> bool {
        connection.is_open()
    }

    /// Release the transport handle
    ///
    /// Must be idempotent and must not fail; errors while closing are swallowed.
    fn destroy(&self, connection: &mut Connection) {
        connection.close();
    }
}

/// Factory for TCP sockets and serial ports
///
/// `Link::Other` links are refused with `ErrorKind::Unsupported`; use a custom factory for them.
#[derive(Copy, Clone, Debug)]
pub struct DefaultConnectionFactory {
    connect_timeout: Duration,
}

impl DefaultConnectionFactory {
    /// Create a factory that bounds TCP connects by `connect_timeout`
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for DefaultConnectionFactory {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl ConnectionFactory for DefaultConnectionFactory {
    fn create(&self, link: &Link) -> MaybeAsync<std::io::Result<PhysLayer>> {
        match link {
            Link::Tcp { host, port } => {
                let addr = (host.clone(), *port);
                MaybeAsync::asynchronous(connect_tcp(addr, self.connect_timeout))
            }
            #[cfg(feature = "serial")]
            Link::Serial { path, settings } => MaybeAsync::ready(open_serial(path, *settings)),
            #[cfg(not(feature = "serial"))]
            Link::Serial { .. } => MaybeAsync::ready(Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "serial support is not enabled",
            ))),
            Link::Other(name) => MaybeAsync::ready(Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                format!("no transport registered for '{name}'"),
            ))),
        }
    }
}

async fn connect_tcp(addr: (String, u16), timeout: Duration) -> std::io::Result<PhysLayer> {
    match tokio::time::timeout(timeout, tokio::net::TcpStream::connect(&addr)).await {
        Ok(Ok(socket)) => {
            tracing::info!("connected to {}:{}", addr.0, addr.1);
            Ok(PhysLayer::tcp(socket))
        }
        Ok(Err(err)) => Err(err),
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("connect timeout after {} ms", timeout.as_millis()),
        )),
    }
}

#[cfg(feature = "serial")]
fn open_serial(path: &str, settings: crate::SerialSettings) -> std::io::Result<PhysLayer> {
    use tokio_serial::SerialPortBuilderExt;

    // all line parameters are applied when the port is opened
    let stream = tokio_serial::new(path, settings.baud_rate)
        .data_bits(settings.data_bits.into())
        .flow_control(settings.flow_control.into())
        .parity(settings.parity.into())
        .stop_bits(settings.stop_bits.into())
        .open_native_async()
        .map_err(|err| {
            let kind = match err.kind() {
                tokio_serial::ErrorKind::NoDevice => std::io::ErrorKind::NotFound,
                tokio_serial::ErrorKind::InvalidInput => std::io::ErrorKind::InvalidInput,
                tokio_serial::ErrorKind::Io(kind) => kind,
                tokio_serial::ErrorKind::Unknown => std::io::ErrorKind::Other,
            };
            std::io::Error::new(kind, format!("failed to open serial port '{path}': {err}"))
        })?;

    tracing::info!("serial port {} open", path);
    Ok(PhysLayer::serial(stream))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn other_links_are_unsupported() {
        let factory = DefaultConnectionFactory::default();
        let err = factory
            .create(&Link::Other("can0".to_string()))
            .get()
            .await
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::Unsupported);
    }

    #[tokio::test]
    async fn connects_to_a_listening_socket() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept = tokio::spawn(async move { listener.accept().await.map(|_| ()) });

        let factory = DefaultConnectionFactory::new(Duration::from_secs(1));
        let phys = factory.create(&Link::tcp("127.0.0.1", port)).get().await;
        assert!(phys.is_ok());
        accept.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn refused_connections_are_errors() {
        // bind then drop to obtain a port nobody listens on
        let port = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let factory = DefaultConnectionFactory::new(Duration::from_secs(1));
        let result = factory.create(&Link::tcp("127.0.0.1", port)).get().await;
        assert!(result.is_err());
    }
}
