use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::decode::{BytesDisplay, PhysDecodeLevel};

/// Any byte stream that can back a connection (in-memory pipes, custom transports)
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Live transport handle owned by a connection
pub struct PhysLayer {
    layer: PhysLayerImpl,
}

// encapsulates all possible physical layers as an enum
enum PhysLayerImpl {
    Tcp(tokio::net::TcpStream),
    #[cfg(feature = "serial")]
    Serial(
        tokio_serial::SerialStream,
        tokio::time::Duration,
        Option<tokio::time::Instant>,
    ),
    Stream(Box<dyn AsyncStream>),
}

impl std::fmt::Debug for PhysLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match &self.layer {
            PhysLayerImpl::Tcp(_) => f.write_str("Tcp"),
            #[cfg(feature = "serial")]
            PhysLayerImpl::Serial(_, _, _) => f.write_str("Serial"),
            PhysLayerImpl::Stream(_) => f.write_str("Stream"),
        }
    }
}

impl PhysLayer {
    /// Wrap a connected TCP socket
    pub fn tcp(socket: tokio::net::TcpStream) -> Self {
        if let Err(err) = socket.set_nodelay(true) {
            tracing::warn!("unable to enable TCP_NODELAY: {}", err);
        }
        Self {
            layer: PhysLayerImpl::Tcp(socket),
        }
    }

    /// Wrap an open serial port
    #[cfg(feature = "serial")]
    pub fn serial(stream: tokio_serial::SerialStream) -> Self {
        let turnaround = calculate_turnaround_delay(&stream);
        Self {
            layer: PhysLayerImpl::Serial(stream, turnaround, None),
        }
    }

    /// Wrap any other byte stream
    pub fn stream<S>(stream: S) -> Self
    where
        S: AsyncStream + 'static,
    {
        Self {
            layer: PhysLayerImpl::Stream(Box::new(stream)),
        }
    }

    pub(crate) async fn read(
        &mut self,
        buffer: &mut [u8],
        decode_level: PhysDecodeLevel,
    ) -> Result<usize, std::io::Error> {
        let length = match &mut self.layer {
            PhysLayerImpl::Tcp(x) => x.read(buffer).await?,
            #[cfg(feature = "serial")]
            PhysLayerImpl::Serial(x, _, last_activity) => {
                let length = x.read(buffer).await?;
                *last_activity = Some(tokio::time::Instant::now());
                length
            }
            PhysLayerImpl::Stream(x) => x.read(buffer).await?,
        };

        if decode_level.enabled() {
            if let Some(x) = buffer.get(0..length) {
                tracing::info!(
                    "PHYS RX - {}",
                    BytesDisplay::new(decode_level.data_enabled(), x)
                )
            }
        }

        Ok(length)
    }

    pub(crate) async fn write(
        &mut self,
        data: &[u8],
        decode_level: PhysDecodeLevel,
    ) -> Result<(), std::io::Error> {
        if decode_level.enabled() {
            tracing::info!(
                "PHYS TX - {}",
                BytesDisplay::new(decode_level.data_enabled(), data)
            );
        }

        match &mut self.layer {
            PhysLayerImpl::Tcp(x) => x.write_all(data).await,
            #[cfg(feature = "serial")]
            PhysLayerImpl::Serial(x, turnaround, last_activity) => {
                // give the line time to turn around since the last frame
                if let Some(last_activity) = last_activity {
                    tokio::time::sleep_until(*last_activity + *turnaround).await;
                }
                x.write_all(data).await?;
                *last_activity = Some(tokio::time::Instant::now());
                Ok(())
            }
            PhysLayerImpl::Stream(x) => {
                x.write_all(data).await?;
                x.flush().await
            }
        }
    }
}

#[cfg(feature = "serial")]
fn calculate_turnaround_delay(serial: &tokio_serial::SerialStream) -> tokio::time::Duration {
    use tokio::time::Duration;
    use tokio_serial::SerialPort;

    // 1 start, 8 data, 1 parity or stop, 1 stop
    const NUM_BITS_IN_CHAR: u64 = 11;

    // above this rate the gap is fixed
    const MAX_BAUD_RATE: u32 = 19200;
    const MIN_DELAY: Duration = Duration::from_micros(1750);

    match serial.baud_rate() {
        Ok(baud_rate) if baud_rate <= MAX_BAUD_RATE => {
            let character_time = Duration::from_secs(NUM_BITS_IN_CHAR) / baud_rate;
            35 * character_time / 10 // multiply by 3.5
        }
        Ok(_) => MIN_DELAY,
        Err(_) => {
            tracing::warn!(
                "unable to determine the baud rate, defaulting to {} us",
                MIN_DELAY.as_micros()
            );
            MIN_DELAY
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stream_layer_reads_and_writes() {
        let mock = tokio_test::io::Builder::new()
            .write(b"PING\n")
            .read(b"PONG\n")
            .build();
        let mut phys = PhysLayer::stream(mock);

        phys.write(b"PING\n", PhysDecodeLevel::Data).await.unwrap();

        let mut buffer = [0u8; 16];
        let count = phys.read(&mut buffer, PhysDecodeLevel::Length).await.unwrap();
        assert_eq!(&buffer[..count], b"PONG\n");
    }

    #[tokio::test]
    async fn read_errors_are_returned() {
        let mock = tokio_test::io::Builder::new()
            .read_error(std::io::Error::from(std::io::ErrorKind::ConnectionReset))
            .build();
        let mut phys = PhysLayer::stream(mock);

        let mut buffer = [0u8; 16];
        let err = phys
            .read(&mut buffer, PhysDecodeLevel::Nothing)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::ConnectionReset);
    }
}
