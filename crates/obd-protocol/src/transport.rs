//! Byte transports between the requester and an adapter
//!
//! The requester only needs a half-duplex byte pipe with a bounded read and
//! a way to change the line speed. [`SerialTransport`] drives a real ELM327
//! on a tty; [`StreamTransport`] wraps any async stream (TCP, in-memory
//! duplex) for the simulator and tests.

use crate::error::ObdError;
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_serial::{SerialPort, SerialPortBuilderExt, SerialStream};
use tracing::{debug, info, trace};

/// Asynchronous byte transport to an OBD adapter
#[async_trait]
pub trait Transport: Send {
    /// Write all of `data`
    async fn send(&mut self, data: &[u8]) -> Result<(), ObdError>;

    /// Read whatever is available, waiting at most `timeout`.
    ///
    /// Returns [`ObdError::Timeout`] if nothing arrived in time and `Ok(0)`
    /// once the peer has closed the stream.
    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, ObdError>;

    /// Change the local line speed
    async fn set_baud_rate(&mut self, baud_rate: u32) -> Result<(), ObdError>;

    /// Current local line speed, if the transport has one
    fn baud_rate(&self) -> Option<u32>;

    /// Release the underlying device
    async fn close(&mut self) -> Result<(), ObdError>;
}

/// ELM327 on a serial device, 8N1 without flow control
pub struct SerialTransport {
    port: Option<SerialStream>,
    path: String,
}

impl SerialTransport {
    /// Open `path` in raw mode at `baud_rate`
    pub fn open(path: &str, baud_rate: u32) -> Result<Self, ObdError> {
        debug!("Opening serial device {} at {} baud", path, baud_rate);
        let port = tokio_serial::new(path, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .stop_bits(tokio_serial::StopBits::One)
            .parity(tokio_serial::Parity::None)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| ObdError::SerialError(format!("{}: {}", path, e)))?;
        info!("Serial device {} opened", path);
        Ok(Self {
            port: Some(port),
            path: path.to_string(),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn port_mut(&mut self) -> Result<&mut SerialStream, ObdError> {
        self.port
            .as_mut()
            .ok_or_else(|| ObdError::SerialError(format!("{} is closed", self.path)))
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn send(&mut self, data: &[u8]) -> Result<(), ObdError> {
        let port = self.port_mut()?;
        port.write_all(data).await?;
        port.flush().await?;
        trace!("Sent {} bytes", data.len());
        Ok(())
    }

    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, ObdError> {
        let port = self.port_mut()?;
        match tokio::time::timeout(timeout, port.read(buf)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ObdError::Timeout(timeout.as_millis() as u64)),
        }
    }

    async fn set_baud_rate(&mut self, baud_rate: u32) -> Result<(), ObdError> {
        self.port_mut()?.set_baud_rate(baud_rate)?;
        debug!("Local baud rate set to {}", baud_rate);
        Ok(())
    }

    fn baud_rate(&self) -> Option<u32> {
        self.port.as_ref().and_then(|p| p.baud_rate().ok())
    }

    async fn close(&mut self) -> Result<(), ObdError> {
        if self.port.take().is_some() {
            debug!("Closed serial device {}", self.path);
        }
        Ok(())
    }
}

/// Any async byte stream used as an adapter link.
///
/// There is no line speed to change; requested rates are only recorded.
pub struct StreamTransport<S> {
    stream: Option<S>,
    baud_rate: Option<u32>,
}

impl<S> StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream: Some(stream),
            baud_rate: None,
        }
    }

    fn stream_mut(&mut self) -> Result<&mut S, ObdError> {
        self.stream
            .as_mut()
            .ok_or_else(|| ObdError::SerialError("stream is closed".to_string()))
    }
}

#[async_trait]
impl<S> Transport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, data: &[u8]) -> Result<(), ObdError> {
        let stream = self.stream_mut()?;
        stream.write_all(data).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, ObdError> {
        let stream = self.stream_mut()?;
        match tokio::time::timeout(timeout, stream.read(buf)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ObdError::Timeout(timeout.as_millis() as u64)),
        }
    }

    async fn set_baud_rate(&mut self, baud_rate: u32) -> Result<(), ObdError> {
        self.baud_rate = Some(baud_rate);
        Ok(())
    }

    fn baud_rate(&self) -> Option<u32> {
        self.baud_rate
    }

    async fn close(&mut self) -> Result<(), ObdError> {
        if let Some(mut stream) = self.stream.take() {
            stream.shutdown().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stream_roundtrip() {
        let (a, b) = tokio::io::duplex(64);
        let mut left = StreamTransport::new(a);
        let mut right = StreamTransport::new(b);

        left.send(b"ATZ\r").await.unwrap();
        let mut buf = [0u8; 16];
        let n = right.receive(&mut buf, Duration::from_secs(1)).await.unwrap();
        assert_eq!(&buf[..n], b"ATZ\r");
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_timeout() {
        let (a, _b) = tokio::io::duplex(64);
        let mut t = StreamTransport::new(a);
        let mut buf = [0u8; 16];
        let err = t.receive(&mut buf, Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, ObdError::Timeout(50)));
    }

    #[tokio::test]
    async fn test_closed_stream_rejects_io() {
        let (a, _b) = tokio::io::duplex(64);
        let mut t = StreamTransport::new(a);
        t.set_baud_rate(38400).await.unwrap();
        assert_eq!(t.baud_rate(), Some(38400));
        t.close().await.unwrap();
        assert!(t.send(b"0100\r").await.is_err());
    }
}
