// src/connection/transport.rs - Byte streams a connection can run over
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use super::ConnectionError;

/// Any duplex byte stream.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

/// Opens transports by port name.
#[async_trait]
pub trait TransportProvider: Send + Sync {
    async fn open(&self, port: &str, baud: u32) -> Result<Box<dyn Transport>, ConnectionError>;

    fn available_ports(&self) -> Vec<String>;
}

/// Hardware serial ports via serial2-tokio.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialTransport;

#[async_trait]
impl TransportProvider for SerialTransport {
    async fn open(&self, port: &str, baud: u32) -> Result<Box<dyn Transport>, ConnectionError> {
        tracing::info!("Opening serial port {} at {} baud", port, baud);
        let serial = serial2_tokio::SerialPort::open(port, baud)?;
        Ok(Box::new(serial))
    }

    fn available_ports(&self) -> Vec<String> {
        match serial2_tokio::SerialPort::available_ports() {
            Ok(paths) => paths.iter().map(|p| p.display().to_string()).collect(),
            Err(e) => {
                tracing::warn!("Could not list serial ports: {}", e);
                vec![]
            }
        }
    }
}
