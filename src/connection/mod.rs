// src/connection/mod.rs - Serial line framing, handshake and instruction encoding
pub mod message;
pub mod transport;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::config::SerialConfig;
use crate::gcode::{helpers, Field, Instruction};
pub use message::PrinterMessage;
pub use transport::{SerialTransport, Transport, TransportProvider};

/// Banner keys that identify a printer during the handshake.
const BANNER_KEYS: [&str; 2] = ["FIRMWARE_NAME", "X-SERIAL_NUMBER"];
const MESSAGE_CHANNEL_SIZE: usize = 256;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),
    #[error("Handshake failed: {0}")]
    Handshake(String),
    #[error("Connection closed")]
    Closed,
    #[error("Not connected")]
    NotConnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireEncoding {
    Ascii,
    #[default]
    Binary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Pending,
    Connected,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub lines_sent: u64,
    pub lines_received: u64,
    pub unknown_lines: u64,
}

#[derive(Debug, Default)]
struct Counters {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    lines_sent: AtomicU64,
    lines_received: AtomicU64,
    unknown_lines: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> ConnectionStats {
        ConnectionStats {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            lines_sent: self.lines_sent.load(Ordering::Relaxed),
            lines_received: self.lines_received.load(Ordering::Relaxed),
            unknown_lines: self.unknown_lines.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub encoding: WireEncoding,
    pub handshake_timeout: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self { encoding: WireEncoding::default(), handshake_timeout: Duration::from_secs(5) }
    }
}

impl From<&SerialConfig> for ConnectionOptions {
    fn from(config: &SerialConfig) -> Self {
        Self {
            encoding: config.encoding,
            handshake_timeout: Duration::from_millis(config.handshake_timeout_ms),
        }
    }
}

/// Splits a byte stream into text lines on `\n` or `\r`.
#[derive(Debug, Default)]
pub struct LineFramer {
    buffer: Vec<u8>,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes and return every line completed by them. Empty lines are
    /// dropped; an unterminated tail stays buffered.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(end) = self.buffer.iter().position(|b| *b == b'\n' || *b == b'\r') {
            let raw: Vec<u8> = self.buffer.drain(..=end).collect();
            let line = String::from_utf8_lossy(&raw[..raw.len() - 1]).trim().to_string();
            if !line.is_empty() {
                lines.push(line);
            }
        }
        lines
    }
}

/// XOR checksum appended to numbered ASCII lines.
pub fn ascii_checksum(text: &str) -> u8 {
    text.bytes().fold(0, |acc, b| acc ^ b)
}

/// Bytes put on the wire for one instruction.
pub fn encode(code: &Instruction, encoding: WireEncoding) -> Vec<u8> {
    match encoding {
        WireEncoding::Binary => code.to_binary(),
        WireEncoding::Ascii => {
            let mut text = code.without_comment().to_ascii();
            if code.has(Field::N) {
                let checksum = ascii_checksum(&text);
                text.push_str(&format!("*{}", checksum));
            }
            text.push('\n');
            text.into_bytes()
        }
    }
}

/// An open link to one printer.
///
/// A dedicated task frames and classifies everything the printer sends;
/// the classified messages are handed out once through [`Connection::take_messages`].
pub struct Connection {
    writer: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    messages: Mutex<Option<mpsc::Receiver<PrinterMessage>>>,
    state: Arc<watch::Sender<ConnectionState>>,
    encoding: WireEncoding,
    counters: Arc<Counters>,
    banner: BTreeMap<String, String>,
    reader: JoinHandle<()>,
}

impl Connection {
    /// Start reading, send the identification request and wait for the
    /// banner. On failure the connection is torn down, never half open.
    pub async fn open<S>(stream: S, options: ConnectionOptions) -> Result<Self, ConnectionError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        tracing::info!("Opening printer connection ({:?} encoding)", options.encoding);
        let (state, _) = watch::channel(ConnectionState::Pending);
        let state = Arc::new(state);
        let counters = Arc::new(Counters::default());
        let (read_half, write_half) = tokio::io::split(stream);
        let (tx, mut rx) = mpsc::channel(MESSAGE_CHANNEL_SIZE);
        let reader = tokio::spawn(read_loop(read_half, tx, counters.clone(), state.clone()));

        let mut connection = Self {
            writer: Mutex::new(Box::new(write_half)),
            messages: Mutex::new(None),
            state,
            encoding: options.encoding,
            counters,
            banner: BTreeMap::new(),
            reader,
        };

        let result =
            tokio::time::timeout(options.handshake_timeout, connection.handshake(&mut rx)).await;
        match result {
            Ok(Ok(banner)) => {
                tracing::info!("Printer identified: {:?}", banner);
                connection.banner = banner;
                *connection.messages.lock().await = Some(rx);
                connection.state.send_replace(ConnectionState::Connected);
                Ok(connection)
            }
            Ok(Err(e)) => {
                tracing::error!("Handshake failed: {}", e);
                connection.close().await;
                Err(e)
            }
            Err(_) => {
                tracing::error!("Handshake timed out after {:?}", options.handshake_timeout);
                connection.close().await;
                Err(ConnectionError::HandshakeTimeout(options.handshake_timeout))
            }
        }
    }

    async fn handshake(
        &self,
        rx: &mut mpsc::Receiver<PrinterMessage>,
    ) -> Result<BTreeMap<String, String>, ConnectionError> {
        self.write(&helpers::firmware_info()).await?;
        loop {
            match rx.recv().await {
                None => return Err(ConnectionError::Closed),
                Some(PrinterMessage::Confirmation { params, .. })
                    if BANNER_KEYS.iter().any(|key| params.contains_key(*key)) =>
                {
                    return Ok(params);
                }
                Some(PrinterMessage::Error { code, .. }) => {
                    return Err(ConnectionError::Handshake(format!(
                        "printer answered identification with error {}",
                        code
                    )));
                }
                Some(other) => tracing::debug!("Ignoring '{}' during handshake", other),
            }
        }
    }

    /// Classified messages; available once, to the session that owns the link.
    pub async fn take_messages(&self) -> Option<mpsc::Receiver<PrinterMessage>> {
        self.messages.lock().await.take()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn encoding(&self) -> WireEncoding {
        self.encoding
    }

    /// Key/value parameters of the identification banner.
    pub fn banner(&self) -> &BTreeMap<String, String> {
        &self.banner
    }

    pub fn stats(&self) -> ConnectionStats {
        self.counters.snapshot()
    }

    /// Transmit one instruction as-is; line numbers are the caller's business.
    pub async fn send(&self, code: &Instruction) -> Result<(), ConnectionError> {
        if self.state() != ConnectionState::Connected {
            return Err(ConnectionError::NotConnected);
        }
        self.write(code).await
    }

    async fn write(&self, code: &Instruction) -> Result<(), ConnectionError> {
        let bytes = encode(code, self.encoding);
        tracing::debug!("TX: {}", code);
        tracing::trace!("TX bytes: {:02x?}", bytes);
        let mut writer = self.writer.lock().await;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        self.counters.bytes_sent.fetch_add(bytes.len() as u64, Ordering::Relaxed);
        self.counters.lines_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub async fn close(&self) {
        if self.state() == ConnectionState::Disconnected {
            return;
        }
        tracing::info!("Closing printer connection");
        self.reader.abort();
        if let Err(e) = self.writer.lock().await.shutdown().await {
            tracing::debug!("Error shutting down writer: {}", e);
        }
        self.state.send_replace(ConnectionState::Disconnected);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop<R>(
    mut reader: R,
    tx: mpsc::Sender<PrinterMessage>,
    counters: Arc<Counters>,
    state: Arc<watch::Sender<ConnectionState>>,
) where
    R: AsyncRead + Unpin,
{
    let mut framer = LineFramer::new();
    let mut chunk = [0u8; 512];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => {
                tracing::info!("Printer closed the connection");
                break;
            }
            Ok(n) => {
                counters.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
                tracing::trace!("RX {} bytes", n);
                for line in framer.push(&chunk[..n]) {
                    counters.lines_received.fetch_add(1, Ordering::Relaxed);
                    let message = PrinterMessage::classify(&line);
                    if let PrinterMessage::Unknown(text) = &message {
                        counters.unknown_lines.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!("Unrecognised printer output: {}", text);
                    } else {
                        tracing::debug!("RX: {}", line);
                    }
                    if tx.send(message).await.is_err() {
                        tracing::debug!("Message receiver dropped, stopping reader");
                        state.send_replace(ConnectionState::Disconnected);
                        return;
                    }
                }
            }
            Err(e) => {
                tracing::error!("Serial read error: {}", e);
                break;
            }
        }
    }
    state.send_replace(ConnectionState::Disconnected);
}
