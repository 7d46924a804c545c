// src/printer/mod.rs - Printer session: numbered command queue, resend recovery and compensation
pub mod compensation;
pub mod context;
pub mod eeprom;
pub mod helpers;
pub mod registry;

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex, OwnedSemaphorePermit, RwLock, Semaphore};

use crate::config::Config;
use crate::connection::{Connection, ConnectionError, ConnectionOptions, PrinterMessage, Transport};
use crate::gcode::{Field, Instruction};
use crate::geometry::AbsolutePosition;
use crate::parameters::{BacklashValues, BedLevelOffsets};
use compensation::{BedLevelCompensator, BedRectangle, Compensation, MotionState, OutOfBoundsPolicy};
pub use context::{Context, ContextOptions};
pub use registry::{PrinterId, PrinterRegistry};

const EVENT_CHANNEL_SIZE: usize = 256;

#[derive(Debug, Error)]
pub enum PrinterError {
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),
    #[error("Printer reported error {code} for line {line}")]
    Protocol { code: i32, line: u16 },
    #[error("Line {line} could not be delivered after {attempts} resend requests")]
    ResendExhausted { line: u16, attempts: u32 },
    #[error("Another context is active")]
    ContextBusy,
    #[error("Context has been invalidated")]
    ContextInvalidated,
    #[error("Printer disconnected")]
    Disconnected,
    #[error("Command was cancelled")]
    Cancelled,
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),
    #[error("Invalid virtual EEPROM index {0}")]
    InvalidEepromIndex(u16),
}

/// Case color, encoded in the first two characters of the serial number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrinterColor {
    #[default]
    Undetermined,
    Black,
    Silver,
    LightBlue,
    Green,
    Orange,
    White,
    Grape,
    Other,
}

impl PrinterColor {
    pub fn from_serial_number(serial: &str) -> Self {
        match serial.get(..2) {
            None => PrinterColor::Undetermined,
            Some("BK") => PrinterColor::Black,
            Some("SL") => PrinterColor::Silver,
            Some("BL") => PrinterColor::LightBlue,
            Some("GR") => PrinterColor::Green,
            Some("OR") => PrinterColor::Orange,
            Some("WH") => PrinterColor::White,
            Some("PL") => PrinterColor::Grape,
            Some(_) => PrinterColor::Other,
        }
    }
}

impl fmt::Display for PrinterColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PrinterColor::Undetermined => "Undetermined",
            PrinterColor::Black => "Black",
            PrinterColor::Silver => "Silver",
            PrinterColor::LightBlue => "Light Blue",
            PrinterColor::Green => "Green",
            PrinterColor::Orange => "Orange",
            PrinterColor::White => "White",
            PrinterColor::Grape => "Grape",
            PrinterColor::Other => "Other",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct PrinterIdentity {
    pub color: PrinterColor,
    pub serial_number: Option<String>,
    pub firmware_name: Option<String>,
    pub firmware_version: Option<String>,
}

impl PrinterIdentity {
    pub fn from_banner(banner: &BTreeMap<String, String>) -> Self {
        let serial_number = banner.get("X-SERIAL_NUMBER").cloned();
        Self {
            color: serial_number.as_deref().map_or(PrinterColor::Undetermined, PrinterColor::from_serial_number),
            serial_number,
            firmware_name: banner.get("FIRMWARE_NAME").cloned(),
            firmware_version: banner.get("FIRMWARE_VERSION").cloned(),
        }
    }

    pub fn identifier(&self) -> &str {
        self.serial_number.as_deref().unwrap_or("unknown")
    }
}

/// Session tuning, usually derived from [`Config`].
#[derive(Debug, Clone)]
pub struct PrinterOptions {
    pub buffer_size: usize,
    pub max_resends: u32,
    pub bed_area: BedRectangle,
    pub out_of_bounds: OutOfBoundsPolicy,
    pub poll_interval: Duration,
}

impl Default for PrinterOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl PrinterOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            buffer_size: config.protocol.buffer_size.max(1),
            max_resends: config.protocol.max_resends,
            bed_area: BedRectangle::inset(
                config.printer.bed_width,
                config.printer.bed_depth,
                config.printer.calibration_inset,
            ),
            out_of_bounds: config.printer.out_of_bounds,
            poll_interval: Duration::from_millis(config.protocol.poll_interval_ms),
        }
    }
}

/// Calibration values the session compensates with.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Calibration {
    pub bed_level: BedLevelOffsets,
    pub backlash: BacklashValues,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct HeaterStatus {
    pub current: Option<f64>,
    pub target: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PrinterEvent {
    Temperature(f64),
    /// Output the classifier did not recognise.
    RawLine(String),
    Resend { line: u16, attempt: u32 },
    /// The session gave up; every later command fails.
    Fatal(String),
    Disconnected,
}

/// Parameters of the confirmation that completed a command.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Response {
    pub line: Option<u16>,
    pub params: BTreeMap<String, String>,
}

impl Response {
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    pub fn param_f64(&self, key: &str) -> Option<f64> {
        self.param(key)?.parse().ok()
    }

    pub fn param_i64(&self, key: &str) -> Option<i64> {
        self.param(key)?.parse().ok()
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ok")?;
        if let Some(line) = self.line {
            write!(f, " {}", line)?;
        }
        for (key, value) in &self.params {
            write!(f, " {}:{}", key, value)?;
        }
        Ok(())
    }
}

type CommandResult = Result<Response, PrinterError>;

/// Completion of one submitted instruction, which may have expanded into
/// several wire lines.
#[derive(Debug)]
pub struct CommandHandle {
    receivers: Vec<oneshot::Receiver<CommandResult>>,
}

impl CommandHandle {
    fn resolved() -> Self {
        Self { receivers: Vec::new() }
    }

    pub fn line_count(&self) -> usize {
        self.receivers.len()
    }

    /// Wait for every line; the last line's response is returned.
    pub async fn wait(self) -> Result<Response, PrinterError> {
        let mut last = Response::default();
        for receiver in self.receivers {
            last = receiver.await.map_err(|_| PrinterError::Cancelled)??;
        }
        Ok(last)
    }
}

struct PendingCommand {
    line: u16,
    instruction: Instruction,
    retries: u32,
    reply: oneshot::Sender<CommandResult>,
    _permit: OwnedSemaphorePermit,
}

#[derive(Debug, Clone, Copy)]
enum Closed {
    Disconnected,
    ResendExhausted { line: u16, attempts: u32 },
}

impl Closed {
    fn error(self) -> PrinterError {
        match self {
            Closed::Disconnected => PrinterError::Disconnected,
            Closed::ResendExhausted { line, attempts } => PrinterError::ResendExhausted { line, attempts },
        }
    }
}

#[derive(Default)]
struct CommandQueue {
    next_line: u16,
    pending: VecDeque<PendingCommand>,
    closed: Option<Closed>,
}

pub(crate) struct Session {
    connection: Connection,
    identity: PrinterIdentity,
    options: PrinterOptions,
    queue: Mutex<CommandQueue>,
    permits: Arc<Semaphore>,
    admission: Arc<RwLock<()>>,
    motion: Mutex<MotionState>,
    calibration: RwLock<Calibration>,
    heater: watch::Sender<HeaterStatus>,
    events: broadcast::Sender<PrinterEvent>,
    next_context_id: AtomicU64,
}

/// Handle to one connected printer. Clones share the session.
#[derive(Clone)]
pub struct Printer {
    inner: Arc<Session>,
}

impl fmt::Debug for Printer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Printer").field("identity", &self.inner.identity).finish()
    }
}

impl Printer {
    /// Take over an open connection and start dispatching its messages.
    pub async fn new(connection: Connection, options: PrinterOptions) -> Result<Self, PrinterError> {
        let messages = connection.take_messages().await.ok_or(PrinterError::Disconnected)?;
        let identity = PrinterIdentity::from_banner(connection.banner());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        let (heater, _) = watch::channel(HeaterStatus::default());
        let session = Arc::new(Session {
            connection,
            identity,
            permits: Arc::new(Semaphore::new(options.buffer_size.max(1))),
            options,
            queue: Mutex::new(CommandQueue::default()),
            admission: Arc::new(RwLock::new(())),
            motion: Mutex::new(MotionState::new()),
            calibration: RwLock::new(Calibration::default()),
            heater,
            events,
            next_context_id: AtomicU64::new(1),
        });
        tokio::spawn(dispatch(Arc::downgrade(&session), messages));
        tracing::info!(
            "Connected to {} printer {} (firmware {})",
            session.identity.color,
            session.identity.identifier(),
            session.identity.firmware_version.as_deref().unwrap_or("unknown")
        );
        Ok(Self { inner: session })
    }

    /// Open `transport`, identify the printer and load its calibration.
    pub async fn connect(transport: Box<dyn Transport>, config: &Config) -> Result<Self, PrinterError> {
        let connection = Connection::open(transport, ConnectionOptions::from(&config.serial)).await?;
        let printer = Self::new(connection, PrinterOptions::from_config(config)).await?;
        let context = printer.acquire_context(ContextOptions::concurrent()).await?;
        context.refresh_calibration().await?;
        context.invalidate();
        Ok(printer)
    }

    pub fn identity(&self) -> &PrinterIdentity {
        &self.inner.identity
    }

    pub fn options(&self) -> &PrinterOptions {
        &self.inner.options
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PrinterEvent> {
        self.inner.events.subscribe()
    }

    pub fn heater(&self) -> HeaterStatus {
        *self.inner.heater.borrow()
    }

    pub fn subscribe_heater(&self) -> watch::Receiver<HeaterStatus> {
        self.inner.heater.subscribe()
    }

    pub async fn calibration(&self) -> Calibration {
        *self.inner.calibration.read().await
    }

    pub async fn logical_position(&self) -> AbsolutePosition {
        self.inner.motion.lock().await.logical_position()
    }

    pub async fn machine_position(&self) -> AbsolutePosition {
        self.inner.motion.lock().await.machine_position()
    }

    pub async fn pending_count(&self) -> usize {
        self.inner.queue.lock().await.pending.len()
    }

    pub fn connection_stats(&self) -> crate::connection::ConnectionStats {
        self.inner.connection.stats()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connection.state() == crate::connection::ConnectionState::Connected
    }

    /// Wait for admission, then return a context.
    pub async fn acquire_context(&self, options: ContextOptions) -> Result<Context, PrinterError> {
        let admission = if options.exclusive {
            context::Admission::exclusive(self.inner.admission.clone().write_owned().await)
        } else {
            context::Admission::concurrent(self.inner.admission.clone().read_owned().await)
        };
        Ok(self.make_context(options, admission))
    }

    /// Like [`Printer::acquire_context`] but fails with `ContextBusy` instead of waiting.
    pub fn try_acquire_context(&self, options: ContextOptions) -> Result<Context, PrinterError> {
        let admission = if options.exclusive {
            context::Admission::exclusive(
                self.inner.admission.clone().try_write_owned().map_err(|_| PrinterError::ContextBusy)?,
            )
        } else {
            context::Admission::concurrent(
                self.inner.admission.clone().try_read_owned().map_err(|_| PrinterError::ContextBusy)?,
            )
        };
        Ok(self.make_context(options, admission))
    }

    fn make_context(&self, options: ContextOptions, admission: context::Admission) -> Context {
        let id = self.inner.next_context_id.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Context {} acquired ({:?})", id, options);
        Context::new(id, Arc::downgrade(&self.inner), options, admission)
    }

    pub async fn disconnect(&self) {
        self.inner.connection.close().await;
        self.inner.shut_down(Closed::Disconnected).await;
    }
}

impl Session {
    pub(crate) fn options(&self) -> &PrinterOptions {
        &self.options
    }

    pub(crate) fn heater(&self) -> HeaterStatus {
        *self.heater.borrow()
    }

    pub(crate) async fn calibration(&self) -> Calibration {
        *self.calibration.read().await
    }

    pub(crate) async fn update_calibration(&self, update: impl FnOnce(&mut Calibration)) {
        let mut calibration = self.calibration.write().await;
        update(&mut calibration);
        tracing::debug!("Calibration now {:?}", *calibration);
    }

    pub(crate) async fn synchronize_position(&self, position: AbsolutePosition) {
        self.motion.lock().await.synchronize(position);
    }

    /// Compensate, number and transmit one instruction for a context.
    pub(crate) async fn submit_through(
        &self,
        options: &ContextOptions,
        code: Instruction,
    ) -> Result<CommandHandle, PrinterError> {
        if !code.has_fields() {
            return Ok(CommandHandle::resolved());
        }
        // Holding the motion lock keeps each context's lines in order.
        let mut motion = self.motion.lock().await;
        let calibration = *self.calibration.read().await;
        let bed = BedLevelCompensator::new(calibration.bed_level, self.options.bed_area, self.options.out_of_bounds);
        let compensation = Compensation {
            bed_level: (!options.disable_bed_level).then_some(&bed),
            backlash: (!options.disable_backlash).then_some(calibration.backlash),
            convert_feed_rate: !options.disable_feed_rate_conversion,
        };
        let outgoing = motion.rewrite(&code.without_field(Field::N), &compensation);
        let mut receivers = Vec::with_capacity(outgoing.len());
        for line in outgoing {
            receivers.push(self.submit(line).await?);
        }
        Ok(CommandHandle { receivers })
    }

    async fn submit(&self, code: Instruction) -> Result<oneshot::Receiver<CommandResult>, PrinterError> {
        let permit = self.permits.clone().acquire_owned().await.map_err(|_| self.closed_error())?;
        let mut queue = self.queue.lock().await;
        if let Some(closed) = queue.closed {
            return Err(closed.error());
        }
        let line = queue.next_line;
        let numbered = code.with_field(Field::N, line as f64);
        let (reply, receiver) = oneshot::channel();
        // Committed before the write; a torn write is repaired by the resend path.
        queue.next_line = line.wrapping_add(1);
        queue.pending.push_back(PendingCommand {
            line,
            instruction: numbered.clone(),
            retries: 0,
            reply,
            _permit: permit,
        });
        if let Err(e) = self.connection.send(&numbered).await {
            tracing::error!("Sending line {} failed: {}", line, e);
            drop(queue);
            self.shut_down(Closed::Disconnected).await;
            return Err(e.into());
        }
        drop(queue);

        if matches!(code.m(), Some(104) | Some(109)) {
            let target = code.get(Field::S);
            self.heater.send_modify(|status| status.target = target.filter(|t| *t > 0.0));
        }
        Ok(receiver)
    }

    fn closed_error(&self) -> PrinterError {
        match self.queue.try_lock() {
            Ok(queue) => queue.closed.map_or(PrinterError::Disconnected, Closed::error),
            Err(_) => PrinterError::Disconnected,
        }
    }

    async fn handle(&self, message: PrinterMessage) {
        if let Some(temperature) = message.temperature() {
            self.heater.send_modify(|status| status.current = Some(temperature));
            let _ = self.events.send(PrinterEvent::Temperature(temperature));
        }
        match message {
            PrinterMessage::Confirmation { line, params } => self.resolve(line, Ok(params)).await,
            PrinterMessage::Skip { line } => self.resolve(line, Ok(BTreeMap::new())).await,
            PrinterMessage::Error { line, code } => self.resolve(line, Err(code)).await,
            PrinterMessage::ResendRequest { line } => self.resend(line).await,
            PrinterMessage::TemperatureUpdate { .. } => {}
            PrinterMessage::Unknown(text) => {
                let _ = self.events.send(PrinterEvent::RawLine(text));
            }
        }
    }

    /// Complete the oldest pending command.
    async fn resolve(&self, reported: Option<u16>, outcome: Result<BTreeMap<String, String>, i32>) {
        let Some(entry) = self.queue.lock().await.pending.pop_front() else {
            tracing::debug!("Response with no pending command");
            return;
        };
        if let Some(reported) = reported {
            if reported != entry.line {
                tracing::debug!("Response names line {} while line {} was oldest", reported, entry.line);
            }
        }
        let result = match outcome {
            Ok(params) => Ok(Response { line: Some(entry.line), params }),
            Err(code) => {
                tracing::warn!("Printer error {} for '{}'", code, entry.instruction);
                Err(PrinterError::Protocol { code, line: entry.line })
            }
        };
        let _ = entry.reply.send(result);
    }

    /// Retransmit every pending line from `line` on, keeping its number.
    async fn resend(&self, line: u16) {
        let mut queue = self.queue.lock().await;
        let Some(start) = queue.pending.iter().position(|entry| entry.line == line) else {
            tracing::warn!("Resend requested for line {} which is not pending", line);
            return;
        };
        queue.pending[start].retries += 1;
        let attempt = queue.pending[start].retries;
        let _ = self.events.send(PrinterEvent::Resend { line, attempt });

        if attempt > self.options.max_resends {
            let attempts = self.options.max_resends;
            tracing::error!("Line {} still rejected after {} resends, giving up", line, attempts);
            let closed = Closed::ResendExhausted { line, attempts };
            queue.closed = Some(closed);
            let failed: Vec<_> = queue.pending.drain(..).collect();
            drop(queue);
            self.permits.close();
            for entry in failed {
                let _ = entry.reply.send(Err(closed.error()));
            }
            let _ = self.events.send(PrinterEvent::Fatal(closed.error().to_string()));
            return;
        }

        let codes: Vec<Instruction> = queue.pending.iter().skip(start).map(|entry| entry.instruction.clone()).collect();
        tracing::warn!("Resending {} line(s) from {} (attempt {})", codes.len(), line, attempt);
        for code in &codes {
            if let Err(e) = self.connection.send(code).await {
                tracing::error!("Resend of '{}' failed: {}", code, e);
                break;
            }
        }
    }

    /// Fail everything pending and refuse new work.
    async fn shut_down(&self, reason: Closed) {
        let failed: Vec<_> = {
            let mut queue = self.queue.lock().await;
            if queue.closed.is_none() {
                queue.closed = Some(reason);
            }
            queue.pending.drain(..).collect()
        };
        self.permits.close();
        if !failed.is_empty() {
            tracing::warn!("Failing {} pending command(s): {}", failed.len(), reason.error());
        }
        for entry in failed {
            let _ = entry.reply.send(Err(reason.error()));
        }
    }
}

async fn dispatch(session: Weak<Session>, mut messages: mpsc::Receiver<PrinterMessage>) {
    while let Some(message) = messages.recv().await {
        let Some(session) = session.upgrade() else {
            return;
        };
        session.handle(message).await;
    }
    if let Some(session) = session.upgrade() {
        tracing::warn!("Printer {} disconnected", session.identity.identifier());
        session.shut_down(Closed::Disconnected).await;
        let _ = session.events.send(PrinterEvent::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_color_from_serial_number() {
        assert_eq!(PrinterColor::from_serial_number("BK15033001100"), PrinterColor::Black);
        assert_eq!(PrinterColor::from_serial_number("PL1"), PrinterColor::Grape);
        assert_eq!(PrinterColor::from_serial_number("ZZ1"), PrinterColor::Other);
        assert_eq!(PrinterColor::from_serial_number(""), PrinterColor::Undetermined);
        assert_eq!(PrinterColor::LightBlue.to_string(), "Light Blue");
    }

    #[test]
    fn test_identity_from_banner() {
        let banner: BTreeMap<String, String> = [
            ("FIRMWARE_NAME", "Micro3D"),
            ("FIRMWARE_VERSION", "2015122112"),
            ("X-SERIAL_NUMBER", "OR1234"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let identity = PrinterIdentity::from_banner(&banner);
        assert_eq!(identity.color, PrinterColor::Orange);
        assert_eq!(identity.identifier(), "OR1234");
        assert_eq!(identity.firmware_version.as_deref(), Some("2015122112"));
    }

    #[test]
    fn test_response_params() {
        let response = Response {
            line: Some(3),
            params: [("PT".to_string(), "16".to_string()), ("X".to_string(), "1.5".to_string())].into(),
        };
        assert_eq!(response.param_i64("PT"), Some(16));
        assert_eq!(response.param_f64("X"), Some(1.5));
        assert_eq!(response.param("Y"), None);
        assert_eq!(response.to_string(), "ok 3 PT:16 X:1.5");
    }

    #[tokio::test]
    async fn test_empty_handle_resolves() {
        let response = CommandHandle::resolved().wait().await.unwrap();
        assert_eq!(response, Response::default());
    }
}
