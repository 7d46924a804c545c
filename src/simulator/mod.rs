// src/simulator/mod.rs - Virtual printer firmware running over an in-memory stream
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;

use crate::connection::{
    ascii_checksum, Connection, ConnectionError, ConnectionOptions, Transport, TransportProvider, WireEncoding,
};
use crate::gcode::program::MotionTracker;
use crate::gcode::{Field, Instruction};
use crate::geometry::AbsolutePosition;
use crate::printer::{Printer, PrinterError, PrinterOptions};

const STREAM_BUFFER: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    pub serial_number: String,
    pub firmware_version: String,
    pub ambient_temperature: f64,
    /// Degrees gained per temperature request while heating.
    pub heating_rate: f64,
    /// Pause before answering each packet.
    pub response_delay: Duration,
    /// Bytes the link holds in each direction before writes block.
    pub link_buffer: usize,
    pub eeprom: BTreeMap<u16, i32>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            serial_number: "BK15033001100".to_string(),
            firmware_version: "2015122112".to_string(),
            ambient_temperature: 25.0,
            heating_rate: 40.0,
            response_delay: Duration::ZERO,
            link_buffer: STREAM_BUFFER,
            eeprom: BTreeMap::new(),
        }
    }
}

/// Injected transmission faults, keyed by line number.
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    /// Lines that are rejected with a resend request the first time they arrive.
    pub corrupt_once: BTreeSet<u16>,
    /// Lines that are always rejected.
    pub always_reject: BTreeSet<u16>,
    /// Lines answered with `Error:<code>`.
    pub errors: BTreeMap<u16, i32>,
}

#[derive(Debug)]
struct Firmware {
    config: SimulatorConfig,
    faults: FaultPlan,
    expected_line: u16,
    awaiting_resend: bool,
    tracker: MotionTracker,
    temperature: f64,
    target: f64,
    eeprom: BTreeMap<u16, i32>,
    received: Vec<Instruction>,
    executed: Vec<Instruction>,
    temperature_log: Vec<f64>,
}

impl Firmware {
    fn new(config: SimulatorConfig) -> Self {
        Self {
            faults: FaultPlan::default(),
            expected_line: 0,
            awaiting_resend: false,
            tracker: MotionTracker::new(),
            temperature: config.ambient_temperature,
            target: 0.0,
            eeprom: config.eeprom.clone(),
            received: Vec::new(),
            executed: Vec::new(),
            temperature_log: Vec::new(),
            config,
        }
    }

    /// Handle one packet and return the reply lines.
    fn accept(&mut self, code: Instruction) -> Vec<String> {
        self.received.push(code.clone());
        let Some(line) = code.line_number() else {
            return vec![self.execute(&code, None)];
        };
        if line != self.expected_line {
            // Everything after a rejected line is dropped until it comes back.
            if self.awaiting_resend {
                return vec![];
            }
            self.awaiting_resend = true;
            return vec![format!("rs {}", self.expected_line)];
        }
        if self.faults.always_reject.contains(&line) || self.faults.corrupt_once.remove(&line) {
            self.awaiting_resend = true;
            return vec![format!("rs {}", line)];
        }
        self.awaiting_resend = false;
        self.expected_line = line.wrapping_add(1);
        if let Some(error) = self.faults.errors.remove(&line) {
            return vec![format!("Error:{} N{}", error, line)];
        }
        vec![self.execute(&code, Some(line))]
    }

    fn corrupt_packet(&mut self) -> Vec<String> {
        if self.awaiting_resend {
            return vec![];
        }
        self.awaiting_resend = true;
        vec![format!("rs {}", self.expected_line)]
    }

    fn execute(&mut self, code: &Instruction, line: Option<u16>) -> String {
        let ok = match line {
            Some(line) => format!("ok {}", line),
            None => "ok".to_string(),
        };
        self.executed.push(code.without_field(Field::N));
        self.tracker.apply(code);
        if code.g() == Some(30) {
            let position = self.tracker.position();
            self.tracker.set_position(AbsolutePosition { z: 0.0, ..position });
        }
        let s = code.get(Field::S);
        match code.m() {
            Some(115) => format!(
                "{} FIRMWARE_NAME:Micro3D FIRMWARE_VERSION:{} MACHINE_TYPE:The_Micro X-SERIAL_NUMBER:{}",
                ok, self.config.firmware_version, self.config.serial_number
            ),
            Some(104) => {
                self.target = s.unwrap_or(0.0);
                ok
            }
            Some(109) => {
                self.target = s.unwrap_or(0.0);
                self.temperature = self.target.max(self.config.ambient_temperature);
                ok
            }
            Some(105) => {
                self.step_temperature();
                format!("{} T:{:.1}", ok, self.temperature)
            }
            Some(114) => {
                let p = self.tracker.position();
                format!("{} X:{:.3} Y:{:.3} Z:{:.3} E:{:.3}", ok, p.x, p.y, p.z, p.e)
            }
            Some(619) => {
                let index = s.unwrap_or(0.0) as u16;
                let value = self.eeprom.get(&index).copied().unwrap_or(0);
                format!("{} PT:{} DT:{}", ok, index, value)
            }
            Some(618) => {
                let index = s.unwrap_or(0.0) as u16;
                let value = code.value_or(Field::P, 0.0) as i32;
                self.eeprom.insert(index, value);
                format!("{} PT:{} DT:{}", ok, index, value)
            }
            _ => ok,
        }
    }

    fn step_temperature(&mut self) {
        let goal = self.target.max(self.config.ambient_temperature);
        let rate = self.config.heating_rate;
        self.temperature = if self.temperature < goal {
            (self.temperature + rate).min(goal)
        } else {
            (self.temperature - rate).max(goal)
        };
        self.temperature_log.push(self.temperature);
    }
}

enum Packet {
    Code(Instruction),
    Corrupt(String),
}

/// Take the next complete packet off `buffer`. Binary packets start with a
/// byte that has the high bit set; everything else is a text line.
fn next_packet(buffer: &mut Vec<u8>) -> Option<Packet> {
    let skip = buffer.iter().take_while(|b| matches!(b, b'\n' | b'\r' | b' ')).count();
    buffer.drain(..skip);
    let first = *buffer.first()?;

    if first & 0x80 != 0 {
        if buffer.len() < 4 {
            return None;
        }
        let Some(length) = Instruction::binary_length(&buffer[..4]) else {
            buffer.drain(..1);
            return Some(Packet::Corrupt("bad binary header".to_string()));
        };
        if buffer.len() < length {
            return None;
        }
        let packet: Vec<u8> = buffer.drain(..length).collect();
        return Some(match Instruction::from_binary(&packet) {
            Ok(code) => Packet::Code(code),
            Err(e) => Packet::Corrupt(e.to_string()),
        });
    }

    let end = buffer.iter().position(|b| *b == b'\n')?;
    let raw: Vec<u8> = buffer.drain(..=end).collect();
    let text = String::from_utf8_lossy(&raw).trim().to_string();
    let body = match text.split_once('*') {
        Some((body, checksum)) => {
            if checksum.trim().parse::<u8>().ok() != Some(ascii_checksum(body)) {
                return Some(Packet::Corrupt(format!("checksum mismatch in '{}'", text)));
            }
            body
        }
        None => text.as_str(),
    };
    Some(match Instruction::parse(body) {
        Ok(code) => Packet::Code(code),
        Err(e) => Packet::Corrupt(e.to_string()),
    })
}

async fn run(mut stream: DuplexStream, firmware: Arc<Mutex<Firmware>>) {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 1024];
    let delay = lock(&firmware).config.response_delay;
    loop {
        let n = match stream.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::debug!("Simulator read error: {}", e);
                break;
            }
        };
        buffer.extend_from_slice(&chunk[..n]);
        while let Some(packet) = next_packet(&mut buffer) {
            let replies = {
                let mut firmware = lock(&firmware);
                match packet {
                    Packet::Code(code) => firmware.accept(code),
                    Packet::Corrupt(reason) => {
                        tracing::debug!("Simulator got a corrupt packet: {}", reason);
                        firmware.corrupt_packet()
                    }
                }
            };
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            for reply in replies {
                tracing::trace!("Simulator TX: {}", reply);
                if stream.write_all(format!("{}\n", reply).as_bytes()).await.is_err() {
                    return;
                }
            }
        }
    }
    tracing::debug!("Simulator stopped");
}

fn lock(firmware: &Mutex<Firmware>) -> MutexGuard<'_, Firmware> {
    firmware.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Handle to a running simulated printer, for inspection and fault injection.
#[derive(Debug)]
pub struct SimulatedPrinter {
    firmware: Arc<Mutex<Firmware>>,
    task: JoinHandle<()>,
}

impl SimulatedPrinter {
    /// Start a simulated printer; the returned stream is the host's end of the link.
    pub fn spawn(config: SimulatorConfig) -> (DuplexStream, SimulatedPrinter) {
        let (host, device) = duplex(config.link_buffer.max(1));
        let firmware = Arc::new(Mutex::new(Firmware::new(config)));
        let task = tokio::spawn(run(device, firmware.clone()));
        (host, SimulatedPrinter { firmware, task })
    }

    /// Every packet received, retransmissions included.
    pub fn received(&self) -> Vec<Instruction> {
        lock(&self.firmware).received.clone()
    }

    /// Line numbers in the order they arrived.
    pub fn received_line_numbers(&self) -> Vec<u16> {
        lock(&self.firmware).received.iter().filter_map(Instruction::line_number).collect()
    }

    /// Instructions actually executed, without line numbers.
    pub fn executed(&self) -> Vec<Instruction> {
        lock(&self.firmware).executed.clone()
    }

    pub fn eeprom(&self, index: u16) -> Option<i32> {
        lock(&self.firmware).eeprom.get(&index).copied()
    }

    pub fn temperature(&self) -> f64 {
        lock(&self.firmware).temperature
    }

    pub fn target_temperature(&self) -> f64 {
        lock(&self.firmware).target
    }

    /// Every temperature reported in answer to M105.
    pub fn temperature_log(&self) -> Vec<f64> {
        lock(&self.firmware).temperature_log.clone()
    }

    pub fn position(&self) -> AbsolutePosition {
        lock(&self.firmware).tracker.position()
    }

    pub fn inject_faults(&self, update: impl FnOnce(&mut FaultPlan)) {
        update(&mut lock(&self.firmware).faults);
    }

    /// Hang up, as if the cable was pulled.
    pub fn disconnect(&self) {
        self.task.abort();
    }
}

impl Drop for SimulatedPrinter {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Connect a session to a fresh simulated printer.
pub async fn connect(
    config: SimulatorConfig,
    options: PrinterOptions,
    encoding: WireEncoding,
) -> Result<(Printer, SimulatedPrinter), PrinterError> {
    let (stream, simulated) = SimulatedPrinter::spawn(config);
    let connection = Connection::open(
        stream,
        ConnectionOptions { encoding, handshake_timeout: Duration::from_secs(2) },
    )
    .await?;
    let printer = Printer::new(connection, options).await?;
    Ok((printer, simulated))
}

/// Hands out simulated printers in place of serial ports.
#[derive(Debug, Default)]
pub struct SimulatorTransport {
    config: SimulatorConfig,
    running: Mutex<Vec<SimulatedPrinter>>,
}

impl SimulatorTransport {
    pub fn new(config: SimulatorConfig) -> Self {
        Self { config, running: Mutex::new(Vec::new()) }
    }
}

#[async_trait]
impl TransportProvider for SimulatorTransport {
    async fn open(&self, port: &str, _baud: u32) -> Result<Box<dyn Transport>, ConnectionError> {
        tracing::info!("Starting simulated printer for '{}'", port);
        let (stream, simulated) = SimulatedPrinter::spawn(self.config.clone());
        self.running.lock().unwrap_or_else(|p| p.into_inner()).push(simulated);
        Ok(Box::new(stream))
    }

    fn available_ports(&self) -> Vec<String> {
        vec!["simulator".to_string()]
    }
}
