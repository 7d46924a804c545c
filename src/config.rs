//! # Host configuration
//!
//! Everything is optional; a missing file section falls back to values
//! suited to a Micro-class printer.
//!
//! ## Example: TOML Configuration
//!
//! ```toml
//! [printer]
//! printer_name = "micro"
//! bed_width = 109.0
//! bed_depth = 113.0
//! out_of_bounds = "clamp"
//!
//! [serial]
//! port = "/dev/ttyACM0"
//! baud = 115200
//! encoding = "binary"
//!
//! [protocol]
//! buffer_size = 8
//! max_resends = 5
//!
//! [preprocess]
//! use_wave_bonding = true
//! tack_angle_threshold = 90.0
//!
//! [filament]
//! type = "abs"
//! temperature = 270.0
//! ```

// src/config.rs - Single configuration file
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::connection::WireEncoding;
use crate::geometry::Cuboid;
use crate::parameters::{FilamentType, PrintParameters};
use crate::printer::compensation::OutOfBoundsPolicy;
use crate::preprocess::WaveBondingSettings;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main configuration struct.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub printer: PrinterConfig,
    #[serde(default)]
    pub serial: SerialConfig,
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub preprocess: PreprocessConfig,
    #[serde(default)]
    pub filament: FilamentConfig,
}

/// Printer geometry and calibration settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PrinterConfig {
    #[serde(default)]
    pub printer_name: Option<String>,
    #[serde(default = "default_bed_width")]
    pub bed_width: f64,
    #[serde(default = "default_bed_depth")]
    pub bed_depth: f64,
    #[serde(default = "default_max_z")]
    pub max_z: f64,
    #[serde(default)]
    pub out_of_bounds: OutOfBoundsPolicy,
    /// Distance from the bed edge of the points measured during calibration.
    #[serde(default = "default_calibration_inset")]
    pub calibration_inset: f64,
    /// Z step for one up/down adjustment during bed-level calibration.
    #[serde(default = "default_level_adjust_step")]
    pub level_adjust_step: f64,
}

impl Default for PrinterConfig {
    fn default() -> Self {
        Self {
            printer_name: None,
            bed_width: default_bed_width(),
            bed_depth: default_bed_depth(),
            max_z: default_max_z(),
            out_of_bounds: OutOfBoundsPolicy::default(),
            calibration_inset: default_calibration_inset(),
            level_adjust_step: default_level_adjust_step(),
        }
    }
}

impl PrinterConfig {
    pub fn print_volume(&self) -> Cuboid {
        Cuboid::new([0.0, 0.0, 0.0], [self.bed_width, self.bed_depth, self.max_z])
    }
}

/// Serial link settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SerialConfig {
    #[serde(default)]
    pub port: String,
    #[serde(default = "default_baud")]
    pub baud: u32,
    #[serde(default)]
    pub encoding: WireEncoding,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "".to_string(),
            baud: default_baud(),
            encoding: WireEncoding::default(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
        }
    }
}

/// Line protocol settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProtocolConfig {
    /// Commands allowed in flight before senders wait.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Retransmissions allowed per line before the session gives up.
    #[serde(default = "default_max_resends")]
    pub max_resends: u32,
    /// Interval between temperature polls while heating.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            max_resends: default_max_resends(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// Preprocessing options.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PreprocessConfig {
    #[serde(default)]
    pub use_wave_bonding: bool,
    #[serde(default = "default_use_backlash_compensation")]
    pub use_backlash_compensation: bool,
    /// Interior corner angle in degrees below which a corner counts as sharp.
    #[serde(default = "default_tack_angle_threshold")]
    pub tack_angle_threshold: f64,
    #[serde(default = "default_tack_ms_per_mm")]
    pub tack_ms_per_mm: f64,
    #[serde(default = "default_tack_min_ms")]
    pub tack_min_ms: u32,
    #[serde(default = "default_tack_max_ms")]
    pub tack_max_ms: u32,
    #[serde(default = "default_temperature_tolerance")]
    pub temperature_tolerance: f64,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            use_wave_bonding: false,
            use_backlash_compensation: default_use_backlash_compensation(),
            tack_angle_threshold: default_tack_angle_threshold(),
            tack_ms_per_mm: default_tack_ms_per_mm(),
            tack_min_ms: default_tack_min_ms(),
            tack_max_ms: default_tack_max_ms(),
            temperature_tolerance: default_temperature_tolerance(),
        }
    }
}

impl PreprocessConfig {
    pub fn wave_bonding(&self) -> WaveBondingSettings {
        WaveBondingSettings {
            angle_threshold_degrees: self.tack_angle_threshold,
            ms_per_mm: self.tack_ms_per_mm,
            min_ms: self.tack_min_ms,
            max_ms: self.tack_max_ms,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct FilamentConfig {
    #[serde(default, rename = "type")]
    pub kind: FilamentType,
    /// Overrides the filament's default temperature.
    #[serde(default)]
    pub temperature: Option<f64>,
}

impl Config {
    /// Validate ranges that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.printer.bed_width <= 0.0 || self.printer.bed_depth <= 0.0 || self.printer.max_z <= 0.0 {
            return Err(ConfigError::Invalid("Printer dimensions must be > 0".to_string()));
        }
        if self.protocol.buffer_size == 0 {
            return Err(ConfigError::Invalid("Protocol buffer_size must be > 0".to_string()));
        }
        if !(0.0..=180.0).contains(&self.preprocess.tack_angle_threshold) {
            return Err(ConfigError::Invalid(
                "Preprocess tack_angle_threshold must be between 0 and 180".to_string(),
            ));
        }
        if self.preprocess.tack_min_ms > self.preprocess.tack_max_ms {
            return Err(ConfigError::Invalid("Preprocess tack_min_ms must be <= tack_max_ms".to_string()));
        }
        Ok(())
    }

    /// Print parameters derived from the configuration, before the printer's
    /// stored calibration is filled in.
    pub fn print_parameters(&self) -> PrintParameters {
        let mut params = PrintParameters::for_filament(self.filament.kind);
        if let Some(temperature) = self.filament.temperature {
            params.ideal_temperature = temperature;
        }
        params.print_volume = self.printer.print_volume();
        params.use_wave_bonding = self.preprocess.use_wave_bonding;
        params.use_backlash_compensation = self.preprocess.use_backlash_compensation;
        params.temperature_tolerance = self.preprocess.temperature_tolerance;
        params
    }
}

// Default value functions
fn default_bed_width() -> f64 { 109.0 }
fn default_bed_depth() -> f64 { 113.0 }
fn default_max_z() -> f64 { 116.0 }
fn default_calibration_inset() -> f64 { 9.0 }
fn default_level_adjust_step() -> f64 { 0.05 }
fn default_baud() -> u32 { 115200 }
fn default_handshake_timeout_ms() -> u64 { 5000 }
fn default_buffer_size() -> usize { 8 }
fn default_max_resends() -> u32 { 5 }
fn default_poll_interval_ms() -> u64 { 1000 }
fn default_use_backlash_compensation() -> bool { true }
fn default_tack_angle_threshold() -> f64 { 90.0 }
fn default_tack_ms_per_mm() -> f64 { 4.0 }
fn default_tack_min_ms() -> u32 { 20 }
fn default_tack_max_ms() -> u32 { 200 }
fn default_temperature_tolerance() -> f64 { 3.0 }

/// Load configuration from a TOML file at the given path.
pub fn load_config(path: &str) -> Result<Config, ConfigError> {
    let config: Config = match std::fs::read_to_string(path) {
        Ok(contents) => match toml::from_str(&contents) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!("Failed to parse config TOML: {}", e);
                return Err(ConfigError::Toml(e));
            }
        },
        Err(e) => {
            tracing::error!("Failed to read config file '{}': {}", path, e);
            return Err(ConfigError::Io(e));
        }
    };
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_default_values() {
        let config = Config::default();
        assert_eq!(config.printer.bed_width, 109.0);
        assert_eq!(config.serial.baud, 115200);
        assert_eq!(config.serial.encoding, WireEncoding::Binary);
        assert_eq!(config.protocol.max_resends, 5);
        assert_eq!(config.preprocess.tack_angle_threshold, 90.0);
        assert_eq!(config.filament.kind, FilamentType::Pla);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_config_success() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("test_config.toml");
        let mut file = File::create(&file_path).unwrap();
        writeln!(
            file,
            "[serial]\nport = '/dev/ttyACM0'\nencoding = 'ascii'\n[filament]\ntype = 'abs'\ntemperature = 270.0"
        )
        .unwrap();
        file.flush().unwrap();
        let config = load_config(file_path.to_str().unwrap()).unwrap();
        assert_eq!(config.serial.port, "/dev/ttyACM0");
        assert_eq!(config.serial.encoding, WireEncoding::Ascii);
        assert_eq!(config.filament.kind, FilamentType::Abs);
        // Defaults for missing fields
        assert_eq!(config.serial.baud, 115200);
        let params = config.print_parameters();
        assert_eq!(params.ideal_temperature, 270.0);
        assert_eq!(params.print_volume.size, [109.0, 113.0, 116.0]);
    }

    #[test]
    fn test_load_config_missing_file() {
        let result = load_config("/definitely/not/here.toml");
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }

    #[test]
    fn test_load_config_rejects_invalid_values() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("bad.toml");
        std::fs::write(&file_path, "[protocol]\nbuffer_size = 0\n").unwrap();
        let result = load_config(file_path.to_str().unwrap());
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_out_of_bounds_policy_parses() {
        let config: Config = toml::from_str("[printer]\nout_of_bounds = 'extrapolate'\n").unwrap();
        assert_eq!(config.printer.out_of_bounds, OutOfBoundsPolicy::Extrapolate);
    }
}
