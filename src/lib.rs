// src/lib.rs - Host-side control of Micro 3D printers over a serial link
pub mod config;
pub mod connection;
pub mod gcode;
pub mod geometry;
pub mod operation;
pub mod parameters;
pub mod preprocess;
pub mod printer;
pub mod simulator;
pub mod status;
pub mod stopwatch;

pub use config::{load_config, Config, ConfigError};
pub use connection::{Connection, ConnectionError, ConnectionOptions, WireEncoding};
pub use gcode::{GCodeError, Instruction, Program};
pub use operation::{Operation, OperationError};
pub use preprocess::{Preprocessor, ValidationError};
pub use printer::{Context, ContextOptions, Printer, PrinterError, PrinterOptions};
