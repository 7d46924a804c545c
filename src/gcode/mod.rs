// src/gcode/mod.rs
pub mod helpers;
pub mod instruction;
pub mod program;
pub mod slicer_profile;

use thiserror::Error;

pub use instruction::{Field, Instruction};
pub use program::{Layer, Move, PhaseRange, PrintPhase, Program};
pub use slicer_profile::{SlicerKind, SlicerProfile};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GCodeError {
    #[error("Could not parse G-code '{text}'{}", line.map(|l| format!(" on line {}", l)).unwrap_or_default())]
    Parse { text: String, line: Option<usize> },
    #[error("Field '{field}' is not supported by the firmware: '{text}'")]
    IncompatibleCode { field: char, text: String },
    #[error("Malformed binary G-code: {0}")]
    Binary(String),
    #[error("IO error: {0}")]
    Io(String),
}

impl GCodeError {
    /// Attach a 1-based line number to a parse error.
    pub fn at_line(self, line: usize) -> Self {
        match self {
            GCodeError::Parse { text, .. } => GCodeError::Parse { text, line: Some(line) },
            other => other,
        }
    }
}

impl From<std::io::Error> for GCodeError {
    fn from(e: std::io::Error) -> Self {
        GCodeError::Io(e.to_string())
    }
}
