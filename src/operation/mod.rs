// src/operation/mod.rs - Long-running printer operations and their shared lifecycle
pub mod bed_level;
pub mod extrusion;
pub mod print_job;
pub mod raise_head;
pub mod repeating;
pub mod zero_bed;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;

use crate::gcode::GCodeError;
use crate::preprocess::ValidationError;
use crate::printer::{Context, ContextOptions, Printer, PrinterError};

pub use bed_level::{BedCorner, BedLevelCalibration, BedLevelEvent, BedLevelSettings, CornerLevels};
pub use extrusion::{ExtrusionEvent, ExtrusionOperation, ExtrusionSettings};
pub use print_job::{PrintJob, PrintJobEvent, PrintJobState};
pub use raise_head::{RaiseHeadEvent, RaiseHeadOperation};
pub use repeating::{CommandSource, FnSource, RepeatingCommandSender, RepeatingEvent};
pub use zero_bed::{ZeroBedEvent, ZeroBedOperation};

#[derive(Debug, Error)]
pub enum OperationError {
    #[error("Printer error: {0}")]
    Printer(#[from] PrinterError),
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
    #[error("G-code error: {0}")]
    GCode(#[from] GCodeError),
    #[error("Operation has already been started")]
    AlreadyStarted,
    #[error("Operation is not running")]
    NotRunning,
    #[error("Cannot {action} while {state}")]
    InvalidState { action: &'static str, state: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Idle,
    PrintJob,
    Calibration,
    Utility,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OperationStage {
    #[default]
    Idle,
    Preparation,
    Running,
    Ending,
}

impl fmt::Display for OperationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationStage::Idle => "idle",
            OperationStage::Preparation => "preparing",
            OperationStage::Running => "running",
            OperationStage::Ending => "ending",
        };
        f.write_str(name)
    }
}

/// Stage tracking and stop signalling shared by every operation.
#[derive(Debug)]
pub struct Lifecycle {
    kind: OperationKind,
    stage: watch::Sender<OperationStage>,
    stop: watch::Sender<bool>,
    started: AtomicBool,
    ended: watch::Sender<bool>,
}

impl Lifecycle {
    pub fn new(kind: OperationKind) -> Self {
        Self {
            kind,
            stage: watch::channel(OperationStage::Idle).0,
            stop: watch::channel(false).0,
            started: AtomicBool::new(false),
            ended: watch::channel(false).0,
        }
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn stage(&self) -> OperationStage {
        *self.stage.borrow()
    }

    pub fn subscribe_stage(&self) -> watch::Receiver<OperationStage> {
        self.stage.subscribe()
    }

    /// Acquire the operation's single context. Fails when another context
    /// is in the way or the operation was already started.
    pub(crate) fn begin(&self, printer: &Printer, options: ContextOptions) -> Result<Context, OperationError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(OperationError::AlreadyStarted);
        }
        match printer.try_acquire_context(options) {
            Ok(context) => {
                tracing::debug!("{:?} operation acquired context {}", self.kind, context.id());
                self.set_stage(OperationStage::Preparation);
                Ok(context)
            }
            Err(e) => {
                self.started.store(false, Ordering::SeqCst);
                Err(e.into())
            }
        }
    }

    pub(crate) fn set_stage(&self, stage: OperationStage) {
        self.stage.send_if_modified(|current| {
            let changed = *current != stage;
            *current = stage;
            changed
        });
    }

    /// Ask the operation to wind down. Safe at any time, any number of times.
    pub fn request_stop(&self) {
        self.stop.send_replace(true);
    }

    pub fn is_stopping(&self) -> bool {
        *self.stop.borrow()
    }

    /// Resolves once a stop has been requested.
    pub async fn stop_requested(&self) {
        let mut stop = self.stop.subscribe();
        let _ = stop.wait_for(|requested| *requested).await;
    }

    /// Release the context and return to idle.
    pub(crate) fn finish(&self, context: Context) {
        self.set_stage(OperationStage::Ending);
        context.invalidate();
        self.set_stage(OperationStage::Idle);
        self.ended.send_replace(true);
        tracing::debug!("{:?} operation ended", self.kind);
    }

    pub fn has_ended(&self) -> bool {
        *self.ended.borrow()
    }

    /// Resolves once the operation has ended.
    pub async fn ended(&self) {
        let mut ended = self.ended.subscribe();
        let _ = ended.wait_for(|ended| *ended).await;
    }
}

/// Behaviour common to all operations.
#[async_trait]
pub trait Operation: Send + Sync {
    fn lifecycle(&self) -> &Lifecycle;

    fn activity_description(&self) -> String;

    fn kind(&self) -> OperationKind {
        self.lifecycle().kind()
    }

    fn stage(&self) -> OperationStage {
        self.lifecycle().stage()
    }

    fn stop(&self) {
        self.lifecycle().request_stop();
    }

    async fn ended(&self) {
        self.lifecycle().ended().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stop_is_observed() {
        let lifecycle = Lifecycle::new(OperationKind::Utility);
        assert!(!lifecycle.is_stopping());
        lifecycle.request_stop();
        lifecycle.request_stop();
        assert!(lifecycle.is_stopping());
        lifecycle.stop_requested().await;
    }

    #[test]
    fn test_stop_wakes_waiter() {
        let lifecycle = Lifecycle::new(OperationKind::Calibration);
        let mut waiter = tokio_test::task::spawn(lifecycle.stop_requested());
        tokio_test::assert_pending!(waiter.poll());
        lifecycle.request_stop();
        assert!(waiter.is_woken());
        tokio_test::assert_ready!(waiter.poll());
    }

    #[test]
    fn test_stage_names() {
        assert_eq!(OperationStage::Preparation.to_string(), "preparing");
        assert_eq!(OperationStage::default(), OperationStage::Idle);
    }
}
