// src/operation/zero_bed.rs - Let the firmware find the bed and call it Z zero
use std::sync::Arc;

use tokio::sync::broadcast;

use super::{Lifecycle, Operation, OperationError, OperationKind, OperationStage};
use crate::gcode::helpers;
use crate::printer::{Context, ContextOptions, Printer};

const EVENT_CHANNEL_SIZE: usize = 16;

#[derive(Debug, Clone, PartialEq)]
pub enum ZeroBedEvent {
    Progress(String),
    /// `completed` is false when stopped before the bed was found.
    Stopped { completed: bool },
    Failed(String),
}

struct Inner {
    lifecycle: Lifecycle,
    events: broadcast::Sender<ZeroBedEvent>,
}

#[derive(Clone)]
pub struct ZeroBedOperation {
    inner: Arc<Inner>,
}

impl Default for ZeroBedOperation {
    fn default() -> Self {
        Self::new()
    }
}

impl ZeroBedOperation {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        Self { inner: Arc::new(Inner { lifecycle: Lifecycle::new(OperationKind::Calibration), events }) }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ZeroBedEvent> {
        self.inner.events.subscribe()
    }

    pub fn start(&self, printer: &Printer) -> Result<(), OperationError> {
        let context = self.inner.lifecycle.begin(printer, ContextOptions::exclusive().without_compensation())?;
        tokio::spawn(self.inner.clone().run(context));
        Ok(())
    }
}

impl Operation for ZeroBedOperation {
    fn lifecycle(&self) -> &Lifecycle {
        &self.inner.lifecycle
    }

    fn activity_description(&self) -> String {
        "Finding bed zero".to_string()
    }
}

impl Inner {
    async fn run(self: Arc<Self>, context: Context) {
        let result = tokio::select! {
            result = self.find_zero(&context) => result,
            _ = self.lifecycle.stop_requested() => Ok(false),
        };
        self.lifecycle.set_stage(OperationStage::Ending);
        let event = match result {
            Ok(completed) => ZeroBedEvent::Stopped { completed },
            Err(e) => {
                tracing::error!("Finding bed zero failed: {}", e);
                ZeroBedEvent::Failed(e.to_string())
            }
        };
        let _ = self.events.send(event);
        self.lifecycle.finish(context);
    }

    fn progress(&self, message: &str) {
        tracing::info!("{}", message);
        let _ = self.events.send(ZeroBedEvent::Progress(message.to_string()));
    }

    async fn find_zero(&self, context: &Context) -> Result<bool, OperationError> {
        self.lifecycle.set_stage(OperationStage::Running);
        self.progress("Lowering head onto the bed");
        context.execute(helpers::find_bed_zero()).await?;
        context.wait_for_moves().await?;

        self.progress("Reading position");
        let position = context.fetch_position().await?;
        tracing::info!("Bed zero found, head at Z {:.2}", position.z);
        Ok(true)
    }
}
