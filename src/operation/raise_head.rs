// src/operation/raise_head.rs - Lift the print head to a safe height
use std::sync::Arc;

use tokio::sync::broadcast;

use super::{Lifecycle, Operation, OperationError, OperationKind, OperationStage};
use crate::geometry::Vector3;
use crate::printer::{Context, ContextOptions, Printer};

const EVENT_CHANNEL_SIZE: usize = 16;
const RAISE_FEED_RATE: f64 = 600.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RaiseHeadEvent {
    Started,
    Stopped { did_raise: bool },
    Failed,
}

struct Inner {
    lifecycle: Lifecycle,
    target_height: f64,
    events: broadcast::Sender<RaiseHeadEvent>,
}

/// Raises Z to `target_height`; does nothing when already at or above it.
#[derive(Clone)]
pub struct RaiseHeadOperation {
    inner: Arc<Inner>,
}

impl RaiseHeadOperation {
    pub fn new(target_height: f64) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        Self {
            inner: Arc::new(Inner { lifecycle: Lifecycle::new(OperationKind::Utility), target_height, events }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RaiseHeadEvent> {
        self.inner.events.subscribe()
    }

    pub fn start(&self, printer: &Printer) -> Result<(), OperationError> {
        let context = self.inner.lifecycle.begin(printer, ContextOptions::exclusive().without_compensation())?;
        tokio::spawn(self.inner.clone().run(context));
        Ok(())
    }
}

impl Operation for RaiseHeadOperation {
    fn lifecycle(&self) -> &Lifecycle {
        &self.inner.lifecycle
    }

    fn activity_description(&self) -> String {
        format!("Raising head to {:.1} mm", self.inner.target_height)
    }
}

impl Inner {
    async fn run(self: Arc<Self>, context: Context) {
        let _ = self.events.send(RaiseHeadEvent::Started);
        let result = tokio::select! {
            result = self.raise(&context) => result,
            _ = self.lifecycle.stop_requested() => Ok(false),
        };
        self.lifecycle.set_stage(OperationStage::Ending);
        let event = match result {
            Ok(did_raise) => RaiseHeadEvent::Stopped { did_raise },
            Err(e) => {
                tracing::error!("Raising head failed: {}", e);
                RaiseHeadEvent::Failed
            }
        };
        let _ = self.events.send(event);
        self.lifecycle.finish(context);
    }

    async fn raise(&self, context: &Context) -> Result<bool, OperationError> {
        let position = context.fetch_position().await?;
        self.lifecycle.set_stage(OperationStage::Running);
        if position.z >= self.target_height {
            tracing::info!("Head already at Z {:.2}", position.z);
            return Ok(false);
        }
        context.set_relative_mode(false).await?;
        context.move_to(&Vector3::z(self.target_height), RAISE_FEED_RATE).await?;
        context.wait_for_moves().await?;
        tracing::info!("Raised head from Z {:.2} to {:.2}", position.z, self.target_height);
        Ok(true)
    }
}
