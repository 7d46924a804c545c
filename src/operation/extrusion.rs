// src/operation/extrusion.rs - Heat up, then feed or pull filament until stopped
use std::sync::Arc;

use tokio::sync::broadcast;

use super::{Lifecycle, Operation, OperationError, OperationKind, OperationStage};
use crate::gcode::helpers;
use crate::printer::{CommandHandle, Context, ContextOptions, Printer};

const EVENT_CHANNEL_SIZE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExtrusionSettings {
    pub temperature: f64,
    pub temperature_tolerance: f64,
    /// Retract instead of extrude.
    pub retract: bool,
    /// Filament per step, mm.
    pub step: f64,
    pub feed_rate: f64,
}

impl Default for ExtrusionSettings {
    fn default() -> Self {
        Self { temperature: 215.0, temperature_tolerance: 3.0, retract: false, step: 1.0, feed_rate: 240.0 }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExtrusionEvent {
    Heating { target: f64, current: f64 },
    Extruding,
    Stopped { steps: u64 },
    Failed(String),
}

struct Inner {
    lifecycle: Lifecycle,
    settings: ExtrusionSettings,
    events: broadcast::Sender<ExtrusionEvent>,
}

#[derive(Clone)]
pub struct ExtrusionOperation {
    inner: Arc<Inner>,
}

impl ExtrusionOperation {
    pub fn new(settings: ExtrusionSettings) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        Self { inner: Arc::new(Inner { lifecycle: Lifecycle::new(OperationKind::Utility), settings, events }) }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExtrusionEvent> {
        self.inner.events.subscribe()
    }

    pub fn start(&self, printer: &Printer) -> Result<(), OperationError> {
        let context = self.inner.lifecycle.begin(printer, ContextOptions::exclusive().without_compensation())?;
        tracing::info!("{}", self.activity_description());
        tokio::spawn(self.inner.clone().run(context));
        Ok(())
    }
}

impl Operation for ExtrusionOperation {
    fn lifecycle(&self) -> &Lifecycle {
        &self.inner.lifecycle
    }

    fn activity_description(&self) -> String {
        let verb = if self.inner.settings.retract { "Retracting" } else { "Extruding" };
        format!("{} filament at {:.0}°C", verb, self.inner.settings.temperature)
    }
}

impl Inner {
    async fn run(self: Arc<Self>, context: Context) {
        let result = self.extrude(&context).await;
        self.lifecycle.set_stage(OperationStage::Ending);
        let cleanup = async {
            context.set_relative_mode(false).await?;
            context.execute(helpers::heater_off()).await?;
            Ok::<_, OperationError>(())
        };
        if let Err(e) = cleanup.await {
            tracing::debug!("Could not restore the printer after extrusion: {}", e);
        }
        let event = match result {
            Ok(steps) => {
                tracing::info!("Extrusion stopped after {} steps", steps);
                ExtrusionEvent::Stopped { steps }
            }
            Err(e) => {
                tracing::error!("Extrusion failed: {}", e);
                ExtrusionEvent::Failed(e.to_string())
            }
        };
        let _ = self.events.send(event);
        self.lifecycle.finish(context);
    }

    async fn extrude(&self, context: &Context) -> Result<u64, OperationError> {
        let target = self.settings.temperature;
        let heating = context.heat_and_wait(target, self.settings.temperature_tolerance, |current| {
            let _ = self.events.send(ExtrusionEvent::Heating { target, current });
        });
        tokio::select! {
            reached = heating => { reached?; }
            _ = self.lifecycle.stop_requested() => return Ok(0),
        }

        self.lifecycle.set_stage(OperationStage::Running);
        let _ = self.events.send(ExtrusionEvent::Extruding);
        context.set_relative_mode(true).await?;
        let amount = if self.settings.retract { -self.settings.step } else { self.settings.step };

        // One step stays queued so the motion does not stutter.
        let mut previous: Option<CommandHandle> = None;
        let mut steps = 0;
        while !self.lifecycle.is_stopping() {
            let handle = context.send(helpers::extrude(amount, self.settings.feed_rate)).await?;
            if let Some(previous) = previous.replace(handle) {
                previous.wait().await?;
                steps += 1;
            }
        }
        if let Some(last) = previous {
            last.wait().await?;
            steps += 1;
        }
        Ok(steps)
    }
}
