// src/operation/repeating.rs - Sends whatever a caller-supplied source produces
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use super::{Lifecycle, Operation, OperationError, OperationKind, OperationStage};
use crate::gcode::Instruction;
use crate::printer::{Context, ContextOptions, Printer, PrinterError, Response};

const EVENT_CHANNEL_SIZE: usize = 256;

/// Produces the next instruction to send, or `None` when done.
#[async_trait]
pub trait CommandSource: Send {
    async fn next_code(&mut self) -> Option<Instruction>;
}

#[async_trait]
impl CommandSource for mpsc::Receiver<Instruction> {
    async fn next_code(&mut self) -> Option<Instruction> {
        self.recv().await
    }
}

/// Adapts a closure into a [`CommandSource`].
pub struct FnSource<F>(pub F);

#[async_trait]
impl<F> CommandSource for FnSource<F>
where
    F: FnMut() -> Option<Instruction> + Send,
{
    async fn next_code(&mut self) -> Option<Instruction> {
        (self.0)()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RepeatingEvent {
    Sent { code: Instruction, response: Response },
    Rejected { code: Instruction, error: String },
    Stopping,
    Ended { sent: u64 },
}

struct Inner {
    lifecycle: Lifecycle,
    options: ContextOptions,
    events: broadcast::Sender<RepeatingEvent>,
    source: Mutex<Option<Box<dyn CommandSource>>>,
}

#[derive(Clone)]
pub struct RepeatingCommandSender {
    inner: Arc<Inner>,
}

impl RepeatingCommandSender {
    pub fn new(source: impl CommandSource + 'static, options: ContextOptions) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        Self {
            inner: Arc::new(Inner {
                lifecycle: Lifecycle::new(OperationKind::Utility),
                options,
                events,
                source: Mutex::new(Some(Box::new(source))),
            }),
        }
    }

    /// A console: feed rates pass through unconverted unless asked for.
    pub fn console(source: impl CommandSource + 'static, convert_feed_rates: bool) -> Self {
        let options = ContextOptions { disable_feed_rate_conversion: !convert_feed_rates, ..ContextOptions::raw() };
        Self::new(source, options)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RepeatingEvent> {
        self.inner.events.subscribe()
    }

    pub fn start(&self, printer: &Printer) -> Result<(), OperationError> {
        let source = self
            .inner
            .source
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or(OperationError::AlreadyStarted)?;
        let context = self.inner.lifecycle.begin(printer, self.inner.options)?;
        tokio::spawn(self.inner.clone().run(context, source));
        Ok(())
    }
}

impl Operation for RepeatingCommandSender {
    fn lifecycle(&self) -> &Lifecycle {
        &self.inner.lifecycle
    }

    fn activity_description(&self) -> String {
        "Sending commands".to_string()
    }

    fn stop(&self) {
        let _ = self.inner.events.send(RepeatingEvent::Stopping);
        self.inner.lifecycle.request_stop();
    }
}

impl Inner {
    async fn run(self: Arc<Self>, context: Context, mut source: Box<dyn CommandSource>) {
        self.lifecycle.set_stage(OperationStage::Running);
        let mut sent = 0;
        loop {
            let next = tokio::select! {
                next = source.next_code() => next,
                _ = self.lifecycle.stop_requested() => None,
            };
            let Some(code) = next else { break };
            match context.execute(code.clone()).await {
                Ok(response) => {
                    sent += 1;
                    let _ = self.events.send(RepeatingEvent::Sent { code, response });
                }
                // The printer refused this one; the link is still fine.
                Err(PrinterError::Protocol { code: error, line }) => {
                    tracing::warn!("'{}' rejected with error {} on line {}", code, error, line);
                    let error = PrinterError::Protocol { code: error, line }.to_string();
                    let _ = self.events.send(RepeatingEvent::Rejected { code, error });
                }
                Err(e) => {
                    tracing::error!("Stopping command sender: {}", e);
                    let _ = self.events.send(RepeatingEvent::Rejected { code, error: e.to_string() });
                    break;
                }
            }
        }
        self.lifecycle.set_stage(OperationStage::Ending);
        tracing::debug!("Command sender done after {} commands", sent);
        let _ = self.events.send(RepeatingEvent::Ended { sent });
        self.lifecycle.finish(context);
    }
}
