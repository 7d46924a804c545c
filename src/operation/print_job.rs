// src/operation/print_job.rs - Streams a preprocessed program to the printer
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use uuid::Uuid;

use super::{Lifecycle, Operation, OperationError, OperationKind, OperationStage};
use crate::gcode::{helpers, Instruction, Program};
use crate::geometry::Vector3;
use crate::preprocess::Preprocessor;
use crate::printer::{CommandHandle, Context, ContextOptions, Printer};
use crate::stopwatch::Stopwatch;

const EVENT_CHANNEL_SIZE: usize = 1024;
const PAUSE_RETRACTION: f64 = 2.0;
const PAUSE_LIFT: f64 = 5.0;
const PAUSE_FEED_RATE: f64 = 1500.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrintJobState {
    Preparing,
    Heating,
    Printing,
    Pausing,
    Paused,
    Resuming,
    Aborting,
    Finishing,
    Completed,
    Aborted,
    Failed,
}

impl PrintJobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PrintJobState::Completed | PrintJobState::Aborted | PrintJobState::Failed)
    }
}

impl fmt::Display for PrintJobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PrintJobState::Preparing => "preparing",
            PrintJobState::Heating => "heating",
            PrintJobState::Printing => "printing",
            PrintJobState::Pausing => "pausing",
            PrintJobState::Paused => "paused",
            PrintJobState::Resuming => "resuming",
            PrintJobState::Aborting => "aborting",
            PrintJobState::Finishing => "finishing",
            PrintJobState::Completed => "completed",
            PrintJobState::Aborted => "aborted",
            PrintJobState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub enum PrintJobEvent {
    StateChanged(PrintJobState),
    /// The program that will actually be sent.
    Prepared(Arc<Program>),
    HeatingProgress { target: f64, current: f64 },
    /// Line `index` of the prepared program has been confirmed.
    Executed { index: usize, at: Instant },
    LayerChanged { index: usize, z: f64 },
    Completed { elapsed: Duration },
    Aborted { elapsed: Duration },
    Failed { error: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Run,
    Pause,
    Abort,
}

enum Outcome {
    Completed,
    Aborted,
}

struct Inner {
    id: Uuid,
    lifecycle: Lifecycle,
    program: Program,
    preprocessor: Preprocessor,
    state: watch::Sender<PrintJobState>,
    control: watch::Sender<Control>,
    events: broadcast::Sender<PrintJobEvent>,
    executed: AtomicUsize,
    stopwatch: Mutex<Stopwatch>,
}

/// A print: preprocess, heat, stream, finish. Cloning shares the job.
#[derive(Clone)]
pub struct PrintJob {
    inner: Arc<Inner>,
}

impl fmt::Debug for PrintJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrintJob").field("id", &self.inner.id).field("state", &self.state()).finish()
    }
}

impl PrintJob {
    pub fn new(program: Program, preprocessor: Preprocessor) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        Self {
            inner: Arc::new(Inner {
                id: Uuid::new_v4(),
                lifecycle: Lifecycle::new(OperationKind::PrintJob),
                program,
                preprocessor,
                state: watch::channel(PrintJobState::Preparing).0,
                control: watch::channel(Control::Run).0,
                events,
                executed: AtomicUsize::new(0),
                stopwatch: Mutex::new(Stopwatch::new()),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn state(&self) -> PrintJobState {
        *self.inner.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<PrintJobState> {
        self.inner.state.subscribe()
    }

    /// Subscribe before [`PrintJob::start`] to see every event.
    pub fn subscribe(&self) -> broadcast::Receiver<PrintJobEvent> {
        self.inner.events.subscribe()
    }

    /// Lines confirmed so far.
    pub fn executed_count(&self) -> usize {
        self.inner.executed.load(Ordering::Relaxed)
    }

    /// Time spent printing, excluding pauses.
    pub fn elapsed(&self) -> Duration {
        self.inner.elapsed()
    }

    pub fn start(&self, printer: &Printer) -> Result<(), OperationError> {
        let params = self.inner.preprocessor.parameters();
        let options = ContextOptions {
            disable_backlash: !params.use_backlash_compensation,
            ..ContextOptions::exclusive()
        };
        let context = self.inner.lifecycle.begin(printer, options)?;
        tracing::info!("Starting print job {} ({} lines)", self.inner.id, self.inner.program.len());
        tokio::spawn(self.inner.clone().run(context));
        Ok(())
    }

    pub fn pause(&self) -> Result<(), OperationError> {
        match self.state() {
            PrintJobState::Printing | PrintJobState::Resuming => {
                self.inner.control.send_replace(Control::Pause);
                Ok(())
            }
            state => Err(OperationError::InvalidState { action: "pause", state: state.to_string() }),
        }
    }

    pub fn resume(&self) -> Result<(), OperationError> {
        match self.state() {
            PrintJobState::Pausing | PrintJobState::Paused => {
                self.inner.control.send_replace(Control::Run);
                Ok(())
            }
            state => Err(OperationError::InvalidState { action: "resume", state: state.to_string() }),
        }
    }

    /// Stop printing, switch the heater and motors off.
    pub fn abort(&self) {
        if !self.state().is_terminal() {
            tracing::info!("Abort requested for print job {}", self.inner.id);
            self.inner.control.send_replace(Control::Abort);
        }
        self.inner.lifecycle.request_stop();
    }

    /// Wait for the job to reach a terminal state.
    pub async fn wait(&self) -> PrintJobState {
        let mut state = self.subscribe_state();
        match state.wait_for(|s| s.is_terminal()).await {
            Ok(s) => *s,
            Err(_) => self.state(),
        }
    }
}

impl Operation for PrintJob {
    fn lifecycle(&self) -> &Lifecycle {
        &self.inner.lifecycle
    }

    fn activity_description(&self) -> String {
        format!("Print job {}: {}", self.inner.id, self.state())
    }

    fn stop(&self) {
        self.abort();
    }
}

impl Inner {
    fn set_state(&self, state: PrintJobState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::info!("Print job {}: {} -> {}", self.id, previous, state);
            let _ = self.events.send(PrintJobEvent::StateChanged(state));
        }
    }

    fn control(&self) -> Control {
        *self.control.borrow()
    }

    async fn abort_requested(&self) {
        let mut control = self.control.subscribe();
        let _ = control.wait_for(|c| *c == Control::Abort).await;
    }

    fn stopwatch(&self) -> std::sync::MutexGuard<'_, Stopwatch> {
        self.stopwatch.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn elapsed(&self) -> Duration {
        self.stopwatch().elapsed()
    }

    async fn run(self: Arc<Self>, context: Context) {
        let outcome = self.execute(&context).await;
        self.stopwatch().stop();
        let elapsed = self.elapsed();
        match outcome {
            Ok(Outcome::Completed) => {
                tracing::info!("Print job {} completed in {:?}", self.id, elapsed);
                self.set_state(PrintJobState::Completed);
                let _ = self.events.send(PrintJobEvent::Completed { elapsed });
            }
            Ok(Outcome::Aborted) => {
                tracing::info!("Print job {} aborted after {:?}", self.id, elapsed);
                self.set_state(PrintJobState::Aborted);
                let _ = self.events.send(PrintJobEvent::Aborted { elapsed });
            }
            Err(e) => {
                tracing::error!("Print job {} failed: {}", self.id, e);
                self.lifecycle.set_stage(OperationStage::Ending);
                if let Err(e) = shut_down_hardware(&context).await {
                    tracing::debug!("Could not switch off heater and motors: {}", e);
                }
                self.set_state(PrintJobState::Failed);
                let _ = self.events.send(PrintJobEvent::Failed { error: e.to_string() });
            }
        }
        self.lifecycle.finish(context);
    }

    async fn execute(&self, context: &Context) -> Result<Outcome, OperationError> {
        self.set_state(PrintJobState::Preparing);
        let program = Arc::new(self.preprocessor.process(&self.program)?);
        let _ = self.events.send(PrintJobEvent::Prepared(program.clone()));
        if self.control() == Control::Abort {
            return self.abort(context, &mut VecDeque::new()).await;
        }

        self.set_state(PrintJobState::Heating);
        let params = self.preprocessor.parameters();
        let target = params.target_temperature();
        let heating = context.heat_and_wait(target, params.temperature_tolerance, |current| {
            let _ = self.events.send(PrintJobEvent::HeatingProgress { target, current });
        });
        tokio::select! {
            reached = heating => { reached?; }
            _ = self.abort_requested() => return self.abort(context, &mut VecDeque::new()).await,
        }

        self.lifecycle.set_stage(OperationStage::Running);
        self.set_state(PrintJobState::Printing);
        self.stopwatch().start();
        self.print(context, &program).await
    }

    async fn print(&self, context: &Context, program: &Program) -> Result<Outcome, OperationError> {
        let depth = context.session()?.options().buffer_size.max(1);
        let mut extruding = vec![false; program.len()];
        for step in program.enumerate_moves() {
            extruding[step.index] = step.is_extruding();
        }

        let lines = program.lines();
        let mut in_flight = VecDeque::with_capacity(depth);
        let mut layer = None;
        let mut index = 0;
        while index < lines.len() {
            match self.control() {
                Control::Abort => return self.abort(context, &mut in_flight).await,
                Control::Pause if !is_mid_extrusion(&extruding, index) => {
                    self.drain(&mut in_flight).await?;
                    if !self.pause(context, program).await? {
                        return self.abort(context, &mut in_flight).await;
                    }
                    continue;
                }
                _ => {}
            }

            if in_flight.len() >= depth {
                if let Some((done, handle)) = in_flight.pop_front() {
                    self.confirm(done, handle).await?;
                }
            }
            if let Some(current) = program.layer_at(index) {
                if layer != Some(current.index) {
                    layer = Some(current.index);
                    tracing::debug!("Layer {} at Z {:.2}", current.index, current.z);
                    let _ = self.events.send(PrintJobEvent::LayerChanged { index: current.index, z: current.z });
                }
            }
            let handle = context.send(lines[index].clone()).await?;
            in_flight.push_back((index, handle));
            index += 1;
        }
        self.drain(&mut in_flight).await?;
        // A pause held back by a final extrusion run parks once it ends.
        match self.control() {
            Control::Abort => return self.abort(context, &mut in_flight).await,
            Control::Pause => {
                if !self.pause(context, program).await? {
                    return self.abort(context, &mut in_flight).await;
                }
            }
            Control::Run => {}
        }

        self.lifecycle.set_stage(OperationStage::Ending);
        self.set_state(PrintJobState::Finishing);
        context.wait_for_moves().await?;
        shut_down_hardware(context).await?;
        Ok(Outcome::Completed)
    }

    async fn confirm(&self, index: usize, handle: CommandHandle) -> Result<(), OperationError> {
        handle.wait().await?;
        self.executed.fetch_add(1, Ordering::Relaxed);
        let _ = self.events.send(PrintJobEvent::Executed { index, at: Instant::now() });
        Ok(())
    }

    async fn drain(&self, in_flight: &mut VecDeque<(usize, CommandHandle)>) -> Result<(), OperationError> {
        while let Some((index, handle)) = in_flight.pop_front() {
            self.confirm(index, handle).await?;
        }
        Ok(())
    }

    /// Park the head until resumed. Returns `false` when aborted instead.
    async fn pause(&self, context: &Context, program: &Program) -> Result<bool, OperationError> {
        self.set_state(PrintJobState::Pausing);
        let positioning = context.positioning().await?;
        let ceiling = self.preprocessor.parameters().print_volume.max()[2];
        let lift = PAUSE_LIFT.min(ceiling - positioning.position.z).max(0.0);

        let mut park = vec![
            helpers::relative_mode(),
            helpers::extrude(-PAUSE_RETRACTION, PAUSE_FEED_RATE),
            lift_move(lift),
        ];
        park.extend(positioning.restore_mode());
        context.execute_all(park).await?;
        self.stopwatch().stop();
        self.set_state(PrintJobState::Paused);

        let mut control = self.control.subscribe();
        let next = match control.wait_for(|c| *c != Control::Pause).await {
            Ok(c) => *c,
            Err(_) => Control::Abort,
        };
        if next == Control::Abort {
            return Ok(false);
        }

        self.set_state(PrintJobState::Resuming);
        let mut unpark = vec![
            helpers::relative_mode(),
            lift_move(-lift),
            helpers::extrude(PAUSE_RETRACTION, PAUSE_FEED_RATE),
        ];
        unpark.extend(positioning.restore_mode());
        context.execute_all(unpark).await?;
        tracing::debug!("Resuming at line {} of {}", self.executed.load(Ordering::Relaxed), program.len());
        self.stopwatch().start();
        self.set_state(PrintJobState::Printing);
        Ok(true)
    }

    async fn abort(
        &self,
        context: &Context,
        in_flight: &mut VecDeque<(usize, CommandHandle)>,
    ) -> Result<Outcome, OperationError> {
        self.lifecycle.set_stage(OperationStage::Ending);
        self.set_state(PrintJobState::Aborting);
        while let Some((index, handle)) = in_flight.pop_front() {
            if let Err(e) = handle.wait().await {
                tracing::debug!("Line {} failed while aborting: {}", index, e);
            }
        }
        shut_down_hardware(context).await?;
        Ok(Outcome::Aborted)
    }
}

fn lift_move(distance: f64) -> Instruction {
    helpers::move_to(&Vector3::z(distance), Some(PAUSE_FEED_RATE))
}

/// A pause may not land between two consecutive extruding moves.
fn is_mid_extrusion(extruding: &[bool], index: usize) -> bool {
    index > 0 && extruding[index - 1] && extruding.get(index).copied().unwrap_or(false)
}

async fn shut_down_hardware(context: &Context) -> Result<(), OperationError> {
    context.execute(helpers::heater_off()).await?;
    context.execute(helpers::turn_off_motors()).await?;
    Ok(())
}
