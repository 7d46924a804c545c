// src/status.rs - Progress and remaining time projection for a running print
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::gcode::{PrintPhase, Program};
use crate::operation::{PrintJob, PrintJobEvent, PrintJobState};
use crate::stopwatch::Stopwatch;

/// Motion lines that have to run in the model phase before remaining
/// time is estimated.
pub const MIN_REMAINING_SAMPLES: usize = 20;

#[derive(Debug, Clone, PartialEq)]
pub struct PrintStatus {
    /// 0.0 ..= 1.0, weighted by estimated duration.
    pub progress: f64,
    pub phase: Option<PrintPhase>,
    pub phase_progress: f64,
    pub layer: Option<usize>,
    pub layer_count: usize,
    pub layer_progress: f64,
    pub executed: usize,
    pub total: usize,
    pub elapsed: Duration,
    /// `None` until enough of the model has printed to say.
    pub remaining: Option<Duration>,
}

/// Where the model phase started, in both clocks.
#[derive(Debug, Clone, Copy)]
struct ModelStart {
    elapsed: Duration,
    estimated: f64,
}

#[derive(Debug, Clone)]
pub struct StatusProjector {
    program: Arc<Program>,
    /// `cumulative[i]` is the estimated seconds for lines `0..i`.
    cumulative: Vec<f64>,
    motion: Vec<bool>,
    executed: usize,
    samples: usize,
    model_start: Option<ModelStart>,
    stopwatch: Stopwatch,
}

impl StatusProjector {
    pub fn new(program: Arc<Program>) -> Self {
        let mut durations = vec![0.0; program.len()];
        let mut motion = vec![false; program.len()];
        for step in program.enumerate_moves() {
            motion[step.index] = true;
            if step.feed_rate > 0.0 {
                durations[step.index] = step.distance() / (step.feed_rate / 60.0);
            }
        }
        let mut cumulative = Vec::with_capacity(durations.len() + 1);
        cumulative.push(0.0);
        let mut total = 0.0;
        for seconds in durations {
            total += seconds;
            cumulative.push(total);
        }
        Self {
            program,
            cumulative,
            motion,
            executed: 0,
            samples: 0,
            model_start: None,
            stopwatch: Stopwatch::new(),
        }
    }

    /// Estimated duration of the whole program, from distances and feed rates.
    pub fn estimated_duration(&self) -> Duration {
        Duration::from_secs_f64(self.total_estimate())
    }

    fn total_estimate(&self) -> f64 {
        self.cumulative.last().copied().unwrap_or(0.0)
    }

    pub fn start(&mut self, at: Instant) {
        self.stopwatch.start_at(at);
    }

    pub fn pause(&mut self, at: Instant) {
        self.stopwatch.stop_at(at);
    }

    /// Line `index` finished executing at `at`.
    pub fn record_executed(&mut self, index: usize, at: Instant) {
        if index >= self.program.len() {
            return;
        }
        self.executed = self.executed.max(index + 1);
        if self.program.phase_at(index) != Some(PrintPhase::Model) {
            return;
        }
        if self.model_start.is_none() {
            self.model_start = Some(ModelStart {
                elapsed: self.stopwatch.elapsed_at(at),
                estimated: self.cumulative[index],
            });
        }
        if self.motion[index] {
            self.samples += 1;
        }
    }

    /// Apply one print job event.
    pub fn observe(&mut self, event: &PrintJobEvent) {
        let now = Instant::now();
        match event {
            PrintJobEvent::StateChanged(PrintJobState::Printing) => self.start(now),
            PrintJobEvent::StateChanged(state) if *state == PrintJobState::Paused || state.is_terminal() => {
                self.pause(now)
            }
            PrintJobEvent::Executed { index, at } => self.record_executed(*index, *at),
            _ => {}
        }
    }

    pub fn snapshot(&self, now: Instant) -> PrintStatus {
        let total = self.program.len();
        let done = self.cumulative.get(self.executed).copied().unwrap_or(0.0);
        let total_estimate = self.total_estimate();
        let progress = if total_estimate > 0.0 {
            done / total_estimate
        } else if total > 0 {
            self.executed as f64 / total as f64
        } else {
            0.0
        };

        // The line currently being worked on.
        let current = self.executed.min(total.saturating_sub(1));
        let phase_range = self.program.phases().iter().find(|range| range.lines.contains(&current));
        let phase_progress = phase_range.map_or(0.0, |range| fraction(self.executed, &range.lines));
        let layer = self.program.layer_at(current);
        let layer_progress = layer.map_or(0.0, |layer| fraction(self.executed, &layer.lines));

        let elapsed = self.stopwatch.elapsed_at(now);
        PrintStatus {
            progress: progress.clamp(0.0, 1.0),
            phase: phase_range.map(|range| range.phase),
            phase_progress,
            layer: layer.map(|layer| layer.index),
            layer_count: self.program.layers().len(),
            layer_progress,
            executed: self.executed,
            total,
            elapsed,
            remaining: self.remaining(elapsed, done, total_estimate),
        }
    }

    /// Scale the estimate left by how fast the model has printed so far.
    fn remaining(&self, elapsed: Duration, done: f64, total_estimate: f64) -> Option<Duration> {
        let start = self.model_start?;
        if self.samples < MIN_REMAINING_SAMPLES {
            return None;
        }
        let estimated = done - start.estimated;
        let actual = elapsed.saturating_sub(start.elapsed).as_secs_f64();
        let rate = if estimated > 0.0 && actual > 0.0 { actual / estimated } else { 1.0 };
        Some(Duration::from_secs_f64(((total_estimate - done) * rate).max(0.0)))
    }

    /// Follow `job` in the background. Subscribe before the job starts.
    pub fn follow(job: &PrintJob) -> (watch::Receiver<Option<PrintStatus>>, JoinHandle<()>) {
        let (status, receiver) = watch::channel(None);
        let mut events = job.subscribe();
        let task = tokio::spawn(async move {
            let mut projector: Option<StatusProjector> = None;
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!("Status projection missed {} events", missed);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if let PrintJobEvent::Prepared(program) = &event {
                    projector = Some(StatusProjector::new(program.clone()));
                }
                let Some(projector) = projector.as_mut() else { continue };
                projector.observe(&event);
                status.send_replace(Some(projector.snapshot(Instant::now())));
                if let PrintJobEvent::StateChanged(state) = event {
                    if state.is_terminal() {
                        break;
                    }
                }
            }
        });
        (receiver, task)
    }
}

fn fraction(executed: usize, lines: &std::ops::Range<usize>) -> f64 {
    if lines.is_empty() {
        return 0.0;
    }
    (executed.saturating_sub(lines.start) as f64 / lines.len() as f64).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn program() -> Arc<Program> {
        let mut text = String::from("G90\nM104 S215\n;LAYER:0\n");
        for i in 0..40 {
            text.push_str(&format!("G1 X{} Y0 E{} F600\n", (i % 2) * 10, i + 1));
        }
        text.push_str(";END\nM104 S0\n");
        Arc::new(Program::parse(&text).unwrap())
    }

    #[test]
    fn test_progress_is_duration_weighted() {
        let program = Arc::new(Program::parse("G1 X10 F600\nM105\nG1 X40 F600\n").unwrap());
        let mut projector = StatusProjector::new(program);
        assert_eq!(projector.estimated_duration(), Duration::from_secs(4));
        let t0 = Instant::now();
        projector.start(t0);
        projector.record_executed(0, t0);
        projector.record_executed(1, t0);
        let status = projector.snapshot(t0);
        assert!((status.progress - 0.25).abs() < 1e-9);
        assert_eq!(status.executed, 2);
        assert_eq!(status.phase, Some(PrintPhase::Model));
    }

    #[test]
    fn test_remaining_needs_model_samples() {
        let mut projector = StatusProjector::new(program());
        let t0 = Instant::now();
        projector.start(t0);
        projector.record_executed(0, t0);
        assert_eq!(projector.snapshot(t0).phase, Some(PrintPhase::Preamble));
        assert!(projector.snapshot(t0).remaining.is_none());

        projector.record_executed(1, t0);
        projector.record_executed(2, t0);
        let first_move = 3;
        let last = first_move + MIN_REMAINING_SAMPLES - 1;
        for index in first_move..last {
            projector.record_executed(index, t0 + Duration::from_secs(index as u64));
        }
        assert!(projector.snapshot(t0 + Duration::from_secs(30)).remaining.is_none());

        projector.record_executed(last, t0 + Duration::from_secs(last as u64));
        let status = projector.snapshot(t0 + Duration::from_secs(last as u64));
        assert_eq!(status.phase, Some(PrintPhase::Model));
        assert!(status.remaining.is_some());
        assert_eq!(status.layer, Some(0));
    }

    #[test]
    fn test_paused_time_is_not_elapsed() {
        let mut projector = StatusProjector::new(program());
        let t0 = Instant::now();
        projector.start(t0);
        projector.pause(t0 + Duration::from_secs(10));
        let status = projector.snapshot(t0 + Duration::from_secs(100));
        assert_eq!(status.elapsed, Duration::from_secs(10));
    }
}
