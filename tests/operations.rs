// tests/operations.rs - Print jobs, calibration and utility operations against the simulated printer
use std::time::Duration;

use microprint_rs::connection::WireEncoding;
use microprint_rs::gcode::{Field, Instruction, Program};
use microprint_rs::operation::{
    BedCorner, BedLevelCalibration, BedLevelEvent, BedLevelSettings, ExtrusionEvent, ExtrusionOperation,
    ExtrusionSettings, FnSource, OperationStage, PrintJob, PrintJobEvent, PrintJobState, RaiseHeadEvent,
    RaiseHeadOperation, RepeatingCommandSender, RepeatingEvent, ZeroBedEvent, ZeroBedOperation,
};
use microprint_rs::parameters::PrintParameters;
use microprint_rs::printer::eeprom::{encode_float, EepromIndex};
use microprint_rs::printer::{ContextOptions, Printer, PrinterError, PrinterOptions};
use microprint_rs::simulator::{self, SimulatedPrinter, SimulatorConfig};
use microprint_rs::status::StatusProjector;
use microprint_rs::{Operation, OperationError, Preprocessor};
use tokio::sync::{broadcast, mpsc};

const TIMEOUT: Duration = Duration::from_secs(10);

fn options() -> PrinterOptions {
    PrinterOptions { poll_interval: Duration::from_millis(10), ..Default::default() }
}

async fn connect_with(config: SimulatorConfig) -> (Printer, SimulatedPrinter) {
    simulator::connect(config, options(), WireEncoding::Binary).await.unwrap()
}

async fn connect() -> (Printer, SimulatedPrinter) {
    connect_with(SimulatorConfig::default()).await
}

fn code(text: &str) -> Instruction {
    Instruction::parse(text).unwrap()
}

fn small_program() -> Program {
    Program::parse(
        "G90\n\
         M104 S215\n\
         ;LAYER:0\n\
         G1 X10 Y10 Z0.3 F1200\n\
         G1 X20 Y10 E1\n\
         G1 X20 Y20 E2\n\
         ;LAYER:1\n\
         G1 Z0.5\n\
         G1 X10 Y20 E3\n",
    )
    .unwrap()
}

fn long_travel_program(moves: usize) -> Program {
    let mut text = String::from("G90\nM104 S215\n;LAYER:0\n");
    for i in 0..moves {
        text.push_str(&format!("G0 X{} Y10 Z1 F3000\n", 10 + i % 20));
    }
    Program::parse(&text).unwrap()
}

fn preprocessor() -> Preprocessor {
    Preprocessor::new(PrintParameters::default())
}

/// Next event accepted by `pick`, within [`TIMEOUT`].
async fn next_event<E: Clone, T>(events: &mut broadcast::Receiver<E>, mut pick: impl FnMut(E) -> Option<T>) -> T {
    tokio::time::timeout(TIMEOUT, async {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Some(found) = pick(event) {
                        return found;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for an event")
}

/// Every job event up to and including the final one.
async fn job_events(events: &mut broadcast::Receiver<PrintJobEvent>) -> Vec<PrintJobEvent> {
    let mut seen = Vec::new();
    next_event(events, |event| {
        let last = matches!(
            event,
            PrintJobEvent::Completed { .. } | PrintJobEvent::Aborted { .. } | PrintJobEvent::Failed { .. }
        );
        seen.push(event);
        last.then_some(())
    })
    .await;
    seen
}

fn states(events: &[PrintJobEvent]) -> Vec<PrintJobState> {
    events
        .iter()
        .filter_map(|event| match event {
            PrintJobEvent::StateChanged(state) => Some(*state),
            _ => None,
        })
        .collect()
}

/// Wait until nothing is pending, then check the next line number follows
/// on from everything the printer received, with no number used twice.
async fn assert_numbering_continues(printer: &Printer, sim: &SimulatedPrinter) {
    tokio::time::timeout(TIMEOUT, async {
        while printer.pending_count().await > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("pending commands never resolved");
    let context = printer.acquire_context(ContextOptions::raw()).await.unwrap();
    let response = context.execute(code("G4 P1")).await.unwrap();
    context.invalidate();

    let numbers = sim.received_line_numbers();
    let expected: Vec<u16> = (0..numbers.len() as u16).collect();
    assert_eq!(numbers, expected);
    assert_eq!(response.line, numbers.last().copied());
    assert_eq!(printer.pending_count().await, 0);
}

async fn wait_for_state(job: &PrintJob, state: PrintJobState) {
    let mut watch = job.subscribe_state();
    tokio::time::timeout(TIMEOUT, watch.wait_for(|s| *s == state))
        .await
        .expect("timed out waiting for job state")
        .unwrap();
}

#[tokio::test]
async fn test_print_job_runs_to_completion() {
    let (printer, sim) = connect().await;
    let job = PrintJob::new(small_program(), preprocessor());
    let mut events = job.subscribe();
    job.start(&printer).unwrap();

    let seen = job_events(&mut events).await;
    assert_eq!(
        states(&seen),
        vec![PrintJobState::Heating, PrintJobState::Printing, PrintJobState::Finishing, PrintJobState::Completed]
    );
    let prepared = seen
        .iter()
        .find_map(|event| match event {
            PrintJobEvent::Prepared(program) => Some(program.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(job.executed_count(), prepared.len());
    let layers: Vec<usize> = seen
        .iter()
        .filter_map(|event| match event {
            PrintJobEvent::LayerChanged { index, .. } => Some(*index),
            _ => None,
        })
        .collect();
    assert_eq!(layers, vec![0, 1]);

    job.ended().await;
    assert_eq!(job.stage(), OperationStage::Idle);
    let tail: Vec<Option<u16>> = sim.executed().iter().rev().take(3).map(Instruction::m).collect();
    assert_eq!(tail, vec![Some(18), Some(104), Some(400)]);
    assert_eq!(sim.target_temperature(), 0.0);
    assert!((sim.position().z - 0.5).abs() < 1e-4);
    assert!(printer.try_acquire_context(ContextOptions::exclusive()).is_ok());
}

#[tokio::test]
async fn test_heating_finishes_before_printing() {
    let (printer, sim) = connect().await;
    // Without a heat command one is added up front.
    let program = Program::parse("G90\nG1 X10 Y10 Z0.3 F1200\nG1 X20 E1\n").unwrap();
    let job = PrintJob::new(program, preprocessor());
    let mut events = job.subscribe();
    job.start(&printer).unwrap();
    let seen = job_events(&mut events).await;

    let printing = seen
        .iter()
        .position(|event| matches!(event, PrintJobEvent::StateChanged(PrintJobState::Printing)))
        .unwrap();
    let readings: Vec<(usize, f64, f64)> = seen
        .iter()
        .enumerate()
        .filter_map(|(i, event)| match event {
            PrintJobEvent::HeatingProgress { target, current } => Some((i, *target, *current)),
            _ => None,
        })
        .collect();
    assert!(!readings.is_empty());
    assert!(readings.iter().all(|(i, _, _)| *i < printing));
    let (_, target, last) = *readings.last().unwrap();
    assert!(last >= target - 3.0);
    assert!(readings[..readings.len() - 1].iter().all(|(_, target, current)| *current < target - 3.0));

    let first = sim.executed().into_iter().find(|c| c.m() == Some(109)).unwrap();
    assert_eq!(first.get(Field::S), Some(target));
}

#[tokio::test]
async fn test_abort_while_heating() {
    let config = SimulatorConfig { heating_rate: 0.5, ..SimulatorConfig::default() };
    let (printer, sim) = connect_with(config).await;
    let job = PrintJob::new(small_program(), preprocessor());
    let mut events = job.subscribe();
    job.start(&printer).unwrap();

    wait_for_state(&job, PrintJobState::Heating).await;
    job.abort();
    let seen = job_events(&mut events).await;
    assert_eq!(job.wait().await, PrintJobState::Aborted);
    assert!(states(&seen).contains(&PrintJobState::Aborting));
    assert!(!states(&seen).contains(&PrintJobState::Printing));
    assert!(matches!(seen.last(), Some(PrintJobEvent::Aborted { .. })));

    job.ended().await;
    assert_eq!(sim.target_temperature(), 0.0);
    assert!(sim.executed().iter().any(|c| c.m() == Some(18)));
    assert!(!sim.executed().iter().any(|c| c.g() == Some(1)));
    assert!(printer.try_acquire_context(ContextOptions::exclusive()).is_ok());
}

#[tokio::test]
async fn test_pause_parks_and_resume_continues() {
    let config = SimulatorConfig { response_delay: Duration::from_millis(2), ..SimulatorConfig::default() };
    let (printer, sim) = connect_with(config).await;
    let job = PrintJob::new(long_travel_program(150), preprocessor());
    assert!(matches!(job.pause(), Err(OperationError::InvalidState { .. })));
    let mut events = job.subscribe();
    job.start(&printer).unwrap();

    wait_for_state(&job, PrintJobState::Printing).await;
    tokio::time::timeout(TIMEOUT, async {
        while job.executed_count() < 10 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap();
    job.pause().unwrap();
    wait_for_state(&job, PrintJobState::Paused).await;

    assert!((sim.position().z - 6.0).abs() < 1e-4);
    let parked_at = job.executed_count();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(job.executed_count(), parked_at);
    assert!(matches!(job.pause(), Err(OperationError::InvalidState { .. })));

    job.resume().unwrap();
    let seen = job_events(&mut events).await;
    assert_eq!(job.state(), PrintJobState::Completed);
    let states = states(&seen);
    let pausing = states.iter().position(|s| *s == PrintJobState::Pausing).unwrap();
    assert_eq!(
        &states[pausing..pausing + 4],
        &[PrintJobState::Pausing, PrintJobState::Paused, PrintJobState::Resuming, PrintJobState::Printing]
    );
    assert!((sim.position().z - 1.0).abs() < 1e-4);
    // Mode is restored after parking.
    let last_mode = sim.executed().iter().rev().find_map(|c| match c.g() {
        Some(90) | Some(91) => c.g(),
        _ => None,
    });
    assert_eq!(last_mode, Some(90));
}

#[tokio::test]
async fn test_pause_during_final_extrusion_parks_at_end() {
    let config = SimulatorConfig { response_delay: Duration::from_millis(2), ..SimulatorConfig::default() };
    let (printer, sim) = connect_with(config).await;
    let mut text = String::from("G90\nM104 S215\n;LAYER:0\nG1 X10 Y10 Z0.3 F1200\n");
    for i in 1..=120 {
        text.push_str(&format!("G1 X{} Y10 E{}\n", 10 + i % 20, i));
    }
    let job = PrintJob::new(Program::parse(&text).unwrap(), preprocessor());
    let mut events = job.subscribe();
    job.start(&printer).unwrap();

    wait_for_state(&job, PrintJobState::Printing).await;
    tokio::time::timeout(TIMEOUT, async {
        while job.executed_count() < 10 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap();
    job.pause().unwrap();
    wait_for_state(&job, PrintJobState::Paused).await;
    let parked_at = job.executed_count();
    assert!((sim.position().z - 5.3).abs() < 1e-4);

    job.resume().unwrap();
    let seen = job_events(&mut events).await;
    assert_eq!(job.state(), PrintJobState::Completed);
    let prepared = seen
        .iter()
        .find_map(|event| match event {
            PrintJobEvent::Prepared(program) => Some(program.len()),
            _ => None,
        })
        .unwrap();
    assert_eq!(parked_at, prepared);
    let states = states(&seen);
    let paused = states.iter().position(|s| *s == PrintJobState::Paused).unwrap();
    let finishing = states.iter().position(|s| *s == PrintJobState::Finishing).unwrap();
    assert!(paused < finishing);
}

#[tokio::test]
async fn test_status_follows_job() {
    let (printer, _sim) = connect().await;
    let job = PrintJob::new(small_program(), preprocessor());
    let (status, task) = StatusProjector::follow(&job);
    job.start(&printer).unwrap();
    assert_eq!(job.wait().await, PrintJobState::Completed);
    tokio::time::timeout(TIMEOUT, task).await.unwrap().unwrap();

    let status = status.borrow().clone().unwrap();
    assert_eq!(status.executed, status.total);
    assert!((status.progress - 1.0).abs() < 1e-9);
    assert_eq!(status.layer_count, 2);
}

#[tokio::test]
async fn test_invalid_program_fails_job() {
    let (printer, sim) = connect().await;
    let job = PrintJob::new(Program::parse("G1 X500 Y10 Z1 E1\n").unwrap(), preprocessor());
    let mut events = job.subscribe();
    job.start(&printer).unwrap();
    let seen = job_events(&mut events).await;
    assert!(matches!(seen.last(), Some(PrintJobEvent::Failed { .. })));
    assert_eq!(job.state(), PrintJobState::Failed);
    assert!(!sim.executed().iter().any(|c| c.g() == Some(1)));
}

#[tokio::test]
async fn test_bed_level_calibration_stores_offsets() {
    let (printer, sim) = connect().await;
    let calibration = BedLevelCalibration::new(BedLevelSettings::default());
    assert!(matches!(calibration.adjust_up(), Err(OperationError::NotRunning)));
    let mut events = calibration.subscribe();
    calibration.start_at_level(&printer, 2.0, 0.1).unwrap();

    // The calibration holds the printer exclusively.
    let job = PrintJob::new(small_program(), preprocessor());
    assert!(matches!(job.start(&printer), Err(OperationError::Printer(PrinterError::ContextBusy))));

    let adjustments: [(BedCorner, i32); 4] =
        [(BedCorner::BackLeft, -2), (BedCorner::BackRight, 0), (BedCorner::FrontRight, 1), (BedCorner::FrontLeft, 0)];
    for (corner, steps) in adjustments {
        let at = next_event(&mut events, |event| match event {
            BedLevelEvent::AtCorner { corner, .. } => Some(corner),
            _ => None,
        })
        .await;
        assert_eq!(at, corner);
        for _ in 0..steps.abs() {
            if steps > 0 { calibration.adjust_up().unwrap() } else { calibration.adjust_down().unwrap() }
        }
        calibration.continue_().unwrap();
    }

    let offsets = next_event(&mut events, |event| match event {
        BedLevelEvent::Finished(offsets) => Some(offsets),
        _ => None,
    })
    .await;
    assert!((offsets.back_left - 1.8).abs() < 1e-9);
    assert!((offsets.back_right - 1.9).abs() < 1e-9);
    assert!((offsets.front_right - 1.95).abs() < 1e-9);
    assert!((offsets.front_left - 1.9).abs() < 1e-9);
    assert_eq!(offsets.common, 0.0);

    calibration.ended().await;
    assert_eq!(sim.eeprom(EepromIndex::BED_OFFSET_BACK_LEFT), Some(encode_float(offsets.back_left)));
    assert_eq!(sim.eeprom(EepromIndex::BED_OFFSET_FRONT_RIGHT), Some(encode_float(offsets.front_right)));
    assert_eq!(printer.calibration().await.bed_level, offsets);
    assert!((sim.position().z - 2.0).abs() < 1e-4);
}

#[tokio::test]
async fn test_bed_level_stop_cancels() {
    let (printer, sim) = connect().await;
    let calibration = BedLevelCalibration::new(BedLevelSettings::default());
    let mut events = calibration.subscribe();
    calibration.start_at_level(&printer, 2.0, 0.1).unwrap();
    next_event(&mut events, |event| matches!(event, BedLevelEvent::AtCorner { .. }).then_some(())).await;

    calibration.stop();
    next_event(&mut events, |event| matches!(event, BedLevelEvent::Cancelled).then_some(())).await;
    calibration.ended().await;
    assert_eq!(sim.eeprom(EepromIndex::BED_OFFSET_BACK_LEFT), None);
}

#[tokio::test]
async fn test_stop_with_command_in_flight() {
    let config = SimulatorConfig { response_delay: Duration::from_millis(100), ..SimulatorConfig::default() };
    let (printer, sim) = connect_with(config).await;
    let raise = RaiseHeadOperation::new(20.0);
    let mut events = raise.subscribe();
    raise.start(&printer).unwrap();
    next_event(&mut events, |event| matches!(event, RaiseHeadEvent::Started).then_some(())).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(printer.pending_count().await > 0);

    raise.stop();
    let did_raise = next_event(&mut events, |event| match event {
        RaiseHeadEvent::Stopped { did_raise } => Some(did_raise),
        _ => None,
    })
    .await;
    assert!(!did_raise);
    raise.ended().await;
    assert_numbering_continues(&printer, &sim).await;
}

#[tokio::test]
async fn test_abort_with_command_in_flight() {
    let config = SimulatorConfig {
        heating_rate: 0.5,
        response_delay: Duration::from_millis(20),
        link_buffer: 64,
        ..SimulatorConfig::default()
    };
    let (printer, sim) = connect_with(config).await;
    let job = PrintJob::new(small_program(), preprocessor());
    job.start(&printer).unwrap();
    wait_for_state(&job, PrintJobState::Heating).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    job.abort();
    assert_eq!(job.wait().await, PrintJobState::Aborted);
    job.ended().await;
    assert!(sim.executed().iter().any(|c| c.m() == Some(18)));
    assert_numbering_continues(&printer, &sim).await;
}

#[tokio::test]
async fn test_raise_head() {
    let (printer, sim) = connect().await;
    let raise = RaiseHeadOperation::new(20.0);
    let mut events = raise.subscribe();
    raise.start(&printer).unwrap();
    let did_raise = next_event(&mut events, |event| match event {
        RaiseHeadEvent::Stopped { did_raise } => Some(did_raise),
        _ => None,
    })
    .await;
    assert!(did_raise);
    raise.ended().await;
    assert!((sim.position().z - 20.0).abs() < 1e-4);

    let again = RaiseHeadOperation::new(10.0);
    let mut events = again.subscribe();
    again.start(&printer).unwrap();
    let did_raise = next_event(&mut events, |event| match event {
        RaiseHeadEvent::Stopped { did_raise } => Some(did_raise),
        _ => None,
    })
    .await;
    assert!(!did_raise);
    assert!(matches!(again.start(&printer), Err(OperationError::AlreadyStarted)));
}

#[tokio::test]
async fn test_zero_bed_after_raise() {
    let (printer, sim) = connect().await;
    let raise = RaiseHeadOperation::new(20.0);
    raise.start(&printer).unwrap();
    raise.ended().await;
    assert!((sim.position().z - 20.0).abs() < 1e-4);

    let zero = ZeroBedOperation::new();
    let mut events = zero.subscribe();
    zero.start(&printer).unwrap();
    let completed = next_event(&mut events, |event| match event {
        ZeroBedEvent::Stopped { completed } => Some(completed),
        ZeroBedEvent::Failed(error) => panic!("zero bed failed: {}", error),
        ZeroBedEvent::Progress(_) => None,
    })
    .await;
    zero.ended().await;

    assert!(completed);
    assert_eq!(sim.position().z, 0.0);
    assert!(sim.executed().iter().any(|c| c.g() == Some(30)));
    let context = printer.acquire_context(ContextOptions::raw()).await.unwrap();
    assert_eq!(context.positioning().await.unwrap().position.z, 0.0);
}

#[tokio::test]
async fn test_zero_bed_stop_before_contact() {
    let (printer, sim) = connect_with(SimulatorConfig {
        response_delay: Duration::from_millis(100),
        ..Default::default()
    })
    .await;
    let zero = ZeroBedOperation::new();
    let mut events = zero.subscribe();
    zero.start(&printer).unwrap();
    next_event(&mut events, |event| matches!(event, ZeroBedEvent::Progress(_)).then_some(())).await;
    zero.stop();
    let completed = next_event(&mut events, |event| match event {
        ZeroBedEvent::Stopped { completed } => Some(completed),
        _ => None,
    })
    .await;
    zero.ended().await;
    assert!(!completed);
    assert_numbering_continues(&printer, &sim).await;
}

#[tokio::test]
async fn test_extrusion_until_stopped() {
    let (printer, sim) = connect().await;
    let extrusion = ExtrusionOperation::new(ExtrusionSettings::default());
    let mut events = extrusion.subscribe();
    extrusion.start(&printer).unwrap();

    next_event(&mut events, |event| matches!(event, ExtrusionEvent::Extruding).then_some(())).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    extrusion.stop();
    let steps = next_event(&mut events, |event| match event {
        ExtrusionEvent::Stopped { steps } => Some(steps),
        _ => None,
    })
    .await;
    extrusion.ended().await;

    assert!(steps >= 1);
    let executed = sim.executed();
    let extrusions = executed.iter().filter(|c| c.g() == Some(1) && c.has(Field::E)).count();
    assert_eq!(extrusions as u64, steps);
    assert_eq!(executed.iter().rev().find(|c| matches!(c.g(), Some(90) | Some(91))).and_then(Instruction::g), Some(90));
    assert_eq!(sim.target_temperature(), 0.0);
}

#[tokio::test]
async fn test_repeating_sender_keeps_going_after_rejection() {
    let (printer, sim) = connect().await;
    sim.inject_faults(|faults| {
        faults.errors.insert(2, 9);
    });
    let mut remaining = 5;
    let source = FnSource(move || {
        if remaining == 0 {
            return None;
        }
        remaining -= 1;
        Some(code(&format!("G4 P{}", remaining)))
    });
    let sender = RepeatingCommandSender::new(source, ContextOptions::concurrent());
    let mut events = sender.subscribe();
    sender.start(&printer).unwrap();

    let mut sent = 0;
    let mut rejected = 0;
    let total = next_event(&mut events, |event| match event {
        RepeatingEvent::Sent { .. } => {
            sent += 1;
            None
        }
        RepeatingEvent::Rejected { .. } => {
            rejected += 1;
            None
        }
        RepeatingEvent::Ended { sent } => Some(sent),
        RepeatingEvent::Stopping => None,
    })
    .await;
    assert_eq!(total, 4);
    assert_eq!(sent, 4);
    assert_eq!(rejected, 1);
    sender.ended().await;
}

#[tokio::test]
async fn test_console_sends_raw_commands() {
    let (printer, sim) = connect().await;
    let (tx, rx) = mpsc::channel(8);
    let console = RepeatingCommandSender::console(rx, false);
    let mut events = console.subscribe();
    console.start(&printer).unwrap();

    tx.send(code("G90")).await.unwrap();
    tx.send(code("G0 X10 Y5 F600")).await.unwrap();
    let response = next_event(&mut events, |event| match event {
        RepeatingEvent::Sent { code, response } if code.g() == Some(0) => Some(response),
        _ => None,
    })
    .await;
    assert_eq!(response.line, Some(1));
    let sent = sim.executed().into_iter().find(|c| c.g() == Some(0)).unwrap();
    assert_eq!(sent, code("G0 X10 Y5 F600"));

    // A console shares the printer with other concurrent users.
    assert!(printer.try_acquire_context(ContextOptions::concurrent()).is_ok());
    drop(tx);
    next_event(&mut events, |event| matches!(event, RepeatingEvent::Ended { .. }).then_some(())).await;
    console.ended().await;
}
