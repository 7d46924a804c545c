// src/main.rs - microprint command line
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use microprint_rs::config::{self, Config};
use microprint_rs::connection::{SerialTransport, TransportProvider};
use microprint_rs::gcode::{helpers, Instruction, Program, SlicerKind};
use microprint_rs::operation::{
    BedLevelCalibration, BedLevelEvent, BedLevelSettings, ExtrusionEvent, ExtrusionOperation, ExtrusionSettings,
    Operation, PrintJob, PrintJobEvent, RaiseHeadEvent, RaiseHeadOperation, RepeatingCommandSender, RepeatingEvent,
    ZeroBedEvent, ZeroBedOperation,
};
use microprint_rs::parameters::FilamentType;
use microprint_rs::preprocess::Preprocessor;
use microprint_rs::printer::{ContextOptions, Printer};
use microprint_rs::simulator::{SimulatorConfig, SimulatorTransport};
use microprint_rs::status::StatusProjector;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Parser)]
#[command(name = "microprint", version, about = "Drive a Micro 3D printer over its serial port")]
struct Cli {
    /// Configuration file; defaults apply when it does not exist.
    #[arg(short, long, default_value = "microprint.toml")]
    config: PathBuf,

    /// Serial port, overriding the configuration.
    #[arg(short, long)]
    port: Option<String>,

    /// Talk to a simulated printer instead of real hardware.
    #[arg(long)]
    simulate: bool,

    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print a G-code file.
    Print {
        file: PathBuf,
        #[arg(long)]
        filament: Option<FilamentType>,
        #[arg(long)]
        temperature: Option<f64>,
        #[arg(long)]
        wave_bonding: bool,
    },
    /// Write the preprocessed form of a G-code file.
    Preprocess { input: PathBuf, output: PathBuf },
    /// Show printer identity, calibration and loaded filament.
    Info,
    /// Move the head to its home position.
    Home,
    /// Lower the head onto the bed and take that height as Z zero.
    ZeroBed,
    /// Raise the head to a height.
    RaiseHead {
        #[arg(long, default_value_t = 20.0)]
        height: f64,
    },
    /// Push filament through the nozzle until Enter is pressed.
    Extrude {
        #[arg(long)]
        retract: bool,
        #[arg(long)]
        temperature: Option<f64>,
    },
    /// Interactive bed level calibration.
    Level {
        #[arg(long, default_value_t = 2.0)]
        start_z: f64,
        #[arg(long, default_value_t = 0.1)]
        height_target: f64,
        #[arg(long)]
        center: bool,
    },
    /// Send G-code typed on stdin.
    Console {
        #[arg(long)]
        convert_feed_rates: bool,
    },
    /// List serial ports.
    Ports,
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let cli = Cli::parse();
    let log_level = if cli.verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };
    tracing_subscriber::fmt().with_max_level(log_level).init();

    let mut config = read_config(&cli.config)?;
    if let Some(port) = &cli.port {
        config.serial.port = port.clone();
    }
    let transport: Box<dyn TransportProvider> = if cli.simulate {
        Box::new(SimulatorTransport::new(SimulatorConfig::default()))
    } else {
        Box::new(SerialTransport)
    };

    match cli.command {
        Command::Ports => {
            for port in transport.available_ports() {
                println!("{}", port);
            }
            Ok(())
        }
        Command::Preprocess { input, output } => {
            let program = Program::load(&input).await?;
            log_slicer_profile(&program);
            let processed = preprocessor(&config).process(&program)?;
            processed.save(&output).await?;
            println!("{} lines -> {} lines", program.len(), processed.len());
            Ok(())
        }
        Command::Print { file, filament, temperature, wave_bonding } => {
            if let Some(kind) = filament {
                config.filament.kind = kind;
            }
            if temperature.is_some() {
                config.filament.temperature = temperature;
            }
            config.preprocess.use_wave_bonding |= wave_bonding;
            let program = Program::load(&file).await?;
            log_slicer_profile(&program);
            let printer = connect(transport.as_ref(), &config).await?;
            print(&printer, program, preprocessor(&config)).await
        }
        Command::Info => {
            let printer = connect(transport.as_ref(), &config).await?;
            let identity = printer.identity();
            println!("Serial number:    {}", identity.identifier());
            println!("Color:            {}", identity.color);
            println!("Firmware version: {}", identity.firmware_version.as_deref().unwrap_or("unknown"));
            let calibration = printer.calibration().await;
            println!("Bed offsets:      {}", calibration.bed_level);
            println!("Backlash:         {}", calibration.backlash);
            let context = printer.acquire_context(ContextOptions::concurrent()).await?;
            match context.fetch_filament().await? {
                Some((kind, temperature)) => println!("Filament:         {} at {:.0}°C", kind, temperature),
                None => println!("Filament:         not set"),
            }
            drop(context);
            printer.disconnect().await;
            Ok(())
        }
        Command::Home => {
            let printer = connect(transport.as_ref(), &config).await?;
            let context = printer.acquire_context(ContextOptions::exclusive().without_compensation()).await?;
            context.execute(helpers::move_to_origin()).await?;
            context.wait_for_moves().await?;
            let position = context.fetch_position().await?;
            println!("Home at X {:.2} Y {:.2} Z {:.2}", position.x, position.y, position.z);
            drop(context);
            printer.disconnect().await;
            Ok(())
        }
        Command::ZeroBed => {
            let printer = connect(transport.as_ref(), &config).await?;
            let operation = ZeroBedOperation::new();
            let mut events = operation.subscribe();
            operation.start(&printer)?;
            while let Ok(event) = events.recv().await {
                match event {
                    ZeroBedEvent::Progress(message) => println!("{}", message),
                    ZeroBedEvent::Stopped { completed } => {
                        println!("{}", if completed { "Bed zero set" } else { "Stopped" });
                        break;
                    }
                    ZeroBedEvent::Failed(error) => return Err(error.into()),
                }
            }
            operation.ended().await;
            printer.disconnect().await;
            Ok(())
        }
        Command::RaiseHead { height } => {
            let printer = connect(transport.as_ref(), &config).await?;
            let operation = RaiseHeadOperation::new(height);
            let mut events = operation.subscribe();
            operation.start(&printer)?;
            while let Ok(event) = events.recv().await {
                match event {
                    RaiseHeadEvent::Started => println!("{}", operation.activity_description()),
                    RaiseHeadEvent::Stopped { did_raise } => {
                        println!("{}", if did_raise { "Raised" } else { "Already high enough" });
                        break;
                    }
                    RaiseHeadEvent::Failed => return Err("raising the head failed".into()),
                }
            }
            operation.ended().await;
            Ok(())
        }
        Command::Extrude { retract, temperature } => {
            let printer = connect(transport.as_ref(), &config).await?;
            let params = config.print_parameters();
            let settings = ExtrusionSettings {
                temperature: temperature.unwrap_or_else(|| params.target_temperature()),
                temperature_tolerance: params.temperature_tolerance,
                retract,
                ..ExtrusionSettings::default()
            };
            let operation = ExtrusionOperation::new(settings);
            let mut events = operation.subscribe();
            operation.start(&printer)?;
            println!("{}; press Enter to stop", operation.activity_description());
            let stopper = operation.clone();
            tokio::spawn(async move {
                let mut line = String::new();
                let _ = BufReader::new(tokio::io::stdin()).read_line(&mut line).await;
                stopper.stop();
            });
            while let Ok(event) = events.recv().await {
                match event {
                    ExtrusionEvent::Heating { target, current } => println!("Heating: {:.0}/{:.0}°C", current, target),
                    ExtrusionEvent::Extruding => println!("Extruding"),
                    ExtrusionEvent::Stopped { steps } => {
                        println!("Stopped after {} steps", steps);
                        break;
                    }
                    ExtrusionEvent::Failed(error) => return Err(error.into()),
                }
            }
            operation.ended().await;
            Ok(())
        }
        Command::Level { start_z, height_target, center } => {
            let printer = connect(transport.as_ref(), &config).await?;
            level(&printer, &config, start_z, height_target, center).await
        }
        Command::Console { convert_feed_rates } => {
            let printer = connect(transport.as_ref(), &config).await?;
            console(&printer, convert_feed_rates).await
        }
    }
}

fn read_config(path: &Path) -> Result<Config, BoxError> {
    if !path.exists() {
        tracing::info!("No configuration at {}, using defaults", path.display());
        return Ok(Config::default());
    }
    let path = path.to_string_lossy();
    tracing::info!("Loading configuration from: {}", path);
    config::load_config(&path).map_err(|e| {
        tracing::error!("Failed to load config from '{}': {}", path, e);
        Box::new(e) as BoxError
    })
}

fn log_slicer_profile(program: &Program) {
    if let Some(profile) = program.slicer_profile() {
        tracing::info!(
            "Sliced by {} ({} settings, layer height {})",
            profile.kind,
            profile.len(),
            profile.formatted_value(match profile.kind {
                SlicerKind::Cura => "Layer height",
                SlicerKind::Slic3r => "layer_height",
                SlicerKind::Simplify3D => "layerHeight",
            })
        );
    }
}

fn preprocessor(config: &Config) -> Preprocessor {
    Preprocessor::new(config.print_parameters()).with_wave_bonding(config.preprocess.wave_bonding())
}

async fn connect(transport: &dyn TransportProvider, config: &Config) -> Result<Printer, BoxError> {
    let stream = transport.open(&config.serial.port, config.serial.baud).await?;
    let printer = Printer::connect(stream, config).await?;
    Ok(printer)
}

async fn print(printer: &Printer, program: Program, preprocessor: Preprocessor) -> Result<(), BoxError> {
    let job = PrintJob::new(program, preprocessor);
    let mut events = job.subscribe();
    let (status, _projection) = StatusProjector::follow(&job);
    job.start(printer)?;

    let aborter = job.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            aborter.abort();
        }
    });

    while let Ok(event) = events.recv().await {
        match event {
            PrintJobEvent::StateChanged(state) => println!("State: {}", state),
            PrintJobEvent::HeatingProgress { target, current } => println!("Heating: {:.0}/{:.0}°C", current, target),
            PrintJobEvent::LayerChanged { index, z } => {
                let snapshot = status.borrow().clone();
                if let Some(snapshot) = snapshot {
                    let remaining = snapshot
                        .remaining
                        .map_or_else(|| "estimating".to_string(), |r| format!("{}s left", r.as_secs()));
                    println!("Layer {} (Z {:.2}): {:.1}%, {}", index, z, snapshot.progress * 100.0, remaining);
                }
            }
            PrintJobEvent::Completed { elapsed } => {
                println!("Completed in {}s", elapsed.as_secs());
                break;
            }
            PrintJobEvent::Aborted { elapsed } => {
                println!("Aborted after {}s", elapsed.as_secs());
                break;
            }
            PrintJobEvent::Failed { error } => return Err(error.into()),
            PrintJobEvent::Prepared(_) | PrintJobEvent::Executed { .. } => {}
        }
    }
    job.ended().await;
    Ok(())
}

async fn level(
    printer: &Printer,
    config: &Config,
    start_z: f64,
    height_target: f64,
    center: bool,
) -> Result<(), BoxError> {
    let settings = BedLevelSettings {
        step: config.printer.level_adjust_step,
        measure_center: center,
        ..BedLevelSettings::default()
    };
    let calibration = BedLevelCalibration::new(settings);
    let mut events = calibration.subscribe();
    calibration.start_at_level(printer, start_z, height_target)?;
    println!("Keys: u = up, d = down, c = continue, q = quit");

    let control = calibration.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let result = match line.trim() {
                "u" => control.adjust_up(),
                "d" => control.adjust_down(),
                "c" => control.continue_(),
                "q" => {
                    control.stop();
                    break;
                }
                _ => continue,
            };
            if let Err(e) = result {
                println!("{}", e);
            }
        }
    });

    while let Ok(event) = events.recv().await {
        match event {
            BedLevelEvent::Moving(corner) => println!("Moving to {}", corner),
            BedLevelEvent::AtCorner { corner, z } => {
                println!("At {} (Z {:.2}); lower until the nozzle touches", corner, z)
            }
            BedLevelEvent::Adjusted { z, .. } => println!("Z {:.2}", z),
            BedLevelEvent::Finished(offsets) => {
                println!("Stored offsets: {}", offsets);
                break;
            }
            BedLevelEvent::Cancelled => {
                println!("Cancelled");
                break;
            }
            BedLevelEvent::Failed(error) => return Err(error.into()),
        }
    }
    calibration.ended().await;
    Ok(())
}

async fn console(printer: &Printer, convert_feed_rates: bool) -> Result<(), BoxError> {
    let (codes, source) = mpsc::channel::<Instruction>(16);
    let sender = RepeatingCommandSender::console(source, convert_feed_rates);
    let mut events = sender.subscribe();
    sender.start(printer)?;

    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            match line.parse::<Instruction>() {
                Ok(code) => {
                    if codes.send(code).await.is_err() {
                        break;
                    }
                }
                Err(e) => println!("{}", e),
            }
        }
    });

    while let Ok(event) = events.recv().await {
        match event {
            RepeatingEvent::Sent { response, .. } => println!("{}", response),
            RepeatingEvent::Rejected { code, error } => println!("{}: {}", code, error),
            RepeatingEvent::Stopping => {}
            RepeatingEvent::Ended { sent } => {
                tracing::info!("Sent {} commands", sent);
                break;
            }
        }
    }
    sender.ended().await;
    printer.disconnect().await;
    Ok(())
}
