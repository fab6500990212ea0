//! # Pressure-Pad Controller Host Harness
//! Runs both execution contexts against simulated hardware so the sweep, the control loops and
//! the telemetry stream can be exercised on a workstation.
//!
//! ## Threads
//! - **Acquisition (core 0, high):** servo sweep, ToF + ultrasonic fusion, sector publication.
//! - **Telemetry (core 0, Min):** one frame per period into a bounded sink (64).
//! - **Control (core 1, Max):** per-channel setpoint, safety machine and PI at 50 Hz.
//! - **Frame logger:** validates every frame (header, CRC) and logs it.
//! - **Stdin reader:** one per process; lines go to the menu between runs and to the command
//!   handler while a run is live.
//!
//! ## Outputs
//! - `data/events.csv`: sector publishes, lock timeouts, transitions, deadline misses.
//! - `data/frames.csv`: decoded telemetry frames.
//! - `data/summary.csv`: run metrics.

use std::{
    fs::create_dir_all,
    io::{BufRead, Write, stdin, stdout},
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use crossbeam::channel::{Receiver, bounded, unbounded};
use log::{error, info, warn};
use thread_priority::{ThreadBuilderExt, ThreadPriority, ThreadPriorityValue};

use rts_pad_control::{
    command::CommandHandler,
    component_a::{
        sensor::{DistanceSensor, ObstacleField, SimulatedServo, SimulatedTof, SimulatedUltrasonic},
        sweep::{SectorMap, SweepTask},
        sync_manager::SharedState,
        transmitter::{TelemetryTask, Transmitter},
    },
    component_b::{
        control_loop::ControlLoop,
        hardware::{PadModel, SimulatedPads, SimulatedPot},
    },
    config::{SweepMode, SystemConfig},
    utils::{
        export::{export_summary_csv, spawn_frame_logger},
        metrics::{EventRecorder, SharedMetrics},
    },
};

const DEFAULT_RUN_SECS: u64 = 20;
const ACQUISITION_CORE: usize = 0;
const CONTROL_CORE: usize = 1;
const DATA_DIR: &str = "data";
/// Below control (Max), above telemetry (Min).
const ACQUISITION_PRIORITY: u8 = 80;

fn main() {
    env_logger::init();
    info!("=== PAD CONTROLLER START ===");
    let mut input = Input::spawn();

    loop {
        let choice = prompt_menu(&mut input);
        let cfg = match choice.as_str() {
            "1" | "" => build_config(SweepMode::Bidirectional, true),
            "2" => build_config(SweepMode::Forward, true),
            "3" => build_config(SweepMode::Bidirectional, false),
            "4" => {
                println!("Exiting. Goodbye!");
                info!("=== PAD CONTROLLER FINISHED ===");
                return;
            }
            other => {
                println!("Unrecognized option '{}', please try again.", other);
                continue;
            }
        };
        let duration = prompt_duration(&mut input);
        run_session(cfg, duration, &mut input);
        println!("\n Run completed. Returning to menu...\n");
    }
}

/// Stdin lines, read by a single thread for the whole process.
struct Input {
    lines: Receiver<String>,
    /// Line the last session received after it stopped.
    pending: Option<String>,
}

impl Input {
    fn spawn() -> Self {
        let (tx, lines) = unbounded();
        thread::spawn(move || {
            for line in stdin().lock().lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        });
        Self { lines, pending: None }
    }

    /// Next line, empty on EOF.
    fn read_line(&mut self) -> String {
        self.pending
            .take()
            .or_else(|| self.lines.recv().ok())
            .unwrap_or_default()
            .trim()
            .to_string()
    }
}

fn prompt_menu(input: &mut Input) -> String {
    println!("\n┌─────────────────────────────────────────────┐");
    println!("│     SELECT RUN MODE                         │");
    println!("├─────────────────────────────────────────────┤");
    println!("│  1) Bidirectional sweep, ToF + ultrasonic   │");
    println!("│  2) Forward sweep, ToF + ultrasonic         │");
    println!("│  3) Bidirectional sweep, ToF only           │");
    println!("│  4) Exit                                    │");
    println!("└─────────────────────────────────────────────┘");
    print!("Select [1/2/3/4] (default: 1): ");
    let _ = stdout().flush();
    input.read_line()
}

fn prompt_duration(input: &mut Input) -> Duration {
    print!("Run duration in seconds [default: {}]: ", DEFAULT_RUN_SECS);
    let _ = stdout().flush();
    Duration::from_secs(input.read_line().parse::<u64>().unwrap_or(DEFAULT_RUN_SECS))
}

fn build_config(mode: SweepMode, secondary_sensor: bool) -> SystemConfig {
    let mut cfg = SystemConfig::default();
    cfg.sweep.mode = mode;
    cfg.sweep.secondary_sensor = secondary_sensor;
    cfg
}

/// Pins the calling thread; failures are logged and the thread keeps running unpinned.
fn pin_to_core(core: usize, name: &str) {
    let core_ids = core_affinity::get_core_ids().unwrap_or_default();
    match core_ids.get(core) {
        Some(id) if core_affinity::set_for_current(*id) => info!("{} pinned to core {}", name, core),
        Some(_) => error!("Failed to pin {} to core {}", name, core),
        None => warn!("Core {} not available, {} left unpinned", core, name),
    }
}

fn run_session(cfg: SystemConfig, duration: Duration, input: &mut Input) {
    if let Err(e) = cfg.validate() {
        error!("Invalid configuration: {}", e);
        return;
    }
    let map = match SectorMap::from_config(&cfg.sweep) {
        Ok(map) => map,
        Err(e) => {
            error!("Invalid sector map: {}", e);
            return;
        }
    };
    if let Err(e) = create_dir_all(DATA_DIR) {
        error!("Failed to create data directory {}: {}", DATA_DIR, e);
        return;
    }

    info!(
        "[Session] mode={} secondary={} duration={:?}",
        cfg.sweep.mode.name(),
        cfg.sweep.secondary_sensor,
        duration
    );

    let running = Arc::new(AtomicBool::new(true));
    let shared = Arc::new(SharedState::new(&cfg.sweep));
    let metrics = SharedMetrics::default();
    let event_recorder = Arc::new(EventRecorder::new());
    let exporter = event_recorder.start_exporter(format!("{}/events.csv", DATA_DIR), running.clone());

    let (frame_tx, frame_rx) = bounded::<Vec<u8>>(cfg.telemetry.sink_capacity);
    let frame_logger = spawn_frame_logger(frame_rx, Path::new(DATA_DIR).join("frames.csv"), running.clone());

    let acquisition = {
        let field = Arc::new(ObstacleField::demo());
        let servo = SimulatedServo::new(cfg.sweep.min_angle);
        let primary = SimulatedTof::new(field.clone(), 11).with_faults(1.5, 0.02, 0.01);
        let secondary: Option<Box<dyn DistanceSensor + Send>> = if cfg.sweep.secondary_sensor {
            Some(Box::new(SimulatedUltrasonic::new(field, 12)))
        } else {
            None
        };
        let mut task = SweepTask::new(
            map,
            Box::new(servo),
            Box::new(primary),
            secondary,
            shared.clone(),
            metrics.clone(),
            event_recorder.clone(),
            running.clone(),
        );
        let priority = ThreadPriorityValue::try_from(ACQUISITION_PRIORITY)
            .map(ThreadPriority::Crossplatform)
            .unwrap_or(ThreadPriority::Max);
        thread::Builder::new()
            .name("acquisition".into())
            .spawn_with_priority(priority, move |_| {
                pin_to_core(ACQUISITION_CORE, "acquisition");
                task.run();
            })
    };

    let telemetry = {
        let transmitter = Transmitter::new(frame_tx, shared.clone(), event_recorder.clone());
        let task = TelemetryTask::new(
            transmitter,
            cfg.telemetry.period,
            cfg.telemetry.extended,
            metrics.clone(),
            running.clone(),
        );
        thread::Builder::new()
            .name("telemetry".into())
            .spawn_with_priority(ThreadPriority::Min, move |_| {
                pin_to_core(ACQUISITION_CORE, "telemetry");
                task.run();
            })
    };

    let control = {
        let pads = SimulatedPads::new(PadModel::default(), cfg.control.dt(), 21);
        let mut control_loop = ControlLoop::new(
            &cfg,
            Box::new(pads),
            Box::new(SimulatedPot::at_fraction(0.75, 22)),
            Box::new(SimulatedPot::at_fraction(0.5, 23)),
            shared.clone(),
            metrics.clone(),
            event_recorder.clone(),
            running.clone(),
        );
        thread::Builder::new()
            .name("control".into())
            .spawn_with_priority(ThreadPriority::Max, move |_| {
                pin_to_core(CONTROL_CORE, "control");
                control_loop.run();
            })
    };

    let handler = CommandHandler::new(shared.clone(), cfg.sweep.sector_span(), event_recorder.clone());
    let commands = {
        let lines = input.lines.clone();
        let running = running.clone();
        println!("Commands accepted while running (e.g. SWEEP:STATUS, SWEEP:MODE:FORWARD).");
        thread::spawn(move || handler.serve(&lines, &running, |response| println!("{}", response)))
    };

    info!("[Main] Running for {:?}...", duration);
    thread::sleep(duration);
    running.store(false, Ordering::Release);
    info!("[Main] Time's up, shutting down...");

    match commands.join() {
        Ok(leftover) => input.pending = leftover,
        Err(_) => error!("Command handler panicked"),
    }

    for (name, handle) in [("acquisition", acquisition), ("telemetry", telemetry), ("control", control)] {
        match handle {
            Ok(h) => {
                if h.join().is_err() {
                    error!("{} thread panicked", name);
                }
            }
            Err(e) => error!("Failed to spawn {} thread: {}", name, e),
        }
    }

    match frame_logger.join() {
        Ok(stats) => info!("[Main] frames logged={} rejected={}", stats.accepted, stats.rejected),
        Err(_) => error!("Frame logger panicked"),
    }
    if exporter.join().is_err() {
        error!("Event exporter panicked");
    }
    if event_recorder.dropped() > 0 {
        warn!("[Main] {} events dropped at the recorder", event_recorder.dropped());
    }

    if let Err(e) = export_summary_csv(&metrics, &shared, Path::new(DATA_DIR)) {
        error!("Summary export failed: {}", e);
    }
    info!("[Session] complete");
}
