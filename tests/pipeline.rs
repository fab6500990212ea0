// End-to-end checks across both contexts: sweep -> shared state -> control -> telemetry.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use rts_pad_control::{
    command::CommandHandler,
    component_a::{
        sensor::{DistanceSensor, SimulatedServo},
        sweep::{SectorMap, SweepTask, SweepTracker},
        sync_manager::{SectorReading, SharedState},
        telemetry::{TelemetryFrame, decode},
    },
    component_b::{
        controller::MotorCommand,
        control_loop::ControlLoop,
        hardware::{PadModel, SimulatedPads, SimulatedPot},
        safety::SafetyState,
        setpoint::RangeClassification,
    },
    config::{NO_DETECTION_CM, SweepConfig, SystemConfig},
    utils::metrics::{EventRecorder, SharedMetrics, lock_metrics},
};

/// NEAR object in sector 0, MID in 1, FAR in 2, nothing in 3.
fn world(angle: u8) -> Option<f32> {
    match angle {
        0..45 => Some(80.0),
        45..90 => Some(150.0),
        90..135 => Some(250.0),
        _ => None,
    }
}

struct WorldSensor;

impl DistanceSensor for WorldSensor {
    fn read_cm(&mut self, angle: u8) -> Option<f32> {
        world(angle)
    }
}

fn control_loop(cfg: &SystemConfig, shared: Arc<SharedState>) -> ControlLoop {
    ControlLoop::new(
        cfg,
        Box::new(SimulatedPads::new(PadModel::default(), cfg.control.dt(), 7)),
        // full force scale, neutral distance scale
        Box::new(SimulatedPot::new(3300.0, 0.0, 1)),
        Box::new(SimulatedPot::new(1650.0, 0.0, 2)),
        shared,
        SharedMetrics::default(),
        Arc::new(EventRecorder::new()),
        Arc::new(AtomicBool::new(true)),
    )
}

fn sweep_one_pass(tracker: &mut SweepTracker, shared: &SharedState) {
    let params = shared.params.snapshot();
    loop {
        let angle = tracker.angle();
        let distance = world(angle).unwrap_or(NO_DETECTION_CM);
        tracker.observe(distance, &params, |i, r| {
            shared.publish_sector(i, r);
        });
        if angle >= params.max_angle {
            break;
        }
    }
}

#[test]
fn sweep_pass_drives_control_and_telemetry() {
    let cfg = SystemConfig::default();
    let shared = Arc::new(SharedState::new(&cfg.sweep));
    let map = SectorMap::from_config(&cfg.sweep).unwrap();
    let mut tracker = SweepTracker::new(map, cfg.sweep.min_angle);

    sweep_one_pass(&mut tracker, &shared);
    let distances: Vec<f32> = (0..4).map(|i| shared.sector(i).distance_cm).collect();
    assert_eq!(distances, vec![80.0, 150.0, 250.0, NO_DETECTION_CM]);

    let mut cl = control_loop(&cfg, shared.clone());
    let summary = cl.step(Instant::now());
    assert_eq!(
        summary.ranges,
        [
            RangeClassification::Near,
            RangeClassification::Mid,
            RangeClassification::Far,
            RangeClassification::Invalid
        ]
    );
    assert_eq!(summary.states[0], SafetyState::Normal);
    assert_eq!(summary.states[3], SafetyState::Deflating);
    assert!(matches!(summary.commands[0], MotorCommand::Forward(_)));
    // baseline + offset sits inside the deadband
    assert_eq!(summary.commands[2], MotorCommand::Brake);

    let frame = TelemetryFrame::snapshot(&shared, true);
    assert_eq!(frame.setpoints[0], 2000.0);
    assert_eq!(frame.setpoints[1], 1000.0);
    assert_eq!(frame.setpoints[3], -1.0);
    assert_eq!(frame.distances, [80.0, 150.0, 250.0, NO_DETECTION_CM]);

    let decoded = decode(&frame.encode()).unwrap();
    assert_eq!(decoded, frame);
    assert_eq!(decoded.extended.unwrap().thresholds, [100.0, 200.0, 300.0]);
}

#[test]
fn lost_target_deflates_then_recovers_from_next_pass() {
    let cfg = SystemConfig::default();
    let shared = Arc::new(SharedState::new(&cfg.sweep));
    shared.publish_sector(0, SectorReading { distance_cm: 80.0, angle: 25 });
    let mut cl = control_loop(&cfg, shared.clone());

    let mut t = Instant::now();
    for _ in 0..150 {
        cl.step(t);
        t += Duration::from_millis(20);
    }
    assert_eq!(cl.channel(0).state(), SafetyState::Normal);
    assert!(cl.channel(0).pressure > 1000.0);

    shared.publish_sector(0, SectorReading::NO_DETECTION);
    let summary = cl.step(t);
    assert_eq!(summary.states[0], SafetyState::Deflating);
    assert_eq!(summary.commands[0], MotorCommand::Reverse(60.0));
    assert!(shared.duty(0) < 0.0);

    shared.publish_sector(0, SectorReading { distance_cm: 150.0, angle: 30 });
    t += Duration::from_millis(20);
    let summary = cl.step(t);
    assert_eq!(summary.states[0], SafetyState::Normal);
    assert_eq!(shared.setpoint(0), 1000.0);
}

#[test]
fn held_sector_lock_never_stalls_control_or_telemetry() {
    let cfg = SystemConfig::default();
    let shared = Arc::new(SharedState::new(&cfg.sweep));
    shared.publish_sector(1, SectorReading { distance_cm: 120.0, angle: 60 });
    let mut cl = control_loop(&cfg, shared.clone());

    let holder = {
        let shared = shared.clone();
        thread::spawn(move || shared.hold_sector_lock(Duration::from_millis(150)))
    };
    thread::sleep(Duration::from_millis(20));

    let started = Instant::now();
    let summary = cl.step(Instant::now());
    assert!(started.elapsed() < Duration::from_millis(100));
    assert_eq!(summary.ranges[1], RangeClassification::Mid);

    let started = Instant::now();
    let frame = TelemetryFrame::snapshot(&shared, false);
    assert!(started.elapsed() < Duration::from_millis(5));
    assert_eq!(frame.distances[1], 120.0);

    assert!(!shared.publish_sector(2, SectorReading { distance_cm: 90.0, angle: 100 }));
    holder.join().unwrap();

    assert!(shared.lock_timeouts() >= 2);
    assert_eq!(shared.skipped_publishes(), 1);
    assert_eq!(shared.sector(2).distance_cm, NO_DETECTION_CM);
}

#[test]
fn commands_reshape_the_sweep() {
    let cfg = SweepConfig::default();
    let shared = Arc::new(SharedState::new(&cfg));
    let handler = CommandHandler::new(shared.clone(), cfg.sector_span(), Arc::new(EventRecorder::new()));

    assert_eq!(handler.handle("sweep:min:45").as_deref(), Some("ACK:SWEEP:MIN:45"));
    assert_eq!(handler.handle("SWEEP:MAX:90").as_deref(), Some("ACK:SWEEP:MAX:90"));
    assert_eq!(handler.handle("SWEEP:MODE:FORWARD").as_deref(), Some("ACK:SWEEP:MODE:FORWARD"));
    assert_eq!(
        handler.handle("SWEEP:STATUS").as_deref(),
        Some("ACK:SWEEP:STATUS:ENABLED:45:90:5:FORWARD:5:5")
    );
    assert!(handler.handle("SWEEP:MIN:200").unwrap().starts_with("ERR:OUT_OF_RANGE"));

    let mut tracker = SweepTracker::new(SectorMap::from_config(&cfg).unwrap(), 45);
    let params = shared.params.snapshot();
    let mut published = Vec::new();
    for _ in 0..20 {
        let angle = tracker.angle();
        assert!((45..=90).contains(&angle));
        tracker.observe(world(angle).unwrap_or(NO_DETECTION_CM), &params, |i, r| published.push((i, r)));
    }
    // only sectors 1 and 2 are ever touched
    assert!(published.iter().all(|(i, _)| *i == 1 || *i == 2));
    assert!(published.iter().any(|(i, r)| *i == 1 && r.distance_cm == 150.0));
}

#[test]
fn manual_mode_publishes_every_sample() {
    let cfg = SweepConfig::default();
    let shared = Arc::new(SharedState::new(&cfg));
    let handler = CommandHandler::new(shared.clone(), cfg.sector_span(), Arc::new(EventRecorder::new()));

    assert!(handler.handle("SERVO:ANGLE:30").unwrap().starts_with("ERR:"));
    assert_eq!(handler.handle("SWEEP:DISABLE").as_deref(), Some("ACK:SWEEP:DISABLED"));
    assert_eq!(handler.handle("SERVO:ANGLE:100").as_deref(), Some("ACK:SERVO:ANGLE:100"));

    let mut tracker = SweepTracker::new(SectorMap::from_config(&cfg).unwrap(), cfg.min_angle);
    let angle = shared.params.manual_angle();
    let mut published = Vec::new();
    for _ in 0..3 {
        tracker.observe_manual(angle, 250.0, |i, r| published.push((i, r)));
    }
    assert_eq!(published.len(), 3);
    assert!(published.iter().all(|(i, r)| *i == 2 && r.angle == 100));
}

#[test]
fn threaded_sweep_publishes_sectors() {
    let mut cfg = SweepConfig::default();
    cfg.settle_ms = 1;
    cfg.reading_delay_ms = 1;
    cfg.secondary_sensor = false;
    let shared = Arc::new(SharedState::new(&cfg));
    let metrics = SharedMetrics::default();
    let running = Arc::new(AtomicBool::new(true));

    let mut task = SweepTask::new(
        SectorMap::from_config(&cfg).unwrap(),
        Box::new(SimulatedServo::new(cfg.min_angle)),
        Box::new(WorldSensor),
        None,
        shared.clone(),
        metrics.clone(),
        Arc::new(EventRecorder::new()),
        running.clone(),
    );
    let handle = thread::spawn(move || task.run());
    thread::sleep(Duration::from_millis(400));
    running.store(false, Ordering::Release);
    handle.join().unwrap();

    assert!(lock_metrics(&metrics).sectors_published >= 4);
    assert_eq!(shared.sector(0).distance_cm, 80.0);
    assert_eq!(shared.sector(1).distance_cm, 150.0);
}
