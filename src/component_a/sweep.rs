//! sweep.rs
//! Sector sweep and fusion tracker (acquisition context).
//!
//! The servo walks `[min_angle, max_angle]` in `step` degree increments. Every sample is
//! attributed to the sector containing its angle at sample time and lowers that sector's
//! running minimum. A sector completes when the next sample falls in a different sector, or
//! at either end of travel; its minimum is then published and the running minimum reset to
//! the sentinel, whether or not the publish got the lock.
//!
//! With the sweep disabled the servo holds the manual angle and every sample completes the
//! sector it falls in.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use log::{debug, info, warn};
use spin_sleep::{SpinSleeper, SpinStrategy};

use crate::component_a::sensor::{DistanceSensor, ScanServo, fuse};
use crate::component_a::sync_manager::{
    SENSOR_PRIMARY, SENSOR_SECONDARY, SectorReading, SharedState, SweepParams,
};
use crate::config::{NO_DETECTION_CM, NUM_CHANNELS, SweepConfig, SweepMode};
use crate::error::ConfigError;
use crate::utils::metrics::{
    DeadlineComponent, Event, EventRecorder, SharedMetrics, lock_metrics, push_capped, push_capped_u64,
};

/// Fixed contiguous partition of the sweep span, one sector per channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SectorMap {
    bounds: [(u8, u8); NUM_CHANNELS],
}

impl SectorMap {
    pub fn new(bounds: [(u8, u8); NUM_CHANNELS]) -> Result<Self, ConfigError> {
        for (index, &(start, end)) in bounds.iter().enumerate() {
            if start >= end {
                return Err(ConfigError::EmptySector { index });
            }
            if index + 1 < NUM_CHANNELS && end != bounds[index + 1].0 {
                return Err(ConfigError::SectorGap { index });
            }
        }
        Ok(Self { bounds })
    }

    pub fn from_config(cfg: &SweepConfig) -> Result<Self, ConfigError> {
        Self::new(cfg.sectors)
    }

    /// `start <= angle < end`; the last sector also owns its end angle.
    pub fn sector_of(&self, angle: u8) -> Option<usize> {
        let last = NUM_CHANNELS - 1;
        self.bounds.iter().enumerate().find_map(|(i, &(start, end))| {
            let inside = angle >= start && (angle < end || (i == last && angle == end));
            inside.then_some(i)
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

#[derive(Debug, Clone, Copy)]
struct RunningMin {
    reading: SectorReading,
    samples: u32,
}

impl RunningMin {
    const EMPTY: RunningMin = RunningMin {
        reading: SectorReading::NO_DETECTION,
        samples: 0,
    };

    fn update(&mut self, angle: u8, distance: f32) {
        if self.samples == 0 || distance < self.reading.distance_cm {
            self.reading = SectorReading { distance_cm: distance, angle };
        }
        self.samples += 1;
    }
}

/// Scan position and per-sector running minimums. No I/O, no clock.
#[derive(Debug, Clone)]
pub struct SweepTracker {
    map: SectorMap,
    running: [RunningMin; NUM_CHANNELS],
    current: Option<usize>,
    angle: u8,
    direction: Direction,
}

impl SweepTracker {
    pub fn new(map: SectorMap, start_angle: u8) -> Self {
        Self {
            map,
            running: [RunningMin::EMPTY; NUM_CHANNELS],
            current: None,
            angle: start_angle,
            direction: Direction::Up,
        }
    }

    pub fn map(&self) -> &SectorMap {
        &self.map
    }

    /// Angle of the next sample.
    pub fn angle(&self) -> u8 {
        self.angle
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Current running minimum of `index` (sentinel at the start of a pass).
    pub fn running_min(&self, index: usize) -> f32 {
        self.running[index].reading.distance_cm
    }

    fn complete(&mut self, index: usize, publish: &mut impl FnMut(usize, SectorReading)) {
        let reading = self.running[index].reading;
        self.running[index] = RunningMin::EMPTY;
        publish(index, reading);
    }

    /// True when the sample at `angle` is the last one before the servo turns or jumps.
    fn at_end_of_travel(&self, p: &SweepParams) -> bool {
        match self.direction {
            Direction::Up => self.angle >= p.max_angle,
            Direction::Down => self.angle <= p.min_angle,
        }
    }

    /// Records one fused sample taken at the current angle, completing sectors as needed,
    /// then advances to the next angle.
    pub fn observe(
        &mut self,
        distance: f32,
        p: &SweepParams,
        mut publish: impl FnMut(usize, SectorReading),
    ) {
        let angle = self.angle;
        if let Some(sector) = self.map.sector_of(angle) {
            if let Some(prev) = self.current
                && prev != sector
            {
                self.complete(prev, &mut publish);
            }
            self.running[sector].update(angle, distance);
            self.current = Some(sector);
        }

        if self.at_end_of_travel(p) {
            if let Some(sector) = self.current.take() {
                self.complete(sector, &mut publish);
            }
        }
        self.advance(p);
    }

    /// Manual mode: the sample at `angle` completes its sector immediately.
    /// Any partially accumulated pass is discarded.
    pub fn observe_manual(
        &mut self,
        angle: u8,
        distance: f32,
        mut publish: impl FnMut(usize, SectorReading),
    ) {
        if self.current.take().is_some() {
            self.running = [RunningMin::EMPTY; NUM_CHANNELS];
        }
        if let Some(sector) = self.map.sector_of(angle) {
            self.running[sector].update(angle, distance);
            self.complete(sector, &mut publish);
        }
    }

    fn advance(&mut self, p: &SweepParams) {
        let (min, max) = (p.min_angle.min(p.max_angle), p.max_angle.max(p.min_angle));
        let step = p.step.max(1);

        if p.mode == SweepMode::Forward {
            self.direction = Direction::Up;
        }
        // bounds may have moved under us
        if self.angle < min || self.angle > max {
            self.angle = self.angle.clamp(min, max);
            // samples from outside the new span must not leak into the next pass
            if let Some(sector) = self.current.take() {
                self.running[sector] = RunningMin::EMPTY;
            }
            return;
        }

        match (self.direction, p.mode) {
            (Direction::Up, _) if self.angle < max => {
                self.angle = self.angle.saturating_add(step).min(max);
            }
            (Direction::Up, SweepMode::Forward) => self.angle = min,
            (Direction::Up, SweepMode::Bidirectional) => {
                self.direction = Direction::Down;
                self.angle = self.angle.saturating_sub(step).max(min);
            }
            (Direction::Down, _) if self.angle > min => {
                self.angle = self.angle.saturating_sub(step).max(min);
            }
            (Direction::Down, _) => {
                self.direction = Direction::Up;
                self.angle = self.angle.saturating_add(step).min(max);
            }
        }
    }
}

/// Sensor reads and the bounded lock wait on top of the configured settle and reading delay.
const STEP_SLACK: Duration = Duration::from_millis(20);

/// How far a sweep step ran past settle + reading delay + slack, in µs.
fn step_overrun(elapsed: Duration, params: &SweepParams) -> Option<u64> {
    let budget = Duration::from_millis(params.settle_ms as u64 + params.reading_delay_ms as u64) + STEP_SLACK;
    elapsed.checked_sub(budget).filter(|late| !late.is_zero()).map(|late| late.as_micros() as u64)
}

/// Acquisition thread body: servo, sensors, tracker, publication.
pub struct SweepTask {
    tracker: SweepTracker,
    servo: Box<dyn ScanServo + Send>,
    primary: Box<dyn DistanceSensor + Send>,
    secondary: Option<Box<dyn DistanceSensor + Send>>,
    shared: Arc<SharedState>,
    metrics: SharedMetrics,
    event_recorder: Arc<EventRecorder>,
    running: Arc<AtomicBool>,
}

impl SweepTask {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        map: SectorMap,
        servo: Box<dyn ScanServo + Send>,
        primary: Box<dyn DistanceSensor + Send>,
        secondary: Option<Box<dyn DistanceSensor + Send>>,
        shared: Arc<SharedState>,
        metrics: SharedMetrics,
        event_recorder: Arc<EventRecorder>,
        running: Arc<AtomicBool>,
    ) -> Self {
        let start = shared.params.min_angle();
        Self {
            tracker: SweepTracker::new(map, start),
            servo,
            primary,
            secondary,
            shared,
            metrics,
            event_recorder,
            running,
        }
    }

    /// One fused sample at `angle`; also publishes the live reading.
    fn sample(&mut self, angle: u8) -> f32 {
        let primary = self.primary.read_cm(angle);
        let secondary = self.secondary.as_mut().and_then(|s| s.read_cm(angle));

        let mut flags = 0;
        if primary.is_some() {
            flags |= SENSOR_PRIMARY;
        }
        if secondary.is_some() {
            flags |= SENSOR_SECONDARY;
        }
        let fused = fuse(primary, secondary);
        self.shared.set_live_reading(fused, flags);
        fused
    }

    fn publish(
        shared: &SharedState,
        metrics: &SharedMetrics,
        recorder: &EventRecorder,
        index: usize,
        reading: SectorReading,
    ) {
        let ts_ns = recorder.now_ns();
        if shared.publish_sector(index, reading) {
            debug!(
                "[Sweep] sector {} min {:.1} cm @ {}°",
                index, reading.distance_cm, reading.angle
            );
            recorder.record(Event::SectorPublished {
                ts_ns,
                sector: index,
                distance_cm: reading.distance_cm,
                angle: reading.angle,
            });
            let mut m = lock_metrics(metrics);
            m.sectors_published += 1;
            push_capped(&mut m.sector_distance[index], reading.distance_cm as f64);
        } else {
            recorder.record(Event::LockTimeout { ts_ns, sector: index });
        }
    }

    /// Runs until `running` is cleared.
    pub fn run(&mut self) {
        let sleeper = SpinSleeper::new(100_000).with_spin_strategy(SpinStrategy::YieldThread);
        info!("[Sweep] started at {}°", self.tracker.angle());

        let mut was_enabled = true;
        while self.running.load(Ordering::Acquire) {
            let step_start = Instant::now();
            let params = self.shared.params.snapshot();

            if params.enabled != was_enabled {
                info!("[Sweep] {}", if params.enabled { "enabled" } else { "manual mode" });
                was_enabled = params.enabled;
            }

            let angle = if params.enabled { self.tracker.angle() } else { params.manual_angle };
            self.servo.move_to(angle);
            self.shared.set_scan_angle(self.servo.angle());
            sleeper.sleep(Duration::from_millis(params.settle_ms as u64));

            let distance = self.sample(angle);
            if distance >= NO_DETECTION_CM {
                debug!("[Sweep] no detection at {}°", angle);
            }

            let (shared, metrics, recorder) = (&self.shared, &self.metrics, &self.event_recorder);
            let mut publish = |index, reading| Self::publish(shared, metrics, recorder, index, reading);
            if params.enabled {
                self.tracker.observe(distance, &params, &mut publish);
            } else {
                self.tracker.observe_manual(angle, distance, &mut publish);
            }

            sleeper.sleep(Duration::from_millis(params.reading_delay_ms as u64));

            let elapsed = step_start.elapsed();
            let overrun = step_overrun(elapsed, &params);
            if let Some(late_us) = overrun {
                warn!("[Sweep] step at {}° overran by {} µs", angle, late_us);
                self.event_recorder.record(Event::DeadlineMiss {
                    ts_ns: self.event_recorder.now_ns(),
                    component: DeadlineComponent::Acquisition,
                    late_us,
                });
            }
            let mut m = lock_metrics(&self.metrics);
            m.sweep_steps += 1;
            push_capped_u64(&mut m.sweep_step_us, elapsed.as_micros() as u64);
            if overrun.is_some() {
                m.record_deadline_miss(DeadlineComponent::Acquisition);
            }
        }

        info!("[Sweep] stopped.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SECTORS;

    fn params(mode: SweepMode) -> SweepParams {
        SweepParams {
            enabled: true,
            min_angle: 5,
            max_angle: 175,
            step: 5,
            settle_ms: 0,
            reading_delay_ms: 0,
            manual_angle: 90,
            mode,
        }
    }

    fn map() -> SectorMap {
        SectorMap::new(SECTORS).unwrap()
    }

    /// Drives one sample per step with distances from `field`, collecting completions.
    fn run_steps(
        tracker: &mut SweepTracker,
        p: &SweepParams,
        steps: usize,
        field: impl Fn(u8) -> f32,
    ) -> Vec<(usize, SectorReading)> {
        let mut out = Vec::new();
        for _ in 0..steps {
            let d = field(tracker.angle());
            tracker.observe(d, p, |i, r| out.push((i, r)));
        }
        out
    }

    #[test]
    fn sector_lookup_half_open() {
        let m = map();
        assert_eq!(m.sector_of(5), Some(0));
        assert_eq!(m.sector_of(44), Some(0));
        assert_eq!(m.sector_of(45), Some(1));
        assert_eq!(m.sector_of(134), Some(2));
        assert_eq!(m.sector_of(175), Some(3));
        assert_eq!(m.sector_of(4), None);
        assert_eq!(m.sector_of(176), None);
    }

    #[test]
    fn sector_map_rejects_gaps() {
        let mut b = SECTORS;
        b[2] = (95, 135);
        assert_eq!(SectorMap::new(b), Err(ConfigError::SectorGap { index: 1 }));
    }

    #[test]
    fn forward_pass_publishes_every_sector_in_order() {
        let p = params(SweepMode::Forward);
        let mut t = SweepTracker::new(map(), 5);
        // 5..=175 step 5 → 35 samples
        let done = run_steps(&mut t, &p, 35, |a| if a == 60 { 120.0 } else { 400.0 });
        let order: Vec<usize> = done.iter().map(|(i, _)| *i).collect();
        assert_eq!(order, vec![0, 1, 2, 3]);
        assert_eq!(done[1].1, SectorReading { distance_cm: 120.0, angle: 60 });
        assert_eq!(t.angle(), 5);
        assert_eq!(t.direction(), Direction::Up);
    }

    #[test]
    fn bidirectional_reverses_at_each_end() {
        let p = params(SweepMode::Bidirectional);
        let mut t = SweepTracker::new(map(), 5);
        let up = run_steps(&mut t, &p, 35, |_| 150.0);
        assert_eq!(up.last().map(|(i, _)| *i), Some(3));
        assert_eq!(t.direction(), Direction::Down);
        assert_eq!(t.angle(), 170);

        let down = run_steps(&mut t, &p, 34, |_| 150.0);
        let order: Vec<usize> = down.iter().map(|(i, _)| *i).collect();
        assert_eq!(order, vec![3, 2, 1, 0]);
        assert_eq!(t.direction(), Direction::Up);
    }

    #[test]
    fn pass_without_detection_publishes_sentinel() {
        let p = params(SweepMode::Forward);
        let mut t = SweepTracker::new(map(), 5);
        let done = run_steps(&mut t, &p, 35, |_| NO_DETECTION_CM);
        assert_eq!(done.len(), NUM_CHANNELS);
        assert!(done.iter().all(|(_, r)| r.distance_cm == NO_DETECTION_CM));
    }

    #[test]
    fn running_minimum_resets_between_passes() {
        let p = params(SweepMode::Forward);
        let mut t = SweepTracker::new(map(), 5);
        run_steps(&mut t, &p, 35, |a| if a < 45 { 70.0 } else { 300.0 });
        assert_eq!(t.running_min(0), NO_DETECTION_CM);
        let second = run_steps(&mut t, &p, 35, |_| 250.0);
        assert_eq!(second[0].1.distance_cm, 250.0);
    }

    #[test]
    fn straddling_step_attributed_by_sample_angle() {
        let mut p = params(SweepMode::Forward);
        p.step = 20;
        let mut t = SweepTracker::new(map(), 5);
        // 5, 25 in sector 0; 45 in sector 1 → completes 0 with samples 5 and 25 only
        let done = run_steps(&mut t, &p, 3, |a| a as f32 + 100.0);
        assert_eq!(done, vec![(0, SectorReading { distance_cm: 105.0, angle: 5 })]);
    }

    #[test]
    fn manual_mode_completes_on_every_sample() {
        let mut t = SweepTracker::new(map(), 5);
        let mut out = Vec::new();
        t.observe_manual(90, 85.0, |i, r| out.push((i, r)));
        t.observe_manual(90, 95.0, |i, r| out.push((i, r)));
        assert_eq!(
            out,
            vec![
                (2, SectorReading { distance_cm: 85.0, angle: 90 }),
                (2, SectorReading { distance_cm: 95.0, angle: 90 }),
            ]
        );
    }

    #[test]
    fn narrowed_span_clamps_position() {
        let mut p = params(SweepMode::Bidirectional);
        let mut t = SweepTracker::new(map(), 150);
        p.min_angle = 20;
        p.max_angle = 100;
        t.observe(200.0, &p, |_, _| {});
        assert_eq!(t.angle(), 100);
    }

    #[test]
    fn raised_min_drops_the_open_sector() {
        let mut p = params(SweepMode::Forward);
        let mut t = SweepTracker::new(map(), 5);
        let mut out = Vec::new();
        t.observe(60.0, &p, |i, r| out.push((i, r)));
        t.observe(60.0, &p, |i, r| out.push((i, r)));
        assert_eq!(t.angle(), 15);

        p.min_angle = 20;
        t.observe(300.0, &p, |i, r| out.push((i, r)));
        assert_eq!(t.angle(), 20);
        assert_eq!(t.running_min(0), NO_DETECTION_CM);

        // 20..=40 in sector 0, then 45 completes it
        for _ in 0..6 {
            t.observe(300.0, &p, |i, r| out.push((i, r)));
        }
        assert_eq!(out, vec![(0, SectorReading { distance_cm: 300.0, angle: 20 })]);
    }

    #[test]
    fn step_budget_covers_settle_delay_and_slack() {
        let mut p = params(SweepMode::Forward);
        p.settle_ms = 5;
        p.reading_delay_ms = 5;
        assert_eq!(step_overrun(Duration::from_millis(30), &p), None);
        assert_eq!(step_overrun(Duration::from_millis(31), &p), Some(1_000));
    }

    struct SlowSensor;

    impl DistanceSensor for SlowSensor {
        fn read_cm(&mut self, _angle: u8) -> Option<f32> {
            std::thread::sleep(Duration::from_millis(40));
            Some(120.0)
        }
    }

    #[test]
    fn slow_sensor_counts_acquisition_misses() {
        let mut cfg = SweepConfig::default();
        cfg.settle_ms = 1;
        cfg.reading_delay_ms = 1;
        let shared = Arc::new(SharedState::new(&cfg));
        let metrics = SharedMetrics::default();
        let recorder = Arc::new(EventRecorder::new());
        let running = Arc::new(AtomicBool::new(true));
        let mut task = SweepTask::new(
            map(),
            Box::new(crate::component_a::sensor::SimulatedServo::new(cfg.min_angle)),
            Box::new(SlowSensor),
            None,
            shared,
            metrics.clone(),
            recorder.clone(),
            running.clone(),
        );

        let handle = std::thread::spawn(move || task.run());
        std::thread::sleep(Duration::from_millis(200));
        running.store(false, Ordering::Release);
        handle.join().unwrap();

        let m = lock_metrics(&metrics);
        assert!(m.miss_acquisition >= 1);
        assert_eq!(m.miss_acquisition, m.sweep_steps);
        assert!(recorder.drain().iter().any(|(_, e)| matches!(
            e,
            Event::DeadlineMiss { component: DeadlineComponent::Acquisition, .. }
        )));
    }
}
