//! sync_manager.rs
//! Shared state between the acquisition context and the control context.
//!
//! Two disciplines, never mixed:
//! - Sector readings: `parking_lot::Mutex` taken with a bounded `try_lock_for` (10 ms) from
//!   either side. A packed lock-free mirror of every published reading lets a reader that
//!   times out fall back to the last known value instead of waiting.
//! - Everything else: single-writer / single-reader atomics (Release store, Acquire load).
//!   Control writes pressures, duties, setpoints, scales and thresholds; acquisition writes the
//!   scan angle, live reading and sensor flags; the command handler writes `RuntimeParams`.
//!
//! Accessors are the only touchpoint. Nothing here ever blocks longer than the lock timeout.

use std::{
    sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering},
    time::{Duration, Instant},
};

use log::warn;
use parking_lot::Mutex;
use portable_atomic::AtomicF32;

use crate::config::{NO_DETECTION_CM, NUM_CHANNELS, SweepConfig, SweepMode};

/// Minimum distance of the last completed pass over one sector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SectorReading {
    pub distance_cm: f32,
    pub angle: u8,
}

impl SectorReading {
    pub const NO_DETECTION: SectorReading = SectorReading {
        distance_cm: NO_DETECTION_CM,
        angle: 0,
    };

    // distance bits in the high word, angle in the low byte
    fn pack(self) -> u64 {
        ((self.distance_cm.to_bits() as u64) << 32) | self.angle as u64
    }

    fn unpack(raw: u64) -> Self {
        Self {
            distance_cm: f32::from_bits((raw >> 32) as u32),
            angle: (raw & 0xFF) as u8,
        }
    }
}

impl Default for SectorReading {
    fn default() -> Self {
        Self::NO_DETECTION
    }
}

/// Bit flags of the sensors that produced the last sample.
pub const SENSOR_PRIMARY: u8 = 0b01;
pub const SENSOR_SECONDARY: u8 = 0b10;

/// Sweep parameters the command handler may change while running.
pub struct RuntimeParams {
    sweep_enabled: AtomicBool,
    min_angle: AtomicU8,
    max_angle: AtomicU8,
    step: AtomicU8,
    settle_ms: AtomicU32,
    reading_delay_ms: AtomicU32,
    manual_angle: AtomicU8,
    mode: AtomicU8,
}

/// Consistent-enough copy of `RuntimeParams` taken once per sweep step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SweepParams {
    pub enabled: bool,
    pub min_angle: u8,
    pub max_angle: u8,
    pub step: u8,
    pub settle_ms: u32,
    pub reading_delay_ms: u32,
    pub manual_angle: u8,
    pub mode: SweepMode,
}

impl RuntimeParams {
    pub fn from_config(cfg: &SweepConfig) -> Self {
        Self {
            sweep_enabled: AtomicBool::new(cfg.enabled),
            min_angle: AtomicU8::new(cfg.min_angle),
            max_angle: AtomicU8::new(cfg.max_angle),
            step: AtomicU8::new(cfg.step),
            settle_ms: AtomicU32::new(cfg.settle_ms),
            reading_delay_ms: AtomicU32::new(cfg.reading_delay_ms),
            manual_angle: AtomicU8::new(cfg.manual_angle),
            mode: AtomicU8::new(cfg.mode.as_u8()),
        }
    }

    pub fn snapshot(&self) -> SweepParams {
        SweepParams {
            enabled: self.sweep_enabled(),
            min_angle: self.min_angle(),
            max_angle: self.max_angle(),
            step: self.step(),
            settle_ms: self.settle_ms(),
            reading_delay_ms: self.reading_delay_ms(),
            manual_angle: self.manual_angle(),
            mode: self.mode(),
        }
    }

    pub fn sweep_enabled(&self) -> bool {
        self.sweep_enabled.load(Ordering::Acquire)
    }
    pub fn set_sweep_enabled(&self, on: bool) {
        self.sweep_enabled.store(on, Ordering::Release);
    }

    pub fn min_angle(&self) -> u8 {
        self.min_angle.load(Ordering::Acquire)
    }
    pub fn set_min_angle(&self, deg: u8) {
        self.min_angle.store(deg, Ordering::Release);
    }

    pub fn max_angle(&self) -> u8 {
        self.max_angle.load(Ordering::Acquire)
    }
    pub fn set_max_angle(&self, deg: u8) {
        self.max_angle.store(deg, Ordering::Release);
    }

    pub fn step(&self) -> u8 {
        self.step.load(Ordering::Acquire)
    }
    pub fn set_step(&self, deg: u8) {
        self.step.store(deg, Ordering::Release);
    }

    pub fn settle_ms(&self) -> u32 {
        self.settle_ms.load(Ordering::Acquire)
    }
    pub fn set_settle_ms(&self, ms: u32) {
        self.settle_ms.store(ms, Ordering::Release);
    }

    pub fn reading_delay_ms(&self) -> u32 {
        self.reading_delay_ms.load(Ordering::Acquire)
    }
    pub fn set_reading_delay_ms(&self, ms: u32) {
        self.reading_delay_ms.store(ms, Ordering::Release);
    }

    pub fn manual_angle(&self) -> u8 {
        self.manual_angle.load(Ordering::Acquire)
    }
    pub fn set_manual_angle(&self, deg: u8) {
        self.manual_angle.store(deg, Ordering::Release);
    }

    pub fn mode(&self) -> SweepMode {
        SweepMode::from_u8(self.mode.load(Ordering::Acquire))
    }
    pub fn set_mode(&self, mode: SweepMode) {
        self.mode.store(mode.as_u8(), Ordering::Release);
    }

    /// Telemetry mode byte: 0 manual, 1 forward sweep, 2 bidirectional sweep.
    pub fn telemetry_mode(&self) -> u8 {
        if !self.sweep_enabled() {
            return 0;
        }
        match self.mode() {
            SweepMode::Forward => 1,
            SweepMode::Bidirectional => 2,
        }
    }
}

fn atomic_array<const N: usize>(v: f32) -> [AtomicF32; N] {
    std::array::from_fn(|_| AtomicF32::new(v))
}

pub struct SharedState {
    // Sector readings (bounded lock + fallback mirror)
    sectors: Mutex<[SectorReading; NUM_CHANNELS]>,
    sector_mirror: [AtomicU64; NUM_CHANNELS],
    lock_timeout: Duration,

    // Control → telemetry
    setpoints: [AtomicF32; NUM_CHANNELS],
    pressures: [AtomicF32; NUM_CHANNELS],
    duties: [AtomicF32; NUM_CHANNELS],
    force_scale: AtomicF32,
    distance_scale: AtomicF32,
    thresholds: [AtomicF32; 3],

    // Acquisition → telemetry
    scan_angle: AtomicU8,
    live_reading: AtomicF32,
    sensor_flags: AtomicU8,

    // Diagnostics
    lock_timeouts: AtomicU64,
    skipped_publishes: AtomicU64,
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,

    pub params: RuntimeParams,
    boot: Instant,
}

impl SharedState {
    pub fn new(cfg: &SweepConfig) -> Self {
        let none = SectorReading::NO_DETECTION.pack();
        Self {
            sectors: Mutex::new([SectorReading::NO_DETECTION; NUM_CHANNELS]),
            sector_mirror: std::array::from_fn(|_| AtomicU64::new(none)),
            lock_timeout: cfg.lock_timeout,
            setpoints: atomic_array(-1.0),
            pressures: atomic_array(0.0),
            duties: atomic_array(0.0),
            force_scale: AtomicF32::new(1.0),
            distance_scale: AtomicF32::new(1.0),
            thresholds: atomic_array(0.0),
            scan_angle: AtomicU8::new(cfg.min_angle),
            live_reading: AtomicF32::new(NO_DETECTION_CM),
            sensor_flags: AtomicU8::new(0),
            lock_timeouts: AtomicU64::new(0),
            skipped_publishes: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            params: RuntimeParams::from_config(cfg),
            boot: Instant::now(),
        }
    }

    /// Milliseconds since boot, wrapping like the device's tick counter.
    pub fn uptime_ms(&self) -> u32 {
        self.boot.elapsed().as_millis() as u32
    }

    // ========================================================================
    // Sector readings
    // ========================================================================

    /// Publishes a completed sector. Returns `false` (and counts it) if the lock could not be
    /// taken within the timeout; the reading is then lost, never retried.
    pub fn publish_sector(&self, index: usize, reading: SectorReading) -> bool {
        match self.sectors.try_lock_for(self.lock_timeout) {
            Some(mut guard) => {
                guard[index] = reading;
                self.sector_mirror[index].store(reading.pack(), Ordering::Release);
                true
            }
            None => {
                self.lock_timeouts.fetch_add(1, Ordering::Relaxed);
                self.skipped_publishes.fetch_add(1, Ordering::Relaxed);
                warn!("[Shared] sector {} publish skipped: lock timeout", index);
                false
            }
        }
    }

    /// Reads one sector; on timeout returns the last successfully published value.
    pub fn sector(&self, index: usize) -> SectorReading {
        match self.sectors.try_lock_for(self.lock_timeout) {
            Some(guard) => guard[index],
            None => {
                self.lock_timeouts.fetch_add(1, Ordering::Relaxed);
                self.sector_fallback(index)
            }
        }
    }

    /// All sectors under a single acquisition; mirror values on timeout.
    pub fn sectors(&self) -> [SectorReading; NUM_CHANNELS] {
        match self.sectors.try_lock_for(self.lock_timeout) {
            Some(guard) => *guard,
            None => {
                self.lock_timeouts.fetch_add(1, Ordering::Relaxed);
                std::array::from_fn(|i| self.sector_fallback(i))
            }
        }
    }

    /// Lock-free last known value.
    pub fn sector_fallback(&self, index: usize) -> SectorReading {
        SectorReading::unpack(self.sector_mirror[index].load(Ordering::Acquire))
    }

    /// Holds the sector lock for `hold`. Diagnostics and contention tests only.
    pub fn hold_sector_lock(&self, hold: Duration) {
        let _guard = self.sectors.lock();
        std::thread::sleep(hold);
    }

    // ========================================================================
    // Control-owned scalars
    // ========================================================================

    pub fn set_channel(&self, ch: usize, setpoint: f32, pressure: f32, duty: f32) {
        self.setpoints[ch].store(setpoint, Ordering::Release);
        self.pressures[ch].store(pressure, Ordering::Release);
        self.duties[ch].store(duty, Ordering::Release);
    }

    pub fn setpoint(&self, ch: usize) -> f32 {
        self.setpoints[ch].load(Ordering::Acquire)
    }

    pub fn pressure(&self, ch: usize) -> f32 {
        self.pressures[ch].load(Ordering::Acquire)
    }

    pub fn duty(&self, ch: usize) -> f32 {
        self.duties[ch].load(Ordering::Acquire)
    }

    pub fn set_scales(&self, force_scale: f32, distance_scale: f32) {
        self.force_scale.store(force_scale, Ordering::Release);
        self.distance_scale.store(distance_scale, Ordering::Release);
    }

    pub fn scales(&self) -> (f32, f32) {
        (
            self.force_scale.load(Ordering::Acquire),
            self.distance_scale.load(Ordering::Acquire),
        )
    }

    pub fn set_thresholds(&self, thresholds: [f32; 3]) {
        for (slot, v) in self.thresholds.iter().zip(thresholds) {
            slot.store(v, Ordering::Release);
        }
    }

    pub fn thresholds(&self) -> [f32; 3] {
        std::array::from_fn(|i| self.thresholds[i].load(Ordering::Acquire))
    }

    // ========================================================================
    // Acquisition-owned scalars
    // ========================================================================

    pub fn set_scan_angle(&self, deg: u8) {
        self.scan_angle.store(deg, Ordering::Release);
    }

    pub fn scan_angle(&self) -> u8 {
        self.scan_angle.load(Ordering::Acquire)
    }

    pub fn set_live_reading(&self, cm: f32, flags: u8) {
        self.live_reading.store(cm, Ordering::Release);
        self.sensor_flags.store(flags, Ordering::Release);
    }

    pub fn live_reading(&self) -> f32 {
        self.live_reading.load(Ordering::Acquire)
    }

    pub fn sensor_flags(&self) -> u8 {
        self.sensor_flags.load(Ordering::Acquire)
    }

    // ========================================================================
    // Diagnostics
    // ========================================================================

    pub fn record_frame_sent(&self) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_frame_drop(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn lock_timeouts(&self) -> u64 {
        self.lock_timeouts.load(Ordering::Relaxed)
    }

    pub fn skipped_publishes(&self) -> u64 {
        self.skipped_publishes.load(Ordering::Relaxed)
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped.load(Ordering::Relaxed)
    }
}
