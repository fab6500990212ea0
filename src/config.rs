//! config.rs
//! Compile-time defaults and the startup configuration of both execution contexts.
//!
//! Units: distances in cm, pressures in mV (raw pad millivolts), duties in percent,
//! angles in servo degrees.
//!
//! Only the sweep parameters can change after startup; those are copied into
//! `RuntimeParams` (see `sync_manager`) and mutated there by the command handler.

use std::time::Duration;

use crate::component_a::sweep::SectorMap;
use crate::component_b::{controller::PiGains, setpoint::DynamicThresholds};
use crate::error::ConfigError;

// ============================================================================
// Channels & sectors
// ============================================================================

/// Number of motor / pressure-pad channels, one scan sector each.
pub const NUM_CHANNELS: usize = 4;

/// Sector boundaries `[start, end)` in degrees; the last sector also includes its end.
pub const SECTORS: [(u8, u8); NUM_CHANNELS] = [(5, 45), (45, 90), (90, 135), (135, 175)];

// ============================================================================
// Servo sweep
// ============================================================================

pub const SERVO_MIN_ANGLE: u8 = 5;
pub const SERVO_MAX_ANGLE: u8 = 175;
pub const SERVO_STEP: u8 = 5;
pub const SERVO_STEP_MAX: u8 = 20;
pub const SERVO_SETTLE_MS: u32 = 5;
pub const SERVO_READING_DELAY_MS: u32 = 5;
pub const SERVO_TIMING_MAX_MS: u32 = 200;
pub const SERVO_MANUAL_ANGLE: u8 = 90;

/// Bounded wait on the sector lock, from either side.
pub const LOCK_TIMEOUT: Duration = Duration::from_millis(10);

/// Distance sentinel: larger than any physically valid reading.
pub const NO_DETECTION_CM: f32 = 999.0;

// ============================================================================
// Distance ranges & setpoints (millivolt mode)
// ============================================================================

/// Absolute minimum boundary, never scaled.
pub const DISTANCE_MIN_CM: f32 = 50.0;
pub const DISTANCE_NEAR_MID_CM: f32 = 100.0;
pub const DISTANCE_MID_FAR_CM: f32 = 200.0;
pub const DISTANCE_FAR_OUT_CM: f32 = 300.0;

pub const SETPOINT_NEAR_MV: f32 = 2000.0;
pub const SETPOINT_MID_MV: f32 = 1000.0;
/// Added to the captured baseline while a channel stays FAR.
pub const SECURITY_OFFSET_MV: f32 = 40.0;

pub const FORCE_SCALE_RANGE: (f32, f32) = (0.6, 1.0);
pub const DISTANCE_SCALE_RANGE: (f32, f32) = (0.5, 1.5);
pub const ANALOG_SAMPLES: usize = 8;
pub const ANALOG_FULL_SCALE_MV: f32 = 3300.0;

// ============================================================================
// Control loop
// ============================================================================

pub const CONTROL_PERIOD_MS: u64 = 20;
pub const DUTY_MAX: f32 = 100.0;
/// Minimum duty the motors can actually turn at; anything smaller is braked.
pub const MIN_RUN_PCT: f32 = 40.0;
pub const PAD_SAMPLES: usize = 8;

// ============================================================================
// Out-of-range safety
// ============================================================================

pub const SAFE_PRESSURE_MV: f32 = 300.0;
pub const RELEASE_TIME_MS: u64 = 1300;
pub const REVERSE_DUTY_PCT: f32 = 60.0;

// ============================================================================
// Telemetry
// ============================================================================

pub const TELEMETRY_PERIOD_MS: u64 = 50;
pub const TELEMETRY_SINK_CAPACITY: usize = 64;

/// How the scan servo moves between the ends of its span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepMode {
    /// min → max, then jump back to min.
    Forward,
    /// min → max → min, reversing at each end.
    Bidirectional,
}

impl SweepMode {
    pub fn as_u8(self) -> u8 {
        match self {
            SweepMode::Forward => 0,
            SweepMode::Bidirectional => 1,
        }
    }

    pub fn from_u8(raw: u8) -> Self {
        match raw {
            1 => SweepMode::Bidirectional,
            _ => SweepMode::Forward,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SweepMode::Forward => "FORWARD",
            SweepMode::Bidirectional => "BIDIRECTIONAL",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ControlConfig {
    pub period: Duration,
    pub gains: PiGains,
    pub duty_max: f32,
    pub min_run: f32,
    pub pad_samples: usize,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_millis(CONTROL_PERIOD_MS),
            gains: PiGains::MILLIVOLTS,
            duty_max: DUTY_MAX,
            min_run: MIN_RUN_PCT,
            pad_samples: PAD_SAMPLES,
        }
    }
}

impl ControlConfig {
    /// Control period in seconds (the PI integration step).
    pub fn dt(&self) -> f32 {
        self.period.as_secs_f32()
    }
}

#[derive(Debug, Clone)]
pub struct SweepConfig {
    pub sectors: [(u8, u8); NUM_CHANNELS],
    pub min_angle: u8,
    pub max_angle: u8,
    pub step: u8,
    pub settle_ms: u32,
    pub reading_delay_ms: u32,
    pub manual_angle: u8,
    pub mode: SweepMode,
    pub enabled: bool,
    /// Secondary (ultrasonic) sensor fitted.
    pub secondary_sensor: bool,
    pub lock_timeout: Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            sectors: SECTORS,
            min_angle: SERVO_MIN_ANGLE,
            max_angle: SERVO_MAX_ANGLE,
            step: SERVO_STEP,
            settle_ms: SERVO_SETTLE_MS,
            reading_delay_ms: SERVO_READING_DELAY_MS,
            manual_angle: SERVO_MANUAL_ANGLE,
            mode: SweepMode::Bidirectional,
            enabled: true,
            secondary_sensor: true,
            lock_timeout: LOCK_TIMEOUT,
        }
    }
}

impl SweepConfig {
    /// First and last angle covered by the sector map.
    pub fn sector_span(&self) -> (u8, u8) {
        (self.sectors[0].0, self.sectors[NUM_CHANNELS - 1].1)
    }
}

#[derive(Debug, Clone)]
pub struct SetpointConfig {
    pub distance_min_cm: f32,
    pub near_mid_cm: f32,
    pub mid_far_cm: f32,
    pub far_out_cm: f32,
    pub setpoint_near_mv: f32,
    pub setpoint_mid_mv: f32,
    pub security_offset_mv: f32,
    pub force_scale_range: (f32, f32),
    pub distance_scale_range: (f32, f32),
    pub analog_samples: usize,
    pub analog_full_scale_mv: f32,
}

impl Default for SetpointConfig {
    fn default() -> Self {
        Self {
            distance_min_cm: DISTANCE_MIN_CM,
            near_mid_cm: DISTANCE_NEAR_MID_CM,
            mid_far_cm: DISTANCE_MID_FAR_CM,
            far_out_cm: DISTANCE_FAR_OUT_CM,
            setpoint_near_mv: SETPOINT_NEAR_MV,
            setpoint_mid_mv: SETPOINT_MID_MV,
            security_offset_mv: SECURITY_OFFSET_MV,
            force_scale_range: FORCE_SCALE_RANGE,
            distance_scale_range: DISTANCE_SCALE_RANGE,
            analog_samples: ANALOG_SAMPLES,
            analog_full_scale_mv: ANALOG_FULL_SCALE_MV,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SafetyConfig {
    pub safe_pressure_mv: f32,
    pub release_time: Duration,
    pub reverse_duty: f32,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            safe_pressure_mv: SAFE_PRESSURE_MV,
            release_time: Duration::from_millis(RELEASE_TIME_MS),
            reverse_duty: REVERSE_DUTY_PCT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub period: Duration,
    /// Append sensor flags, scale factors and thresholds to every frame.
    pub extended: bool,
    pub sink_capacity: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_millis(TELEMETRY_PERIOD_MS),
            extended: true,
            sink_capacity: TELEMETRY_SINK_CAPACITY,
        }
    }
}

/// Everything both contexts need at boot.
#[derive(Debug, Clone, Default)]
pub struct SystemConfig {
    pub control: ControlConfig,
    pub sweep: SweepConfig,
    pub setpoint: SetpointConfig,
    pub safety: SafetyConfig,
    pub telemetry: TelemetryConfig,
}

impl SystemConfig {
    /// Checks the invariants the loops rely on and never re-check at runtime.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let sweep = &self.sweep;
        if sweep.min_angle >= sweep.max_angle || sweep.max_angle > 180 {
            return Err(ConfigError::SweepSpan { min: sweep.min_angle, max: sweep.max_angle });
        }
        if sweep.step == 0 {
            return Err(ConfigError::ZeroPeriod("sweep step"));
        }

        SectorMap::new(sweep.sectors)?;
        let (first, last) = sweep.sector_span();
        if sweep.min_angle < first || sweep.max_angle > last {
            return Err(ConfigError::SectorCoverage);
        }

        if self.control.period.is_zero() {
            return Err(ConfigError::ZeroPeriod("control period"));
        }
        if self.telemetry.period.is_zero() {
            return Err(ConfigError::ZeroPeriod("telemetry period"));
        }
        if self.telemetry.period < self.control.period {
            return Err(ConfigError::PeriodOrder);
        }
        if self.setpoint.analog_samples == 0 || self.control.pad_samples == 0 {
            return Err(ConfigError::ZeroPeriod("sample count"));
        }

        let sp = &self.setpoint;
        let (f_lo, f_hi) = sp.force_scale_range;
        if !(f_lo > 0.0 && f_lo <= f_hi) {
            return Err(ConfigError::ScaleRange("force_scale"));
        }
        let (d_lo, d_hi) = sp.distance_scale_range;
        if !(d_lo > 0.0 && d_lo <= d_hi) {
            return Err(ConfigError::ScaleRange("distance_scale"));
        }
        if !(sp.distance_min_cm < sp.near_mid_cm
            && sp.near_mid_cm < sp.mid_far_cm
            && sp.mid_far_cm < sp.far_out_cm)
        {
            return Err(ConfigError::Boundaries);
        }
        // far_out scales from zero but the inner bounds scale about the minimum
        for scale in [d_lo, d_hi] {
            let t = DynamicThresholds::compute(sp, scale);
            if !(t.min < t.near_mid && t.near_mid < t.mid_far && t.mid_far < t.far_out) {
                return Err(ConfigError::Boundaries);
            }
        }

        Ok(())
    }
}
