//! Error types for configuration, runtime commands and telemetry frames.
//!
//! None of these ever stop a loop: configuration errors are reported at startup,
//! command errors become an `ERR:` response, frame errors are the consumer's concern.

use std::fmt;

/// Startup configuration rejected by `SystemConfig::validate`.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// Sweep span is empty or outside the servo's mechanical range.
    SweepSpan { min: u8, max: u8 },
    /// Sector `index` is empty or inverted.
    EmptySector { index: usize },
    /// Gap or overlap between sector `index` and the next one.
    SectorGap { index: usize },
    /// Sectors do not cover the full sweep span.
    SectorCoverage,
    /// A period or duration that must be non-zero is zero.
    ZeroPeriod(&'static str),
    /// A scale range is inverted or non-positive.
    ScaleRange(&'static str),
    /// Base distance boundaries are not strictly increasing.
    Boundaries,
    /// Telemetry must not run faster than control.
    PeriodOrder,
}

impl std::error::Error for ConfigError {}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::SweepSpan { min, max } => {
                write!(f, "invalid sweep span {}..={} degrees", min, max)
            }
            ConfigError::EmptySector { index } => write!(f, "sector {} is empty", index),
            ConfigError::SectorGap { index } => {
                write!(f, "sector {} does not meet sector {}", index, index + 1)
            }
            ConfigError::SectorCoverage => write!(f, "sectors do not cover the sweep span"),
            ConfigError::ZeroPeriod(name) => write!(f, "{} must be non-zero", name),
            ConfigError::ScaleRange(name) => write!(f, "invalid {} range", name),
            ConfigError::Boundaries => write!(f, "distance boundaries must be increasing across the distance scale range"),
            ConfigError::PeriodOrder => write!(f, "telemetry period is shorter than the control period"),
        }
    }
}

/// Rejected runtime command. `Display` renders the wire response (`ERR:<KIND>:<detail>`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// Unknown category or action; carries the offending text.
    InvalidCommand(String),
    /// Parameter is not a number.
    InvalidValue { param: &'static str, raw: String },
    /// Parameter parsed but lies outside its allowed range.
    OutOfRange { param: &'static str, value: i64 },
    /// Sweep bounds would no longer satisfy `min < max`.
    InvalidRange { min: u8, max: u8 },
    /// Manual angle requested while the sweep owns the servo.
    SweepActive,
}

impl CommandError {
    pub fn kind(&self) -> &'static str {
        match self {
            CommandError::InvalidCommand(_) => "INVALID_COMMAND",
            CommandError::InvalidValue { .. } => "INVALID_VALUE",
            CommandError::OutOfRange { .. } => "OUT_OF_RANGE",
            CommandError::InvalidRange { .. } => "INVALID_RANGE",
            CommandError::SweepActive => "SWEEP_ACTIVE",
        }
    }
}

impl std::error::Error for CommandError {}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ERR:{}:", self.kind())?;
        match self {
            CommandError::InvalidCommand(text) => write!(f, "{}", text),
            CommandError::InvalidValue { param, raw } => write!(f, "{}:{}", param, raw),
            CommandError::OutOfRange { param, value } => write!(f, "{}:{}", param, value),
            CommandError::InvalidRange { min, max } => write!(f, "MIN:{} >= MAX:{}", min, max),
            CommandError::SweepActive => write!(f, "SERVO:ANGLE"),
        }
    }
}

/// Telemetry frame rejected by the consumer. Bad frames are discarded, never repaired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    Length { expected: usize, actual: usize },
    Header(u16),
    Checksum { expected: u16, actual: u16 },
}

impl std::error::Error for FrameError {}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FrameError::Length { expected, actual } => {
                write!(f, "frame length {} (expected {})", actual, expected)
            }
            FrameError::Header(h) => write!(f, "bad frame header {:#06x}", h),
            FrameError::Checksum { expected, actual } => {
                write!(f, "crc mismatch: computed {:#06x}, frame carries {:#06x}", expected, actual)
            }
        }
    }
}
