//! sensor.rs
//! Acquisition-side devices: the scan servo and the two distance sensors, plus the
//! simulated obstacle field they observe on the host.
//!
//! - Primary: time-of-flight module on a serial line, 16-byte frames (parsed here)
//! - Secondary: ultrasonic ranger, pulse-width output, valid only inside [30, 500] cm
//! - Fusion: the closer of the two valid readings; neither → `NO_DETECTION_CM`
//!
//! A failed read is `None`, never an error: the sentinel carries the fault downstream.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use log::debug;
use rand::{Rng, SeedableRng, rngs::StdRng};

use crate::config::NO_DETECTION_CM;

pub const TOF_FRAME_LEN: usize = 16;
pub const TOF_HEADER: [u8; 2] = [0x57, 0x00];

/// Ultrasonic pulse width per centimetre.
pub const US_PER_CM: f32 = 147.0;
pub const ULTRASONIC_MIN_CM: f32 = 30.0;
pub const ULTRASONIC_MAX_CM: f32 = 500.0;

/// One distance sensor, pointed wherever the servo currently is.
pub trait DistanceSensor {
    /// Distance in cm, or `None` on timeout / corrupt frame / out-of-window reading.
    fn read_cm(&mut self, angle: u8) -> Option<f32>;
}

/// Positional scan servo.
pub trait ScanServo {
    fn move_to(&mut self, angle: u8);
    fn angle(&self) -> u8;
}

/// Combines the primary and secondary readings of one sample.
#[inline]
pub fn fuse(primary: Option<f32>, secondary: Option<f32>) -> f32 {
    match (primary, secondary) {
        (Some(a), Some(b)) => a.min(b),
        (Some(a), None) => a,
        (None, Some(b)) => b,
        (None, None) => NO_DETECTION_CM,
    }
}

// ============================================================================
// Time-of-flight frame
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TofFrame {
    pub id: u8,
    pub system_time_ms: u32,
    /// Signed 24-bit distance in millimetres.
    pub distance_mm: i32,
    pub status: u8,
    pub signal_strength: u16,
    pub precision: u8,
}

impl TofFrame {
    pub fn distance_cm(&self) -> f32 {
        self.distance_mm as f32 / 10.0
    }

    pub fn to_bytes(&self) -> [u8; TOF_FRAME_LEN] {
        let mut buf = [0u8; TOF_FRAME_LEN];
        buf[..2].copy_from_slice(&TOF_HEADER);
        buf[3] = self.id;
        buf[4..8].copy_from_slice(&self.system_time_ms.to_le_bytes());
        buf[8..11].copy_from_slice(&self.distance_mm.to_le_bytes()[..3]);
        buf[11] = self.status;
        buf[12..14].copy_from_slice(&self.signal_strength.to_le_bytes());
        buf[14] = self.precision;
        buf[15] = byte_sum(&buf[..15]);
        buf
    }
}

fn byte_sum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Validates header and checksum; `None` for anything else.
pub fn parse_tof_frame(buf: &[u8]) -> Option<TofFrame> {
    if buf.len() != TOF_FRAME_LEN || buf[..2] != TOF_HEADER {
        return None;
    }
    if byte_sum(&buf[..15]) != buf[15] {
        return None;
    }
    // sign-extend the 24-bit field
    let distance_mm = i32::from_le_bytes([0, buf[8], buf[9], buf[10]]) >> 8;
    Some(TofFrame {
        id: buf[3],
        system_time_ms: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
        distance_mm,
        status: buf[11],
        signal_strength: u16::from_le_bytes([buf[12], buf[13]]),
        precision: buf[14],
    })
}

// ============================================================================
// Simulated world
// ============================================================================

/// An object in front of the scanner. Its distance oscillates around `distance_cm`.
#[derive(Debug, Clone, Copy)]
pub struct Obstacle {
    pub center_deg: f32,
    pub half_width_deg: f32,
    pub distance_cm: f32,
    pub swing_cm: f32,
    pub swing_period: Duration,
}

impl Obstacle {
    pub fn fixed(center_deg: f32, half_width_deg: f32, distance_cm: f32) -> Self {
        Self {
            center_deg,
            half_width_deg,
            distance_cm,
            swing_cm: 0.0,
            swing_period: Duration::from_secs(1),
        }
    }

    fn distance_at(&self, angle: f32, t_s: f32) -> Option<f32> {
        if (angle - self.center_deg).abs() > self.half_width_deg {
            return None;
        }
        let period = self.swing_period.as_secs_f32().max(1e-3);
        let phase = std::f32::consts::TAU * t_s / period;
        Some(self.distance_cm + self.swing_cm * phase.sin())
    }
}

/// Obstacles shared by both simulated sensors.
#[derive(Debug, Clone)]
pub struct ObstacleField {
    obstacles: Vec<Obstacle>,
    epoch: Instant,
}

impl ObstacleField {
    pub fn new(obstacles: Vec<Obstacle>) -> Self {
        Self {
            obstacles,
            epoch: Instant::now(),
        }
    }

    /// One obstacle per sector at NEAR / MID / FAR / out-of-range distances,
    /// the FAR one drifting in and out of the MID band.
    pub fn demo() -> Self {
        Self::new(vec![
            Obstacle::fixed(25.0, 10.0, 80.0),
            Obstacle::fixed(68.0, 12.0, 150.0),
            Obstacle {
                center_deg: 112.0,
                half_width_deg: 10.0,
                distance_cm: 230.0,
                swing_cm: 45.0,
                swing_period: Duration::from_secs(8),
            },
            Obstacle::fixed(155.0, 8.0, 420.0),
        ])
    }

    /// Nearest surface at `angle`, `None` if nothing is there.
    pub fn nearest(&self, angle: u8, at: Instant) -> Option<f32> {
        let t_s = at.saturating_duration_since(self.epoch).as_secs_f32();
        self.obstacles
            .iter()
            .filter_map(|o| o.distance_at(angle as f32, t_s))
            .reduce(f32::min)
    }
}

/// ToF module simulation: produces real frames, then parses them back.
pub struct SimulatedTof {
    field: Arc<ObstacleField>,
    rng: StdRng,
    noise_cm: f32,
    /// Probability that no frame arrives before the read timeout.
    dropout: f64,
    /// Probability that a byte is flipped in transit.
    corruption: f64,
    boot: Instant,
}

impl SimulatedTof {
    pub fn new(field: Arc<ObstacleField>, seed: u64) -> Self {
        Self {
            field,
            rng: StdRng::seed_from_u64(seed),
            noise_cm: 1.0,
            dropout: 0.02,
            corruption: 0.01,
            boot: Instant::now(),
        }
    }

    pub fn with_faults(mut self, noise_cm: f32, dropout: f64, corruption: f64) -> Self {
        self.noise_cm = noise_cm;
        self.dropout = dropout.clamp(0.0, 1.0);
        self.corruption = corruption.clamp(0.0, 1.0);
        self
    }

    /// Raw bytes the module would emit, `None` on timeout.
    pub fn next_frame(&mut self, angle: u8) -> Option<[u8; TOF_FRAME_LEN]> {
        if self.rng.random_bool(self.dropout) {
            return None;
        }
        let now = Instant::now();
        // no target: the module reports a zero-strength, far reading
        let (distance_cm, strength) = match self.field.nearest(angle, now) {
            Some(d) => {
                let noise = if self.noise_cm > 0.0 {
                    self.rng.random_range(-self.noise_cm..self.noise_cm)
                } else {
                    0.0
                };
                ((d + noise).max(0.0), 600u16)
            }
            None => (0.0, 0),
        };
        let frame = TofFrame {
            id: 0,
            system_time_ms: now.saturating_duration_since(self.boot).as_millis() as u32,
            distance_mm: (distance_cm * 10.0) as i32,
            status: if strength == 0 { 1 } else { 0 },
            signal_strength: strength,
            precision: 2,
        };
        let mut bytes = frame.to_bytes();
        if self.rng.random_bool(self.corruption) {
            let i = self.rng.random_range(0..TOF_FRAME_LEN);
            bytes[i] ^= 0x10;
        }
        Some(bytes)
    }
}

impl DistanceSensor for SimulatedTof {
    fn read_cm(&mut self, angle: u8) -> Option<f32> {
        let bytes = self.next_frame(angle)?;
        let Some(frame) = parse_tof_frame(&bytes) else {
            debug!("[ToF] rejected frame at {}°", angle);
            return None;
        };
        if frame.signal_strength == 0 || frame.distance_mm <= 0 {
            return None;
        }
        Some(frame.distance_cm())
    }
}

/// Ultrasonic ranger simulation: pulse width in µs, zero on timeout.
pub struct SimulatedUltrasonic {
    field: Arc<ObstacleField>,
    rng: StdRng,
    noise_cm: f32,
}

impl SimulatedUltrasonic {
    pub fn new(field: Arc<ObstacleField>, seed: u64) -> Self {
        Self {
            field,
            rng: StdRng::seed_from_u64(seed),
            noise_cm: 2.0,
        }
    }

    pub fn pulse_width_us(&mut self, angle: u8) -> u32 {
        match self.field.nearest(angle, Instant::now()) {
            Some(d) => {
                let noise = if self.noise_cm > 0.0 {
                    self.rng.random_range(-self.noise_cm..self.noise_cm)
                } else {
                    0.0
                };
                ((d + noise).max(0.0) * US_PER_CM) as u32
            }
            None => 0,
        }
    }
}

/// Pulse width → cm, `None` on timeout or outside the sensor's reliable window.
pub fn ultrasonic_cm(pulse_width_us: u32) -> Option<f32> {
    if pulse_width_us == 0 {
        return None;
    }
    let cm = pulse_width_us as f32 / US_PER_CM;
    (ULTRASONIC_MIN_CM..=ULTRASONIC_MAX_CM).contains(&cm).then_some(cm)
}

impl DistanceSensor for SimulatedUltrasonic {
    fn read_cm(&mut self, angle: u8) -> Option<f32> {
        ultrasonic_cm(self.pulse_width_us(angle))
    }
}

/// Servo that reaches its target instantly; settle time is the sweep's concern.
#[derive(Debug, Default)]
pub struct SimulatedServo {
    angle: u8,
    moves: u64,
}

impl SimulatedServo {
    pub fn new(angle: u8) -> Self {
        Self { angle, moves: 0 }
    }

    pub fn moves(&self) -> u64 {
        self.moves
    }
}

impl ScanServo for SimulatedServo {
    fn move_to(&mut self, angle: u8) {
        if angle != self.angle {
            self.moves += 1;
        }
        self.angle = angle.min(180);
    }

    fn angle(&self) -> u8 {
        self.angle
    }
}
