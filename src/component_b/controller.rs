//! controller.rs
//! Per-channel PI controller: pressure error → signed motor duty.
//!
//! - Integrator clamped to ±duty_max/Ki before use (anti-windup by clamping, not freezing)
//! - Output saturated to ±duty_max
//! - Deadband: |duty| below the minimum-run threshold is forced to exactly 0 (brake)
//!
//! One `PiController` per channel; the only state is the integrator.

use crate::config::ControlConfig;

/// Ki floor used when sizing the integrator clamp.
const KI_FLOOR: f32 = 1e-4;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PiGains {
    pub kp: f32,
    pub ki: f32,
}

impl PiGains {
    /// Gains for raw pad millivolts.
    pub const MILLIVOLTS: PiGains = PiGains { kp: 0.15, ki: 0.60 };
    /// Gains for calibrated Newtons (~80 mV per N).
    pub const NEWTONS: PiGains = PiGains { kp: 12.0, ki: 48.0 };
}

/// Command handed to an H-bridge. Duties are positive percentages.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MotorCommand {
    Forward(f32),
    Reverse(f32),
    Brake,
}

impl MotorCommand {
    /// Signed percentage: forward positive, reverse negative, brake 0.
    pub fn signed_duty(self) -> f32 {
        match self {
            MotorCommand::Forward(d) => d,
            MotorCommand::Reverse(d) => -d,
            MotorCommand::Brake => 0.0,
        }
    }

    pub fn from_signed(duty: f32) -> Self {
        if duty > 0.0 {
            MotorCommand::Forward(duty)
        } else if duty < 0.0 {
            MotorCommand::Reverse(-duty)
        } else {
            MotorCommand::Brake
        }
    }
}

#[derive(Debug, Clone)]
pub struct PiController {
    gains: PiGains,
    dt: f32,
    duty_max: f32,
    min_run: f32,
    integrator: f32,
}

impl PiController {
    pub fn new(gains: PiGains, dt: f32, duty_max: f32, min_run: f32) -> Self {
        Self {
            gains,
            dt,
            duty_max,
            min_run,
            integrator: 0.0,
        }
    }

    pub fn from_config(cfg: &ControlConfig) -> Self {
        Self::new(cfg.gains, cfg.dt(), cfg.duty_max, cfg.min_run)
    }

    #[inline]
    pub fn integrator(&self) -> f32 {
        self.integrator
    }

    #[inline]
    pub fn gains(&self) -> PiGains {
        self.gains
    }

    /// New gains take effect on the next step; the integrator is kept.
    pub fn set_gains(&mut self, gains: PiGains) {
        self.gains = gains;
    }

    pub fn reset(&mut self) {
        self.integrator = 0.0;
    }

    /// Bound on |integrator| so that Ki·I alone never exceeds duty_max.
    pub fn integrator_limit(&self) -> f32 {
        self.duty_max / self.gains.ki.max(KI_FLOOR)
    }

    /// One control period. Returns the signed duty after saturation and deadband.
    pub fn step(&mut self, setpoint: f32, pressure: f32) -> f32 {
        let error = setpoint - pressure;

        let limit = self.integrator_limit();
        self.integrator = (self.integrator + error * self.dt).clamp(-limit, limit);

        let duty = (self.gains.kp * error + self.gains.ki * self.integrator)
            .clamp(-self.duty_max, self.duty_max);

        if duty.abs() < self.min_run { 0.0 } else { duty }
    }

    /// `step` mapped to an H-bridge command.
    pub fn command(&mut self, setpoint: f32, pressure: f32) -> MotorCommand {
        MotorCommand::from_signed(self.step(setpoint, pressure))
    }
}

impl Default for PiController {
    fn default() -> Self {
        Self::from_config(&ControlConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> PiController {
        PiController::new(PiGains::MILLIVOLTS, 0.02, 100.0, 40.0)
    }

    #[test]
    fn small_error_is_deadbanded_to_zero() {
        let mut pi = controller();
        // e = 27 → P = 4.05, I = 0.54 → Ki·I = 0.324, total ≈ 4.37 %
        let duty = pi.step(550.0, 523.0);
        assert!((pi.integrator() - 0.54).abs() < 1e-5);
        assert_eq!(duty, 0.0);
        assert_eq!(pi.command(550.0, 523.0), MotorCommand::Brake);
    }

    #[test]
    fn large_error_saturates_forward() {
        let mut pi = controller();
        assert_eq!(pi.step(2000.0, 0.0), 100.0);
    }

    #[test]
    fn negative_error_drives_reverse() {
        let mut pi = controller();
        let duty = pi.step(0.0, 1000.0);
        assert_eq!(duty, -100.0);
        assert_eq!(MotorCommand::from_signed(duty), MotorCommand::Reverse(100.0));
    }

    #[test]
    fn integrator_never_exceeds_limit() {
        let mut pi = controller();
        let limit = pi.integrator_limit();
        for _ in 0..50_000 {
            let duty = pi.step(3000.0, 0.0);
            assert!(duty.abs() <= 100.0);
            assert!(pi.integrator().abs() <= limit + 1e-3);
        }
        assert!((pi.integrator() - limit).abs() < 1e-3);
    }

    #[test]
    fn duty_is_either_zero_or_outside_deadband() {
        let mut pi = controller();
        for p in (0..3300).step_by(37) {
            let duty = pi.step(1000.0, p as f32);
            assert!(duty == 0.0 || duty.abs() >= 40.0);
            assert!(duty.abs() <= 100.0);
        }
    }

    #[test]
    fn reset_clears_integrator() {
        let mut pi = controller();
        pi.step(1000.0, 0.0);
        assert!(pi.integrator() > 0.0);
        pi.reset();
        assert_eq!(pi.integrator(), 0.0);
    }
}
