//! hardware.rs
//! Control-side device seams: pressure pads behind H-bridges and the two scale potentiometers.
//! The simulated implementations stand in for the ADC and motor drivers on the host.

use rand::{Rng, SeedableRng, rngs::StdRng};

use crate::component_b::controller::MotorCommand;
use crate::config::{ANALOG_FULL_SCALE_MV, NUM_CHANNELS};

/// One analog input in millivolts.
pub trait AnalogInput {
    fn read_mv(&mut self) -> f32;
}

/// N pressure pads, each inflated / deflated by its own H-bridge.
pub trait PadDriver {
    /// One raw pressure sample of channel `ch` in millivolts.
    fn read_pressure_mv(&mut self, ch: usize) -> f32;
    /// Applies `cmd` to channel `ch` until the next call for that channel.
    fn apply(&mut self, ch: usize, cmd: MotorCommand);
}

/// Potentiometer held at a fixed position, with ADC noise.
pub struct SimulatedPot {
    mv: f32,
    noise_mv: f32,
    rng: StdRng,
}

impl SimulatedPot {
    pub fn new(mv: f32, noise_mv: f32, seed: u64) -> Self {
        Self {
            mv,
            noise_mv,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Position as a fraction of full travel.
    pub fn at_fraction(fraction: f32, seed: u64) -> Self {
        Self::new(fraction.clamp(0.0, 1.0) * ANALOG_FULL_SCALE_MV, 8.0, seed)
    }

    pub fn set_mv(&mut self, mv: f32) {
        self.mv = mv;
    }
}

impl AnalogInput for SimulatedPot {
    fn read_mv(&mut self) -> f32 {
        let noise = if self.noise_mv > 0.0 {
            self.rng.random_range(-self.noise_mv..self.noise_mv)
        } else {
            0.0
        };
        (self.mv + noise).clamp(0.0, ANALOG_FULL_SCALE_MV)
    }
}

/// First-order pad model per channel.
#[derive(Debug, Clone, Copy)]
pub struct PadModel {
    /// mV/s per % duty while inflating.
    pub inflate_rate: f32,
    /// mV/s per % duty while deflating.
    pub deflate_rate: f32,
    /// Fraction of pressure lost per second through leakage.
    pub leak_per_s: f32,
    pub noise_mv: f32,
}

impl Default for PadModel {
    fn default() -> Self {
        Self {
            inflate_rate: 25.0,
            deflate_rate: 30.0,
            leak_per_s: 0.02,
            noise_mv: 4.0,
        }
    }
}

/// Simulated pads. Each `apply` integrates the plant over one control period.
pub struct SimulatedPads {
    model: PadModel,
    dt: f32,
    pressure: [f32; NUM_CHANNELS],
    rng: StdRng,
}

impl SimulatedPads {
    pub fn new(model: PadModel, dt: f32, seed: u64) -> Self {
        Self {
            model,
            dt,
            pressure: [0.0; NUM_CHANNELS],
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Noise-free plant pressure.
    pub fn true_pressure(&self, ch: usize) -> f32 {
        self.pressure[ch]
    }

    pub fn set_pressure(&mut self, ch: usize, mv: f32) {
        self.pressure[ch] = mv.clamp(0.0, ANALOG_FULL_SCALE_MV);
    }
}

impl PadDriver for SimulatedPads {
    fn read_pressure_mv(&mut self, ch: usize) -> f32 {
        let noise = if self.model.noise_mv > 0.0 {
            self.rng.random_range(-self.model.noise_mv..self.model.noise_mv)
        } else {
            0.0
        };
        (self.pressure[ch] + noise).clamp(0.0, ANALOG_FULL_SCALE_MV)
    }

    fn apply(&mut self, ch: usize, cmd: MotorCommand) {
        let drive = match cmd {
            MotorCommand::Forward(d) => self.model.inflate_rate * d,
            MotorCommand::Reverse(d) => -self.model.deflate_rate * d,
            MotorCommand::Brake => 0.0,
        };
        let p = self.pressure[ch];
        let next = p + (drive - self.model.leak_per_s * p) * self.dt;
        self.pressure[ch] = next.clamp(0.0, ANALOG_FULL_SCALE_MV);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet() -> PadModel {
        PadModel { noise_mv: 0.0, ..PadModel::default() }
    }

    #[test]
    fn forward_inflates_reverse_deflates() {
        let mut pads = SimulatedPads::new(quiet(), 0.02, 1);
        for _ in 0..50 {
            pads.apply(0, MotorCommand::Forward(100.0));
        }
        let inflated = pads.read_pressure_mv(0);
        assert!(inflated > 1000.0, "{}", inflated);

        for _ in 0..10 {
            pads.apply(0, MotorCommand::Reverse(60.0));
        }
        assert!(pads.read_pressure_mv(0) < inflated);
    }

    #[test]
    fn pressure_stays_within_adc_range() {
        let mut pads = SimulatedPads::new(PadModel::default(), 0.02, 2);
        for _ in 0..1000 {
            pads.apply(1, MotorCommand::Forward(100.0));
        }
        assert!(pads.read_pressure_mv(1) <= ANALOG_FULL_SCALE_MV);
        for _ in 0..1000 {
            pads.apply(1, MotorCommand::Reverse(100.0));
        }
        assert_eq!(pads.true_pressure(1), 0.0);
    }

    #[test]
    fn brake_holds_apart_from_leakage() {
        let mut pads = SimulatedPads::new(quiet(), 0.02, 3);
        pads.set_pressure(2, 1000.0);
        pads.apply(2, MotorCommand::Brake);
        let p = pads.true_pressure(2);
        assert!(p < 1000.0 && p > 999.0);
    }

    #[test]
    fn pot_reads_near_its_position() {
        let mut pot = SimulatedPot::at_fraction(0.5, 4);
        for _ in 0..100 {
            let mv = pot.read_mv();
            assert!((mv - 1650.0).abs() <= 8.0);
        }
    }
}
