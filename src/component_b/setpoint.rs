//! setpoint.rs
//! Distance → range bucket → target pressure, recomputed every control cycle.
//!
//! Two runtime knobs, each read from its own analog input and averaged:
//! - `distance_scale` stretches the range boundaries (the absolute minimum stays fixed)
//! - `force_scale` scales the NEAR / MID target pressures
//!
//! FAR does not use a fixed target: the pad pressure at the moment the channel enters FAR
//! is captured as a baseline and held (plus a small security offset) until it leaves FAR,
//! so intermittent detections do not make the setpoint chatter.

use average::Mean;

use crate::component_b::hardware::AnalogInput;
use crate::config::{NO_DETECTION_CM, SetpointConfig};

/// Wire value of an invalid setpoint.
pub const INVALID_SETPOINT: f32 = -1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RangeClassification {
    Near,
    Mid,
    Far,
    OutOfBounds,
    Invalid,
}

impl RangeClassification {
    /// NEAR, MID and FAR produce a setpoint; the other two hand the channel to the safety machine.
    #[inline]
    pub fn is_valid(self) -> bool {
        matches!(
            self,
            RangeClassification::Near | RangeClassification::Mid | RangeClassification::Far
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            RangeClassification::Near => "NEAR",
            RangeClassification::Mid => "MID",
            RangeClassification::Far => "FAR",
            RangeClassification::OutOfBounds => "OUT_OF_BOUNDS",
            RangeClassification::Invalid => "INVALID",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaleFactors {
    pub force_scale: f32,
    pub distance_scale: f32,
}

impl Default for ScaleFactors {
    fn default() -> Self {
        Self {
            force_scale: 1.0,
            distance_scale: 1.0,
        }
    }
}

impl ScaleFactors {
    /// Maps two averaged analog voltages linearly into the configured scale ranges.
    pub fn from_millivolts(force_mv: f32, distance_mv: f32, cfg: &SetpointConfig) -> Self {
        Self {
            force_scale: map_to_range(force_mv, cfg.analog_full_scale_mv, cfg.force_scale_range),
            distance_scale: map_to_range(
                distance_mv,
                cfg.analog_full_scale_mv,
                cfg.distance_scale_range,
            ),
        }
    }
}

fn map_to_range(mv: f32, full_scale: f32, (lo, hi): (f32, f32)) -> f32 {
    let fraction = if mv.is_finite() && full_scale > 0.0 {
        (mv / full_scale).clamp(0.0, 1.0)
    } else {
        0.0
    };
    // exact at both ends
    lo * (1.0 - fraction) + hi * fraction
}

/// Mean of `samples` reads; suppresses potentiometer noise before scaling.
pub fn averaged_millivolts<A: AnalogInput + ?Sized>(input: &mut A, samples: usize) -> f32 {
    let mean: Mean = (0..samples.max(1)).map(|_| input.read_mv() as f64).collect();
    mean.mean() as f32
}

/// Reads both scale inputs for this cycle.
pub fn read_scale_factors<F, D>(force_in: &mut F, distance_in: &mut D, cfg: &SetpointConfig) -> ScaleFactors
where
    F: AnalogInput + ?Sized,
    D: AnalogInput + ?Sized,
{
    let force_mv = averaged_millivolts(force_in, cfg.analog_samples);
    let distance_mv = averaged_millivolts(distance_in, cfg.analog_samples);
    ScaleFactors::from_millivolts(force_mv, distance_mv, cfg)
}

/// The three scaled boundaries plus the unscaled absolute minimum.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DynamicThresholds {
    pub min: f32,
    pub near_mid: f32,
    pub mid_far: f32,
    pub far_out: f32,
}

impl DynamicThresholds {
    /// Inner boundaries scale about the fixed minimum; the outer boundary scales from zero,
    /// so the whole detection range stretches with `distance_scale`.
    pub fn compute(cfg: &SetpointConfig, distance_scale: f32) -> Self {
        let min = cfg.distance_min_cm;
        Self {
            min,
            near_mid: min + (cfg.near_mid_cm - min) * distance_scale,
            mid_far: min + (cfg.mid_far_cm - min) * distance_scale,
            far_out: cfg.far_out_cm * distance_scale,
        }
    }

    pub fn as_array(&self) -> [f32; 3] {
        [self.near_mid, self.mid_far, self.far_out]
    }

    /// Total: every input maps to exactly one classification.
    pub fn classify(&self, distance: f32) -> RangeClassification {
        if !distance.is_finite() || distance < 0.0 || distance >= NO_DETECTION_CM {
            RangeClassification::Invalid
        } else if distance < self.min {
            RangeClassification::OutOfBounds
        } else if distance < self.near_mid {
            RangeClassification::Near
        } else if distance < self.mid_far {
            RangeClassification::Mid
        } else if distance <= self.far_out {
            RangeClassification::Far
        } else {
            RangeClassification::OutOfBounds
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Setpoint {
    Target(f32),
    Invalid,
}

impl Setpoint {
    pub fn target(self) -> Option<f32> {
        match self {
            Setpoint::Target(mv) => Some(mv),
            Setpoint::Invalid => None,
        }
    }

    /// Value carried in telemetry: the target, or `INVALID_SETPOINT`.
    pub fn wire_value(self) -> f32 {
        self.target().unwrap_or(INVALID_SETPOINT)
    }
}

/// Pressure captured on entry into FAR, held while the channel stays FAR.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FarBaseline {
    pub pressure: f32,
    pub captured: bool,
}

impl FarBaseline {
    /// Updates the capture from this cycle's transition and measured pressure.
    pub fn observe(&mut self, previous: RangeClassification, current: RangeClassification, pressure: f32) {
        if current == RangeClassification::Far {
            if previous != RangeClassification::Far || !self.captured {
                self.pressure = pressure;
                self.captured = true;
            }
        } else {
            self.captured = false;
        }
    }
}

#[derive(Debug, Clone)]
pub struct SetpointCalculator {
    cfg: SetpointConfig,
}

impl SetpointCalculator {
    pub fn new(cfg: SetpointConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &SetpointConfig {
        &self.cfg
    }

    pub fn thresholds(&self, scales: &ScaleFactors) -> DynamicThresholds {
        DynamicThresholds::compute(&self.cfg, scales.distance_scale)
    }

    pub fn setpoint(&self, range: RangeClassification, force_scale: f32, baseline: &FarBaseline) -> Setpoint {
        match range {
            RangeClassification::Near => Setpoint::Target(self.cfg.setpoint_near_mv * force_scale),
            RangeClassification::Mid => Setpoint::Target(self.cfg.setpoint_mid_mv * force_scale),
            RangeClassification::Far if baseline.captured => {
                Setpoint::Target(baseline.pressure + self.cfg.security_offset_mv)
            }
            // FAR without a capture cannot happen after `FarBaseline::observe`
            RangeClassification::Far => Setpoint::Target(self.cfg.security_offset_mv),
            RangeClassification::OutOfBounds | RangeClassification::Invalid => Setpoint::Invalid,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> SetpointConfig {
        SetpointConfig::default()
    }

    struct Fixed(f32);

    impl AnalogInput for Fixed {
        fn read_mv(&mut self) -> f32 {
            self.0
        }
    }

    #[test]
    fn thresholds_unchanged_at_unit_scale() {
        let t = DynamicThresholds::compute(&cfg(), 1.0);
        assert_eq!(t.as_array(), [100.0, 200.0, 300.0]);
    }

    #[test]
    fn thresholds_at_scale_one_and_a_half() {
        let t = DynamicThresholds::compute(&cfg(), 1.5);
        assert_eq!(t.as_array(), [125.0, 275.0, 450.0]);
        assert_eq!(t.min, 50.0);
    }

    #[test]
    fn thresholds_increase_over_scale_range() {
        let mut s = 0.5f32;
        while s <= 1.5 {
            let t = DynamicThresholds::compute(&cfg(), s);
            assert!(t.min < t.near_mid, "scale {}", s);
            assert!(t.near_mid < t.mid_far, "scale {}", s);
            assert!(t.mid_far < t.far_out, "scale {}", s);
            s += 0.01;
        }
    }

    #[test]
    fn classification_buckets() {
        let t = DynamicThresholds::compute(&cfg(), 1.0);
        assert_eq!(t.classify(-1.0), RangeClassification::Invalid);
        assert_eq!(t.classify(f32::NAN), RangeClassification::Invalid);
        assert_eq!(t.classify(NO_DETECTION_CM), RangeClassification::Invalid);
        assert_eq!(t.classify(20.0), RangeClassification::OutOfBounds);
        assert_eq!(t.classify(50.0), RangeClassification::Near);
        assert_eq!(t.classify(99.9), RangeClassification::Near);
        assert_eq!(t.classify(100.0), RangeClassification::Mid);
        assert_eq!(t.classify(200.0), RangeClassification::Far);
        assert_eq!(t.classify(300.0), RangeClassification::Far);
        assert_eq!(t.classify(300.5), RangeClassification::OutOfBounds);
    }

    #[test]
    fn valid_distances_never_classify_invalid() {
        let t = DynamicThresholds::compute(&cfg(), 0.8);
        let mut d = 0.0f32;
        while d < NO_DETECTION_CM {
            assert_ne!(t.classify(d), RangeClassification::Invalid);
            d += 0.7;
        }
    }

    #[test]
    fn near_and_mid_scale_with_force() {
        let calc = SetpointCalculator::new(cfg());
        let none = FarBaseline::default();
        assert_eq!(calc.setpoint(RangeClassification::Near, 0.6, &none), Setpoint::Target(1200.0));
        assert_eq!(calc.setpoint(RangeClassification::Mid, 1.0, &none), Setpoint::Target(1000.0));
        assert_eq!(calc.setpoint(RangeClassification::OutOfBounds, 1.0, &none), Setpoint::Invalid);
        assert_eq!(Setpoint::Invalid.wire_value(), INVALID_SETPOINT);
    }

    #[test]
    fn far_baseline_captured_on_entry_and_held() {
        let calc = SetpointCalculator::new(cfg());
        let mut baseline = FarBaseline::default();

        baseline.observe(RangeClassification::Mid, RangeClassification::Far, 420.0);
        assert_eq!(calc.setpoint(RangeClassification::Far, 1.0, &baseline), Setpoint::Target(460.0));

        // pressure moves, baseline does not
        baseline.observe(RangeClassification::Far, RangeClassification::Far, 700.0);
        assert_eq!(calc.setpoint(RangeClassification::Far, 1.0, &baseline), Setpoint::Target(460.0));

        // leaving FAR clears it, re-entry captures afresh
        baseline.observe(RangeClassification::Far, RangeClassification::Mid, 700.0);
        assert!(!baseline.captured);
        baseline.observe(RangeClassification::Mid, RangeClassification::Far, 650.0);
        assert_eq!(calc.setpoint(RangeClassification::Far, 1.0, &baseline), Setpoint::Target(690.0));
    }

    #[test]
    fn scale_factors_follow_analog_inputs() {
        let c = cfg();
        let scales = read_scale_factors(&mut Fixed(0.0), &mut Fixed(3300.0), &c);
        assert!((scales.force_scale - 0.6).abs() < 1e-6);
        assert!((scales.distance_scale - 1.5).abs() < 1e-6);

        let scales = ScaleFactors::from_millivolts(1650.0, 1650.0, &c);
        assert!((scales.force_scale - 0.8).abs() < 1e-6);
        assert!((scales.distance_scale - 1.0).abs() < 1e-6);

        let clamped = ScaleFactors::from_millivolts(9000.0, -50.0, &c);
        assert_eq!(clamped.force_scale, 1.0);
        assert_eq!(clamped.distance_scale, 0.5);
    }
}
