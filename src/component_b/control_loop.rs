//! control_loop.rs
//! Fixed-period control context (20 ms, highest priority).
//!
//! Per cycle, before any channel: read both scale inputs, recompute thresholds, fetch the
//! sector readings through the bounded accessor. Then per channel: average the pad pressure,
//! classify, update the FAR baseline, compute the setpoint, run the safety machine, run PI
//! only when the machine allows it, drive the H-bridge and republish telemetry fields.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use average::Mean;
use log::{info, warn};
use spin_sleep::{SpinSleeper, SpinStrategy};

use crate::component_a::sync_manager::SharedState;
use crate::component_b::controller::{MotorCommand, PiController, PiGains};
use crate::component_b::hardware::{AnalogInput, PadDriver};
use crate::component_b::safety::{SafetyAction, SafetyState, SafetyStateMachine, Transition};
use crate::component_b::setpoint::{
    DynamicThresholds, FarBaseline, RangeClassification, ScaleFactors, Setpoint, SetpointCalculator,
    read_scale_factors,
};
use crate::config::{NUM_CHANNELS, SystemConfig};
use crate::utils::metrics::{
    DeadlineComponent, Event, EventRecorder, SharedMetrics, lock_metrics, push_capped, push_capped_u64,
};

/// Everything the control context keeps for one motor / pad.
#[derive(Debug, Clone)]
pub struct Channel {
    pub index: usize,
    pub pi: PiController,
    pub safety: SafetyStateMachine,
    pub range: RangeClassification,
    pub previous_range: RangeClassification,
    pub baseline: FarBaseline,
    pub setpoint: Setpoint,
    pub pressure: f32,
    pub command: MotorCommand,
}

impl Channel {
    /// Safe boot state: NORMAL, integrator 0, classification INVALID, motor braked.
    pub fn new(index: usize, cfg: &SystemConfig) -> Self {
        Self {
            index,
            pi: PiController::from_config(&cfg.control),
            safety: SafetyStateMachine::new(&cfg.safety),
            range: RangeClassification::Invalid,
            previous_range: RangeClassification::Invalid,
            baseline: FarBaseline::default(),
            setpoint: Setpoint::Invalid,
            pressure: 0.0,
            command: MotorCommand::Brake,
        }
    }

    pub fn state(&self) -> SafetyState {
        self.safety.state()
    }

    /// One control step for this channel. Returns the safety transition taken, if any.
    pub fn update(
        &mut self,
        distance_cm: f32,
        pressure: f32,
        thresholds: &DynamicThresholds,
        force_scale: f32,
        calc: &SetpointCalculator,
        now: Instant,
    ) -> Option<Transition> {
        self.previous_range = self.range;
        self.range = thresholds.classify(distance_cm);
        self.pressure = pressure;

        self.baseline.observe(self.previous_range, self.range, pressure);
        self.setpoint = calc.setpoint(self.range, force_scale, &self.baseline);

        let (action, transition) = self.safety.update(self.range.is_valid(), pressure, now);
        if let Some(t) = transition
            && matches!(t.to, SafetyState::Deflating | SafetyState::Normal)
        {
            self.pi.reset();
        }

        self.command = match (action, self.setpoint.target()) {
            (SafetyAction::RunPi, Some(sp)) => self.pi.command(sp, pressure),
            (SafetyAction::RunPi, None) => MotorCommand::Brake,
            (SafetyAction::Override(cmd), _) => cmd,
        };
        transition
    }
}

fn averaged_pressure(pads: &mut (dyn PadDriver + Send), ch: usize, samples: usize) -> f32 {
    let mean: Mean = (0..samples.max(1))
        .map(|_| pads.read_pressure_mv(ch) as f64)
        .collect();
    mean.mean() as f32
}

/// Summary of one cycle, for tests and diagnostics.
#[derive(Debug, Clone)]
pub struct CycleSummary {
    pub scales: ScaleFactors,
    pub thresholds: DynamicThresholds,
    pub ranges: [RangeClassification; NUM_CHANNELS],
    pub states: [SafetyState; NUM_CHANNELS],
    pub commands: [MotorCommand; NUM_CHANNELS],
}

pub struct ControlLoop {
    channels: [Channel; NUM_CHANNELS],
    calc: SetpointCalculator,
    pads: Box<dyn PadDriver + Send>,
    force_input: Box<dyn AnalogInput + Send>,
    distance_input: Box<dyn AnalogInput + Send>,
    pad_samples: usize,
    period: Duration,
    shared: Arc<SharedState>,
    metrics: SharedMetrics,
    event_recorder: Arc<EventRecorder>,
    running: Arc<AtomicBool>,
}

impl ControlLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: &SystemConfig,
        pads: Box<dyn PadDriver + Send>,
        force_input: Box<dyn AnalogInput + Send>,
        distance_input: Box<dyn AnalogInput + Send>,
        shared: Arc<SharedState>,
        metrics: SharedMetrics,
        event_recorder: Arc<EventRecorder>,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            channels: std::array::from_fn(|i| Channel::new(i, cfg)),
            calc: SetpointCalculator::new(cfg.setpoint.clone()),
            pads,
            force_input,
            distance_input,
            pad_samples: cfg.control.pad_samples,
            period: cfg.control.period,
            shared,
            metrics,
            event_recorder,
            running,
        }
    }

    pub fn channel(&self, ch: usize) -> &Channel {
        &self.channels[ch]
    }

    /// New gains for every channel, effective next cycle.
    pub fn set_gains(&mut self, gains: PiGains) {
        for c in &mut self.channels {
            c.pi.set_gains(gains);
        }
        info!("[Control] gains set: Kp={} Ki={}", gains.kp, gains.ki);
    }

    /// One full control cycle at time `now`.
    pub fn step(&mut self, now: Instant) -> CycleSummary {
        let scales = read_scale_factors(
            self.force_input.as_mut(),
            self.distance_input.as_mut(),
            self.calc.config(),
        );
        let thresholds = self.calc.thresholds(&scales);
        self.shared.set_scales(scales.force_scale, scales.distance_scale);
        self.shared.set_thresholds(thresholds.as_array());

        let sectors = self.shared.sectors();

        for (ch, channel) in self.channels.iter_mut().enumerate() {
            let pressure = averaged_pressure(self.pads.as_mut(), ch, self.pad_samples);
            let transition = channel.update(
                sectors[ch].distance_cm,
                pressure,
                &thresholds,
                scales.force_scale,
                &self.calc,
                now,
            );

            if let Some(t) = transition {
                info!(
                    "[Control] ch{} {} -> {} (range {}, {:.0} mV)",
                    ch,
                    t.from.name(),
                    t.to.name(),
                    channel.range.name(),
                    pressure
                );
                self.event_recorder.record(Event::SafetyTransition {
                    ts_ns: self.event_recorder.now_ns(),
                    channel: ch,
                    from: t.from.name(),
                    to: t.to.name(),
                });
                lock_metrics(&self.metrics).safety_transitions += 1;
            }

            self.pads.apply(ch, channel.command);
            self.shared.set_channel(
                ch,
                channel.setpoint.wire_value(),
                pressure,
                channel.command.signed_duty(),
            );
        }

        CycleSummary {
            scales,
            thresholds,
            ranges: std::array::from_fn(|i| self.channels[i].range),
            states: std::array::from_fn(|i| self.channels[i].state()),
            commands: std::array::from_fn(|i| self.channels[i].command),
        }
    }

    /// Periodic loop until `running` is cleared. Absolute deadlines; overruns are counted.
    pub fn run(&mut self) {
        let sleeper = SpinSleeper::new(100_000).with_spin_strategy(SpinStrategy::YieldThread);
        let period_us = self.period.as_micros() as u64;
        let mut next_deadline = Instant::now() + self.period;
        let mut last_release = Instant::now();
        info!("[Control] started, period {:?}", self.period);

        while self.running.load(Ordering::Acquire) {
            let now = Instant::now();
            if now < next_deadline {
                sleeper.sleep(next_deadline - now);
            } else {
                self.deadline_miss((now - next_deadline).as_micros() as u64);
            }

            let release = Instant::now();
            let jitter_us = (release.duration_since(last_release).as_micros() as u64).abs_diff(period_us);
            last_release = release;

            let summary = self.step(release);
            let exec_us = release.elapsed().as_micros() as u64;

            self.event_recorder.record(Event::ControlCycle {
                ts_ns: self.event_recorder.now_ns(),
                exec_us,
                distance_scale: summary.scales.distance_scale,
            });
            {
                let mut m = lock_metrics(&self.metrics);
                m.total_cycles += 1;
                push_capped_u64(&mut m.cycle_us, exec_us);
                push_capped_u64(&mut m.jitter_us, jitter_us);
                for (ch, channel) in self.channels.iter().enumerate() {
                    push_capped(&mut m.pressure[ch], channel.pressure as f64);
                    push_capped(&mut m.duty[ch], channel.command.signed_duty() as f64);
                }
            }

            if exec_us > period_us {
                warn!("[Control] cycle overran: {} µs", exec_us);
            }
            next_deadline += self.period;
        }

        // leave every pad braked
        for ch in 0..NUM_CHANNELS {
            self.pads.apply(ch, MotorCommand::Brake);
        }
        info!("[Control] stopped.");
    }

    fn deadline_miss(&self, late_us: u64) {
        self.event_recorder.record(Event::DeadlineMiss {
            ts_ns: self.event_recorder.now_ns(),
            component: DeadlineComponent::Control,
            late_us,
        });
        lock_metrics(&self.metrics).record_deadline_miss(DeadlineComponent::Control);
        warn!("[Control] released {} µs late", late_us);
    }
}
