//! safety.rs
//! Per-channel out-of-range safety machine. Always overrides the PI output.
//!
//! NORMAL ──invalid──▶ DEFLATING ──p < safe──▶ RELEASING ──release time──▶ WAITING
//!   ▲                    │ valid                 │ valid                     │ valid && p < safe
//!   └────────────────────┴───────────────────────┴───────────────────────────┘
//! WAITING ──p >= safe──▶ DEFLATING
//!
//! DEFLATING and RELEASING reverse at a fixed duty; WAITING brakes.

use std::time::{Duration, Instant};

use crate::component_b::controller::MotorCommand;
use crate::config::SafetyConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafetyState {
    Normal,
    Deflating,
    Releasing,
    Waiting,
}

impl SafetyState {
    pub fn name(self) -> &'static str {
        match self {
            SafetyState::Normal => "NORMAL",
            SafetyState::Deflating => "DEFLATING",
            SafetyState::Releasing => "RELEASING",
            SafetyState::Waiting => "WAITING",
        }
    }
}

/// What the channel does this cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SafetyAction {
    /// Use the PI controller's command.
    RunPi,
    /// Ignore the PI controller and apply this.
    Override(MotorCommand),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transition {
    pub from: SafetyState,
    pub to: SafetyState,
}

#[derive(Debug, Clone)]
pub struct SafetyStateMachine {
    state: SafetyState,
    release_started: Option<Instant>,
    safe_pressure: f32,
    release_time: Duration,
    reverse_duty: f32,
}

impl SafetyStateMachine {
    pub fn new(cfg: &SafetyConfig) -> Self {
        Self {
            state: SafetyState::Normal,
            release_started: None,
            safe_pressure: cfg.safe_pressure_mv,
            release_time: cfg.release_time,
            reverse_duty: cfg.reverse_duty,
        }
    }

    #[inline]
    pub fn state(&self) -> SafetyState {
        self.state
    }

    fn is_safe(&self, pressure: f32) -> bool {
        pressure < self.safe_pressure
    }

    /// Advances one cycle. `valid` is whether the range classification produced a setpoint.
    /// Returns the action for this cycle and the transition taken, if any.
    pub fn update(&mut self, valid: bool, pressure: f32, now: Instant) -> (SafetyAction, Option<Transition>) {
        let from = self.state;
        let next = match self.state {
            SafetyState::Normal if !valid => SafetyState::Deflating,
            SafetyState::Normal => SafetyState::Normal,

            SafetyState::Deflating if valid => SafetyState::Normal,
            SafetyState::Deflating if self.is_safe(pressure) => {
                self.release_started = Some(now);
                SafetyState::Releasing
            }
            SafetyState::Deflating => SafetyState::Deflating,

            SafetyState::Releasing if valid => SafetyState::Normal,
            SafetyState::Releasing => {
                let started = *self.release_started.get_or_insert(now);
                if now.saturating_duration_since(started) >= self.release_time {
                    SafetyState::Waiting
                } else {
                    SafetyState::Releasing
                }
            }

            SafetyState::Waiting if valid && self.is_safe(pressure) => SafetyState::Normal,
            SafetyState::Waiting if !self.is_safe(pressure) => SafetyState::Deflating,
            SafetyState::Waiting => SafetyState::Waiting,
        };

        if next != SafetyState::Releasing {
            self.release_started = None;
        }
        self.state = next;

        let action = match next {
            SafetyState::Normal => SafetyAction::RunPi,
            SafetyState::Deflating | SafetyState::Releasing => {
                SafetyAction::Override(MotorCommand::Reverse(self.reverse_duty))
            }
            SafetyState::Waiting => SafetyAction::Override(MotorCommand::Brake),
        };
        let transition = (from != next).then_some(Transition { from, to: next });
        (action, transition)
    }
}
