//! command.rs
//! Runtime command channel: newline-terminated `CATEGORY:ACTION[:PARAM]` lines.
//!
//! Every accepted command mutates `RuntimeParams` and answers `ACK:...`; every rejected one
//! answers `ERR:<KIND>:<detail>` and changes nothing. The handler never touches the sector
//! lock, so a burst of commands cannot delay acquisition or control.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use crossbeam::channel::{Receiver, RecvTimeoutError};
use log::{info, warn};

use crate::component_a::sync_manager::{RuntimeParams, SharedState};
use crate::config::{SERVO_STEP_MAX, SERVO_TIMING_MAX_MS, SweepMode};
use crate::error::CommandError;
use crate::utils::metrics::{Event, EventRecorder};

/// Parsed command, validated for syntax but not yet against current state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    SweepEnable,
    SweepDisable,
    SweepMin(u8),
    SweepMax(u8),
    SweepStep(u8),
    SweepSettle(u32),
    SweepDelay(u32),
    SweepMode(SweepMode),
    SweepStatus,
    ServoAngle(u8),
}

fn parse_number(param: &'static str, raw: Option<&str>) -> Result<i64, CommandError> {
    let raw = raw.unwrap_or("");
    raw.trim().parse::<i64>().map_err(|_| CommandError::InvalidValue {
        param,
        raw: raw.to_string(),
    })
}

fn in_range(param: &'static str, value: i64, lo: i64, hi: i64) -> Result<i64, CommandError> {
    if (lo..=hi).contains(&value) {
        Ok(value)
    } else {
        Err(CommandError::OutOfRange { param, value })
    }
}

impl Command {
    /// Parses one trimmed line. Angles are checked against `span`, other values against
    /// their fixed limits.
    pub fn parse(line: &str, span: (u8, u8)) -> Result<Self, CommandError> {
        let line = line.trim();
        let mut parts = line.splitn(3, ':');
        let category = parts.next().unwrap_or("").to_ascii_uppercase();
        let action = parts.next().unwrap_or("").to_ascii_uppercase();
        let param = parts.next();

        let angle = |raw| -> Result<u8, CommandError> {
            let v = parse_number("ANGLE", raw)?;
            Ok(in_range("ANGLE", v, span.0 as i64, span.1 as i64)? as u8)
        };
        let timing = |name, raw| -> Result<u32, CommandError> {
            let v = parse_number(name, raw)?;
            Ok(in_range(name, v, 0, SERVO_TIMING_MAX_MS as i64)? as u32)
        };

        match (category.as_str(), action.as_str()) {
            ("SWEEP", "ENABLE") => Ok(Command::SweepEnable),
            ("SWEEP", "DISABLE") => Ok(Command::SweepDisable),
            ("SWEEP", "STATUS") => Ok(Command::SweepStatus),
            ("SWEEP", "MIN") => Ok(Command::SweepMin(angle(param)?)),
            ("SWEEP", "MAX") => Ok(Command::SweepMax(angle(param)?)),
            ("SWEEP", "STEP") => {
                let v = parse_number("STEP", param)?;
                Ok(Command::SweepStep(in_range("STEP", v, 1, SERVO_STEP_MAX as i64)? as u8))
            }
            ("SWEEP", "SETTLE") => Ok(Command::SweepSettle(timing("SETTLE", param)?)),
            ("SWEEP", "DELAY") => Ok(Command::SweepDelay(timing("DELAY", param)?)),
            ("SWEEP", "MODE") => match param.map(|p| p.trim().to_ascii_uppercase()).as_deref() {
                Some("FORWARD") => Ok(Command::SweepMode(SweepMode::Forward)),
                Some("BIDIRECTIONAL") => Ok(Command::SweepMode(SweepMode::Bidirectional)),
                other => Err(CommandError::InvalidValue {
                    param: "MODE",
                    raw: other.unwrap_or("").to_string(),
                }),
            },
            ("SERVO", "ANGLE") => Ok(Command::ServoAngle(angle(param)?)),
            _ => Err(CommandError::InvalidCommand(line.to_string())),
        }
    }

    /// Applies a parsed command. State-dependent checks happen here; on error nothing changes.
    pub fn apply(self, params: &RuntimeParams) -> Result<String, CommandError> {
        match self {
            Command::SweepEnable => {
                params.set_sweep_enabled(true);
                Ok("ACK:SWEEP:ENABLED".to_string())
            }
            Command::SweepDisable => {
                params.set_sweep_enabled(false);
                Ok("ACK:SWEEP:DISABLED".to_string())
            }
            Command::SweepMin(min) => {
                let max = params.max_angle();
                if min >= max {
                    return Err(CommandError::InvalidRange { min, max });
                }
                params.set_min_angle(min);
                Ok(format!("ACK:SWEEP:MIN:{}", min))
            }
            Command::SweepMax(max) => {
                let min = params.min_angle();
                if min >= max {
                    return Err(CommandError::InvalidRange { min, max });
                }
                params.set_max_angle(max);
                Ok(format!("ACK:SWEEP:MAX:{}", max))
            }
            Command::SweepStep(step) => {
                params.set_step(step);
                Ok(format!("ACK:SWEEP:STEP:{}", step))
            }
            Command::SweepSettle(ms) => {
                params.set_settle_ms(ms);
                Ok(format!("ACK:SWEEP:SETTLE:{}", ms))
            }
            Command::SweepDelay(ms) => {
                params.set_reading_delay_ms(ms);
                Ok(format!("ACK:SWEEP:DELAY:{}", ms))
            }
            Command::SweepMode(mode) => {
                params.set_mode(mode);
                Ok(format!("ACK:SWEEP:MODE:{}", mode.name()))
            }
            Command::SweepStatus => Ok(status_line(params)),
            Command::ServoAngle(angle) => {
                if params.sweep_enabled() {
                    return Err(CommandError::SweepActive);
                }
                params.set_manual_angle(angle);
                Ok(format!("ACK:SERVO:ANGLE:{}", angle))
            }
        }
    }
}

fn status_line(params: &RuntimeParams) -> String {
    let p = params.snapshot();
    if p.enabled {
        format!(
            "ACK:SWEEP:STATUS:ENABLED:{}:{}:{}:{}:{}:{}",
            p.min_angle,
            p.max_angle,
            p.step,
            p.mode.name(),
            p.settle_ms,
            p.reading_delay_ms
        )
    } else {
        format!("ACK:SWEEP:STATUS:DISABLED:{}", p.manual_angle)
    }
}

pub struct CommandHandler {
    shared: Arc<SharedState>,
    span: (u8, u8),
    event_recorder: Arc<EventRecorder>,
}

impl CommandHandler {
    /// `span` is the angle range covered by the sector map.
    pub fn new(shared: Arc<SharedState>, span: (u8, u8), event_recorder: Arc<EventRecorder>) -> Self {
        Self { shared, span, event_recorder }
    }

    pub fn execute(&self, line: &str) -> Result<String, CommandError> {
        Command::parse(line, self.span)?.apply(&self.shared.params)
    }

    /// Wire response for one line; `None` for blank lines.
    pub fn handle(&self, line: &str) -> Option<String> {
        if line.trim().is_empty() {
            return None;
        }
        let result = self.execute(line);
        self.event_recorder.record(Event::Command {
            ts_ns: self.event_recorder.now_ns(),
            accepted: result.is_ok(),
        });
        Some(match result {
            Ok(ack) => {
                info!("[Command] {} -> {}", line.trim(), ack);
                ack
            }
            Err(err) => {
                warn!("[Command] {} rejected: {}", line.trim(), err);
                err.to_string()
            }
        })
    }

    /// Handles lines from `lines` until `running` is cleared or every sender is gone, passing
    /// each response to `respond`. A line that arrives after `running` was cleared is not
    /// executed; it is handed back so the next reader of the shared input gets it.
    pub fn serve(
        &self,
        lines: &Receiver<String>,
        running: &AtomicBool,
        mut respond: impl FnMut(String),
    ) -> Option<String> {
        while running.load(Ordering::Acquire) {
            match lines.recv_timeout(SERVE_POLL) {
                Ok(line) => {
                    if !running.load(Ordering::Acquire) {
                        return Some(line);
                    }
                    if let Some(response) = self.handle(&line) {
                        respond(response);
                    }
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        None
    }
}

const SERVE_POLL: Duration = Duration::from_millis(50);
