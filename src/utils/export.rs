//! Run exports: a summary CSV of the run metrics and a frame log CSV of decoded telemetry.
//!
//! - `summary.csv`: metric,value,description rows: deadline misses, cycle timing, per-channel
//!   pressure / duty statistics, sector publishes, lock timeouts, frames sent / dropped.
//! - `frames.csv`: one row per telemetry frame that passed length, header and CRC checks.
//!   Frames that fail are counted and skipped, never repaired.

use std::{
    fs::create_dir_all,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam::channel::{Receiver, RecvTimeoutError};
use csv::Writer;
use log::{error, info, warn};
use serde::Serialize;

use crate::component_a::sync_manager::SharedState;
use crate::component_a::telemetry::{TelemetryFrame, decode};
use crate::config::NUM_CHANNELS;
use crate::utils::metrics::{SharedMetrics, calculate_stats, calculate_stats_u64, lock_metrics};

/// Batch size between flushes of the frame log.
const FLUSH_EVERY: u64 = 20;
const RECV_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Serialize)]
struct SummaryRow {
    metric: String,
    value: f64,
    description: &'static str,
}

fn row(metric: impl Into<String>, value: f64, description: &'static str) -> SummaryRow {
    SummaryRow { metric: metric.into(), value, description }
}

/// Writes `summary.csv` under `dir`.
pub fn export_summary_csv(metrics: &SharedMetrics, shared: &SharedState, dir: &Path) -> Result<PathBuf, csv::Error> {
    create_dir_all(dir)?;
    let path = dir.join("summary.csv");
    let mut writer = Writer::from_path(&path)?;

    let m = lock_metrics(metrics);
    let mut rows = vec![
        row("control_cycles", m.total_cycles as f64, "Control cycles executed"),
        row("deadline_misses", m.deadline_miss as f64, "Total deadline miss events"),
        row("miss_acquisition", m.miss_acquisition as f64, "Acquisition deadline misses"),
        row("miss_control", m.miss_control as f64, "Control deadline misses"),
        row("miss_telemetry", m.miss_telemetry as f64, "Telemetry deadline misses"),
        row("sweep_steps", m.sweep_steps as f64, "Servo steps sampled"),
        row("sectors_published", m.sectors_published as f64, "Completed sectors published"),
        row("lock_timeouts", shared.lock_timeouts() as f64, "Sector lock waits that hit the bound"),
        row("skipped_publishes", shared.skipped_publishes() as f64, "Sector publishes lost to timeouts"),
        row("safety_transitions", m.safety_transitions as f64, "Safety state changes, all channels"),
        row("frames_sent", shared.frames_sent() as f64, "Telemetry frames queued"),
        row("frames_dropped", shared.frames_dropped() as f64, "Telemetry frames dropped at the sink"),
    ];

    if let Some(s) = calculate_stats_u64(&m.cycle_us) {
        rows.push(row("cycle_avg_us", s.mean, "Average control cycle execution"));
        rows.push(row("cycle_max_us", s.max, "Worst control cycle execution"));
    }
    if let Some(s) = calculate_stats_u64(&m.jitter_us) {
        rows.push(row("jitter_avg_us", s.mean, "Average control release jitter"));
        rows.push(row("jitter_max_us", s.max, "Maximum control release jitter"));
    }
    if let Some(s) = calculate_stats_u64(&m.sweep_step_us) {
        rows.push(row("sweep_step_avg_us", s.mean, "Average sweep step duration"));
    }
    for ch in 0..NUM_CHANNELS {
        if let Some(s) = calculate_stats(&m.pressure[ch]) {
            rows.push(row(format!("ch{}_pressure_avg_mv", ch), s.mean, "Average pad pressure"));
            rows.push(row(format!("ch{}_pressure_max_mv", ch), s.max, "Peak pad pressure"));
        }
        if let Some(s) = calculate_stats(&m.duty[ch]) {
            rows.push(row(format!("ch{}_duty_avg_pct", ch), s.mean, "Average signed duty"));
        }
        if let Some(s) = calculate_stats(&m.sector_distance[ch]) {
            rows.push(row(format!("ch{}_distance_min_cm", ch), s.min, "Closest published sector minimum"));
        }
    }
    drop(m);

    for r in rows {
        writer.serialize(r)?;
    }
    writer.flush()?;
    info!("Summary metrics exported to: {:?}", path);
    Ok(path)
}

const _: () = assert!(NUM_CHANNELS == 4, "FrameRow has one column per channel");

#[derive(Debug, Serialize)]
struct FrameRow {
    seq: u64,
    timestamp_ms: u32,
    mode: u8,
    scan_angle: u8,
    live_cm: f32,
    sp0: f32,
    sp1: f32,
    sp2: f32,
    sp3: f32,
    p0: f32,
    p1: f32,
    p2: f32,
    p3: f32,
    duty0: f32,
    duty1: f32,
    duty2: f32,
    duty3: f32,
    dist0: f32,
    dist1: f32,
    dist2: f32,
    dist3: f32,
    sensor_flags: Option<u8>,
    force_scale: Option<f32>,
    distance_scale: Option<f32>,
}

impl FrameRow {
    fn new(seq: u64, f: &TelemetryFrame) -> Self {
        Self {
            seq,
            timestamp_ms: f.timestamp_ms,
            mode: f.mode,
            scan_angle: f.scan_angle,
            live_cm: f.live_reading,
            sp0: f.setpoints[0],
            sp1: f.setpoints[1],
            sp2: f.setpoints[2],
            sp3: f.setpoints[3],
            p0: f.pressures[0],
            p1: f.pressures[1],
            p2: f.pressures[2],
            p3: f.pressures[3],
            duty0: f.duties[0],
            duty1: f.duties[1],
            duty2: f.duties[2],
            duty3: f.duties[3],
            dist0: f.distances[0],
            dist1: f.distances[1],
            dist2: f.distances[2],
            dist3: f.distances[3],
            sensor_flags: f.extended.map(|e| e.sensor_flags),
            force_scale: f.extended.map(|e| e.force_scale),
            distance_scale: f.extended.map(|e| e.distance_scale),
        }
    }
}

/// Counts from one frame logger run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameLogStats {
    pub accepted: u64,
    pub rejected: u64,
}

/// Consumer side of the telemetry sink: validates every frame and logs the good ones to
/// `path`. Exits once `running` is cleared and the channel is drained, or when every sender
/// is gone.
pub fn spawn_frame_logger(rx: Receiver<Vec<u8>>, path: PathBuf, running: Arc<AtomicBool>) -> JoinHandle<FrameLogStats> {
    thread::spawn(move || {
        let mut stats = FrameLogStats::default();
        let mut writer = match Writer::from_path(&path) {
            Ok(w) => Some(w),
            Err(e) => {
                error!("Failed to create frame log {:?}: {}", path, e);
                None
            }
        };

        loop {
            let bytes = match rx.recv_timeout(RECV_POLL) {
                Ok(bytes) => bytes,
                Err(RecvTimeoutError::Timeout) => {
                    if running.load(Ordering::Acquire) {
                        continue;
                    }
                    break;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            };

            match decode(&bytes) {
                Ok(frame) => {
                    stats.accepted += 1;
                    let failed = match writer.as_mut() {
                        Some(w) => match w.serialize(FrameRow::new(stats.accepted, &frame)) {
                            Ok(()) => {
                                if stats.accepted % FLUSH_EVERY == 0 {
                                    let _ = w.flush();
                                }
                                false
                            }
                            Err(e) => {
                                error!("Frame log write failed: {}", e);
                                true
                            }
                        },
                        None => false,
                    };
                    if failed {
                        writer = None;
                    }
                }
                Err(e) => {
                    stats.rejected += 1;
                    warn!("[FrameLog] frame rejected: {}", e);
                }
            }
        }

        if let Some(mut w) = writer {
            let _ = w.flush();
        }
        info!("[FrameLog] {} frames logged, {} rejected", stats.accepted, stats.rejected);
        stats
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SweepConfig;
    use crossbeam::channel::bounded;

    fn temp_dir(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("rts_pad_control_{}_{}", name, std::process::id()))
    }

    #[test]
    fn frame_logger_counts_good_and_bad_frames() {
        let shared = SharedState::new(&SweepConfig::default());
        let good = TelemetryFrame::snapshot(&shared, true).encode();
        let mut bad = good.clone();
        bad[10] ^= 0xFF;

        let dir = temp_dir("frames");
        create_dir_all(&dir).unwrap();
        let (tx, rx) = bounded(8);
        let running = Arc::new(AtomicBool::new(true));
        let handle = spawn_frame_logger(rx, dir.join("frames.csv"), running.clone());

        tx.send(good.clone()).unwrap();
        tx.send(bad).unwrap();
        tx.send(good).unwrap();
        drop(tx);

        let stats = handle.join().unwrap();
        assert_eq!(stats, FrameLogStats { accepted: 2, rejected: 1 });

        let text = std::fs::read_to_string(dir.join("frames.csv")).unwrap();
        assert_eq!(text.lines().count(), 3);
        let header = text.lines().next().unwrap();
        assert!(header.starts_with("seq,timestamp_ms,mode,scan_angle,live_cm,sp0,sp1,sp2,sp3,p0,"));
        assert_eq!(header.split(',').filter(|c| c.starts_with("dist")).count(), NUM_CHANNELS);
    }

    #[test]
    fn summary_has_core_rows() {
        let shared = SharedState::new(&SweepConfig::default());
        let metrics = SharedMetrics::default();
        {
            let mut m = lock_metrics(&metrics);
            m.total_cycles = 50;
            m.record_deadline_miss(crate::utils::metrics::DeadlineComponent::Acquisition);
        }

        let dir = temp_dir("summary");
        let path = export_summary_csv(&metrics, &shared, &dir).unwrap();
        let text = std::fs::read_to_string(path).unwrap();
        assert!(text.starts_with("metric,value,description"));
        assert!(text.contains("control_cycles,50.0,"));
        assert!(text.contains("miss_acquisition,1.0,"));
    }
}
