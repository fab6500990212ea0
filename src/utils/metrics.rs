//! Metrics collection and event recording for the controller's real-time loops.
//!
//! Two independent paths:
//! - **EventRecorder:** Lock-free queue (16K capacity) → background CSV export (nanosecond precision).
//! - **Metrics:** Shared mutex buffer summarised at the end of a run (bounded to 1000 points per metric).
//!
//! Event tracing captures: sector publish / lock timeout → control cycle → safety transitions
//! → telemetry frame sent or dropped, plus every deadline miss and runtime command.

use std::{
    collections::VecDeque,
    fs::File,
    io::{BufWriter, Write},
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicU64, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use crossbeam_queue::ArrayQueue;
use log::error;

use crate::config::NUM_CHANNELS;

/// Trace events. Timestamps are nanoseconds since the recorder was created.
#[derive(Debug, Clone)]
pub enum Event {
    /// Acquisition published a completed sector.
    SectorPublished {
        ts_ns: u64,
        sector: usize,
        distance_cm: f32,
        angle: u8,
    },
    /// Sector lock not acquired within the bound; publish skipped.
    LockTimeout {
        ts_ns: u64,
        sector: usize,
    },
    /// One control cycle over all channels.
    ControlCycle {
        ts_ns: u64,
        exec_us: u64,
        distance_scale: f32,
    },
    /// A channel's safety machine changed state.
    SafetyTransition {
        ts_ns: u64,
        channel: usize,
        from: &'static str,
        to: &'static str,
    },
    /// A periodic loop released late or overran its period.
    DeadlineMiss {
        ts_ns: u64,
        component: DeadlineComponent,
        late_us: u64,
    },
    /// Telemetry frame handed to the sink.
    FrameSent {
        ts_ns: u64,
        bytes: usize,
    },
    /// Telemetry sink full or gone; frame discarded.
    FrameDropped {
        ts_ns: u64,
    },
    /// Runtime command processed.
    Command {
        ts_ns: u64,
        accepted: bool,
    },
}

impl Event {
    /// CSV row: seq,component,event,ts_ns,field1,field2,field3
    pub fn to_csv_row(&self, seq: u64) -> String {
        match self {
            Event::SectorPublished { ts_ns, sector, distance_cm, angle } => {
                format!("{},acquisition,SectorPublished,{},{},{},{}", seq, ts_ns, sector, distance_cm, angle)
            }
            Event::LockTimeout { ts_ns, sector } => {
                format!("{},acquisition,LockTimeout,{},{},,", seq, ts_ns, sector)
            }
            Event::ControlCycle { ts_ns, exec_us, distance_scale } => {
                format!("{},control,ControlCycle,{},{},{},", seq, ts_ns, exec_us, distance_scale)
            }
            Event::SafetyTransition { ts_ns, channel, from, to } => {
                format!("{},control,SafetyTransition,{},{},{},{}", seq, ts_ns, channel, from, to)
            }
            Event::DeadlineMiss { ts_ns, component, late_us } => {
                format!("{},{},DeadlineMiss,{},{},,", seq, component.name(), ts_ns, late_us)
            }
            Event::FrameSent { ts_ns, bytes } => {
                format!("{},telemetry,FrameSent,{},{},,", seq, ts_ns, bytes)
            }
            Event::FrameDropped { ts_ns } => {
                format!("{},telemetry,FrameDropped,{},,,", seq, ts_ns)
            }
            Event::Command { ts_ns, accepted } => {
                format!("{},command,Command,{},{},,", seq, ts_ns, accepted)
            }
        }
    }
}

const EVENT_QUEUE_CAPACITY: usize = 16_384;

/// Non-blocking event recorder with background CSV export.
///
/// `record()` stamps a sequence number and appends to a lock-free queue; it never blocks and
/// silently drops when the queue is full. `start_exporter()` drains the queue into a CSV file.
pub struct EventRecorder {
    queue: Arc<ArrayQueue<(u64, Event)>>,
    seq: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
    run_start: Instant,
}

impl EventRecorder {
    pub fn new() -> Self {
        Self {
            queue: Arc::new(ArrayQueue::new(EVENT_QUEUE_CAPACITY)),
            seq: Arc::new(AtomicU64::new(1)),
            dropped: Arc::new(AtomicU64::new(0)),
            run_start: Instant::now(),
        }
    }

    #[inline]
    pub fn record(&self, event: Event) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        if self.queue.push((seq, event)).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Nanosecond timestamp since recorder creation.
    #[inline]
    pub fn now_ns(&self) -> u64 {
        self.run_start.elapsed().as_nanos() as u64
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Pops everything currently queued. Tests and shutdown only.
    pub fn drain(&self) -> Vec<(u64, Event)> {
        std::iter::from_fn(|| self.queue.pop()).collect()
    }

    /// Spawns a background thread draining the queue into `output_csv` until `running` is
    /// cleared and the queue is empty.
    pub fn start_exporter(
        &self,
        output_csv: String,
        running: Arc<std::sync::atomic::AtomicBool>,
    ) -> thread::JoinHandle<()> {
        let queue = self.queue.clone();

        thread::spawn(move || {
            let file = match File::create(&output_csv) {
                Ok(file) => file,
                Err(e) => {
                    error!("Failed to create event CSV {}: {}", output_csv, e);
                    return;
                }
            };
            let mut writer = BufWriter::new(file);
            let _ = writeln!(writer, "seq,component,event,ts_ns,field1,field2,field3");

            loop {
                match queue.pop() {
                    Some((seq, event)) => {
                        let _ = writeln!(writer, "{}", event.to_csv_row(seq));
                    }
                    None => {
                        if !running.load(Ordering::Acquire) && queue.is_empty() {
                            break;
                        }
                        thread::sleep(Duration::from_millis(10));
                    }
                }
            }

            let _ = writer.flush();
        })
    }
}

impl Default for EventRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for EventRecorder {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            seq: self.seq.clone(),
            dropped: self.dropped.clone(),
            run_start: self.run_start,
        }
    }
}

/// Run metrics: pad pressures, duties, sector minimums, loop timing, deadline misses.
/// Updated by the loops; bounded to 1000 most recent points per buffer.
/// Lock timeouts and frame counts live in `SharedState`, where the hot paths count them.
#[derive(Default, Clone)]
pub struct Metrics {
    /// Per-channel pad pressure (mV) and signed duty (%), one point per control cycle.
    pub pressure: [VecDeque<f64>; NUM_CHANNELS],
    pub duty: [VecDeque<f64>; NUM_CHANNELS],
    /// Per-sector published minimum distance (cm).
    pub sector_distance: [VecDeque<f64>; NUM_CHANNELS],

    /// Control cycle execution time and release jitter (µs).
    pub cycle_us: VecDeque<u64>,
    pub jitter_us: VecDeque<u64>,
    /// Duration of one sweep step including settle and reading delay (µs).
    pub sweep_step_us: VecDeque<u64>,

    /// Deadline miss counters per component.
    pub miss_acquisition: u64,
    pub miss_control: u64,
    pub miss_telemetry: u64,
    pub deadline_miss: u64,

    pub total_cycles: u64,
    pub sweep_steps: u64,
    pub sectors_published: u64,
    pub safety_transitions: u64,
}

/// Component identifier for deadline miss attribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlineComponent {
    Acquisition,
    Control,
    Telemetry,
}

impl DeadlineComponent {
    pub fn name(self) -> &'static str {
        match self {
            DeadlineComponent::Acquisition => "acquisition",
            DeadlineComponent::Control => "control",
            DeadlineComponent::Telemetry => "telemetry",
        }
    }
}

impl Metrics {
    /// Records deadline miss for specified component; updates total count.
    pub fn record_deadline_miss(&mut self, component: DeadlineComponent) {
        match component {
            DeadlineComponent::Acquisition => self.miss_acquisition += 1,
            DeadlineComponent::Control => self.miss_control += 1,
            DeadlineComponent::Telemetry => self.miss_telemetry += 1,
        }
        self.deadline_miss += 1;
    }
}

pub type SharedMetrics = Arc<Mutex<Metrics>>;

/// Locks the metrics, recovering the data if a panicking thread poisoned the mutex.
#[inline]
pub fn lock_metrics(metrics: &SharedMetrics) -> MutexGuard<'_, Metrics> {
    match metrics.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub const MAX_POINTS: usize = 1_000;

/// Appends value to metrics buffer; removes oldest if at capacity (FIFO).
#[inline]
pub fn push_capped(buf: &mut VecDeque<f64>, val: f64) {
    if buf.len() >= MAX_POINTS {
        buf.pop_front();
    }
    buf.push_back(val);
}

/// Appends u64 value to metrics buffer; removes oldest if at capacity.
#[inline]
pub fn push_capped_u64(buf: &mut VecDeque<u64>, val: u64) {
    if buf.len() >= MAX_POINTS {
        buf.pop_front();
    }
    buf.push_back(val);
}

/// Statistics summary for a dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct Stats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub count: usize,
}

/// Computes min, max, mean for float buffer.
pub fn calculate_stats(data: &VecDeque<f64>) -> Option<Stats> {
    if data.is_empty() {
        return None;
    }

    let count = data.len();
    let min = data.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = data.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let mean = data.iter().sum::<f64>() / count as f64;

    Some(Stats { min, max, mean, count })
}

/// Computes min, max, mean for u64 buffer (cast to f64).
pub fn calculate_stats_u64(data: &VecDeque<u64>) -> Option<Stats> {
    if data.is_empty() {
        return None;
    }

    let count = data.len();
    let min = data.iter().map(|&x| x as f64).fold(f64::INFINITY, f64::min);
    let max = data.iter().map(|&x| x as f64).fold(f64::NEG_INFINITY, f64::max);
    let mean = data.iter().map(|&x| x as f64).sum::<f64>() / count as f64;

    Some(Stats { min, max, mean, count })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_capped_keeps_most_recent() {
        let mut buf = VecDeque::new();
        for i in 0..(MAX_POINTS + 10) {
            push_capped(&mut buf, i as f64);
        }
        assert_eq!(buf.len(), MAX_POINTS);
        assert_eq!(buf.front(), Some(&10.0));
    }

    #[test]
    fn stats_over_buffer() {
        let buf: VecDeque<f64> = [2.0, 4.0, 9.0].into_iter().collect();
        let s = calculate_stats(&buf).unwrap();
        assert_eq!((s.min, s.max, s.mean, s.count), (2.0, 9.0, 5.0, 3));
        assert!(calculate_stats(&VecDeque::new()).is_none());
    }

    #[test]
    fn recorder_stamps_increasing_sequence() {
        let rec = EventRecorder::new();
        rec.record(Event::FrameDropped { ts_ns: rec.now_ns() });
        rec.record(Event::LockTimeout { ts_ns: rec.now_ns(), sector: 2 });
        let events = rec.drain();
        assert_eq!(events.len(), 2);
        assert!(events[0].0 < events[1].0);
        assert!(events[1].1.to_csv_row(events[1].0).contains(",acquisition,LockTimeout,"));
    }

    #[test]
    fn deadline_misses_attributed() {
        let mut m = Metrics::default();
        m.record_deadline_miss(DeadlineComponent::Acquisition);
        m.record_deadline_miss(DeadlineComponent::Control);
        m.record_deadline_miss(DeadlineComponent::Telemetry);
        assert_eq!((m.miss_acquisition, m.miss_control, m.miss_telemetry), (1, 1, 1));
        assert_eq!(m.deadline_miss, 3);
    }
}
