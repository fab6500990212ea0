//! transmitter.rs
//! Periodic telemetry: snapshot → frame → sink, on its own period and priority.
//! - non-blocking `try_send`; a full or disconnected sink drops the frame (counted)
//! - runs beside acquisition at the lowest priority, slower than control

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use crossbeam::channel::Sender;
use log::{debug, info, warn};
use spin_sleep::{SpinSleeper, SpinStrategy};

use crate::component_a::sync_manager::SharedState;
use crate::component_a::telemetry::TelemetryFrame;
use crate::utils::metrics::{DeadlineComponent, Event, EventRecorder, SharedMetrics, lock_metrics};

#[derive(Clone)]
pub struct Transmitter {
    tx: Sender<Vec<u8>>,
    shared: Arc<SharedState>,
    event_recorder: Arc<EventRecorder>,
}

impl Transmitter {
    pub fn new(tx: Sender<Vec<u8>>, shared: Arc<SharedState>, event_recorder: Arc<EventRecorder>) -> Self {
        Self { tx, shared, event_recorder }
    }

    /// Hands one encoded frame to the sink. Returns whether it was queued.
    pub fn transmit(&self, frame: Vec<u8>) -> bool {
        let bytes = frame.len();
        let ts_ns = self.event_recorder.now_ns();
        match self.tx.try_send(frame) {
            Ok(()) => {
                self.shared.record_frame_sent();
                self.event_recorder.record(Event::FrameSent { ts_ns, bytes });
                true
            }
            Err(err) => {
                self.shared.record_frame_drop();
                self.event_recorder.record(Event::FrameDropped { ts_ns });
                debug!("[Telemetry] try_send failed: {:?}", err);
                false
            }
        }
    }
}

pub struct TelemetryTask {
    transmitter: Transmitter,
    shared: Arc<SharedState>,
    period: Duration,
    extended: bool,
    metrics: SharedMetrics,
    event_recorder: Arc<EventRecorder>,
    running: Arc<AtomicBool>,
}

impl TelemetryTask {
    pub fn new(
        transmitter: Transmitter,
        period: Duration,
        extended: bool,
        metrics: SharedMetrics,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            shared: transmitter.shared.clone(),
            event_recorder: transmitter.event_recorder.clone(),
            transmitter,
            period,
            extended,
            metrics,
            running,
        }
    }

    /// Builds and sends one frame now.
    pub fn emit(&self) -> bool {
        let frame = TelemetryFrame::snapshot(&self.shared, self.extended);
        self.transmitter.transmit(frame.encode())
    }

    pub fn run(&self) {
        let sleeper = SpinSleeper::new(100_000).with_spin_strategy(SpinStrategy::YieldThread);
        let mut next_deadline = Instant::now() + self.period;
        info!("[Telemetry] started, period {:?}, extended={}", self.period, self.extended);

        while self.running.load(Ordering::Acquire) {
            let now = Instant::now();
            if now < next_deadline {
                sleeper.sleep(next_deadline - now);
            } else {
                let late_us = (now - next_deadline).as_micros() as u64;
                self.event_recorder.record(Event::DeadlineMiss {
                    ts_ns: self.event_recorder.now_ns(),
                    component: DeadlineComponent::Telemetry,
                    late_us,
                });
                lock_metrics(&self.metrics).record_deadline_miss(DeadlineComponent::Telemetry);
            }

            self.emit();

            next_deadline += self.period;
            // fell more than a period behind: skip the missed releases
            let now = Instant::now();
            if next_deadline + self.period < now {
                warn!("[Telemetry] {:?} behind schedule, resynchronising", now - next_deadline);
                next_deadline = now + self.period;
            }
        }

        info!(
            "[Telemetry] stopped. sent={} dropped={}",
            self.shared.frames_sent(),
            self.shared.frames_dropped()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component_a::telemetry::{EXTENDED_FRAME_LEN, decode};
    use crate::config::SweepConfig;
    use crossbeam::channel::bounded;

    fn task(capacity: usize) -> (TelemetryTask, crossbeam::channel::Receiver<Vec<u8>>) {
        let shared = Arc::new(SharedState::new(&SweepConfig::default()));
        let (tx, rx) = bounded(capacity);
        let transmitter = Transmitter::new(tx, shared, Arc::new(EventRecorder::new()));
        let task = TelemetryTask::new(
            transmitter,
            Duration::from_millis(50),
            true,
            SharedMetrics::default(),
            Arc::new(AtomicBool::new(true)),
        );
        (task, rx)
    }

    #[test]
    fn emitted_frame_decodes() {
        let (task, rx) = task(4);
        task.shared.set_channel(0, 2000.0, 1500.0, 55.0);
        assert!(task.emit());
        let bytes = rx.try_recv().unwrap();
        assert_eq!(bytes.len(), EXTENDED_FRAME_LEN);
        let frame = decode(&bytes).unwrap();
        assert_eq!(frame.setpoints[0], 2000.0);
        assert_eq!(frame.duties[0], 55.0);
        assert_eq!(frame.mode, 2);
    }

    #[test]
    fn full_sink_drops_without_blocking() {
        let (task, _rx) = task(1);
        assert!(task.emit());
        let start = Instant::now();
        assert!(!task.emit());
        assert!(start.elapsed() < Duration::from_millis(5));
        assert_eq!(task.shared.frames_dropped(), 1);
        assert_eq!(task.shared.frames_sent(), 1);
    }

    #[test]
    fn disconnected_sink_counts_drops() {
        let (task, rx) = task(4);
        drop(rx);
        assert!(!task.emit());
        assert!(!task.emit());
        assert_eq!(task.shared.frames_dropped(), 2);
    }
}
