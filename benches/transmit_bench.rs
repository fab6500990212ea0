/*
Telemetry path: CRC over a full extended frame, snapshot + encode, and decode with
validation, which is what the frame logger pays per frame.
*/

use criterion::{Criterion, criterion_group, criterion_main};
use std::hint::black_box;

use rts_pad_control::component_a::{
    sync_manager::SharedState,
    telemetry::{TelemetryFrame, crc16_ccitt, decode},
};
use rts_pad_control::config::SweepConfig;

fn telemetry_bench(c: &mut Criterion) {
    let shared = SharedState::new(&SweepConfig::default());
    for ch in 0..4 {
        shared.set_channel(ch, 1000.0 + ch as f32, 950.0, 45.0);
    }
    let bytes = TelemetryFrame::snapshot(&shared, true).encode();

    c.bench_function("crc16_ccitt_extended", |b| {
        b.iter(|| black_box(crc16_ccitt(black_box(&bytes[2..bytes.len() - 2]))))
    });
    c.bench_function("snapshot_encode_extended", |b| {
        b.iter(|| black_box(TelemetryFrame::snapshot(&shared, true).encode()))
    });
    c.bench_function("decode_extended", |b| b.iter(|| black_box(decode(black_box(&bytes)))));
}

criterion_group!(benches, telemetry_bench);
criterion_main!(benches);
