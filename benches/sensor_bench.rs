/*
Acquisition hot path: ToF frame parse, primary/secondary fusion, and one tracker
step including the sector attribution.
*/

use criterion::{Criterion, criterion_group, criterion_main};
use std::hint::black_box;

use rts_pad_control::component_a::{
    sensor::{TOF_HEADER, TofFrame, fuse, parse_tof_frame},
    sweep::{SectorMap, SweepTracker},
    sync_manager::{RuntimeParams, SectorReading},
};
use rts_pad_control::config::SweepConfig;

fn sensor_bench(c: &mut Criterion) {
    let frame = TofFrame {
        id: 0,
        system_time_ms: 1234,
        distance_mm: 1500,
        status: 0,
        signal_strength: 40,
        precision: 1,
    }
    .to_bytes();
    assert_eq!(frame[..2], TOF_HEADER);

    c.bench_function("tof_parse", |b| b.iter(|| black_box(parse_tof_frame(black_box(&frame)))));
    c.bench_function("fuse", |b| {
        b.iter(|| black_box(fuse(black_box(Some(150.0)), black_box(Some(148.5)))))
    });

    let cfg = SweepConfig::default();
    let params = RuntimeParams::from_config(&cfg).snapshot();
    let mut tracker = SweepTracker::new(SectorMap::from_config(&cfg).unwrap(), cfg.min_angle);
    c.bench_function("tracker_observe", |b| {
        b.iter(|| {
            tracker.observe(black_box(120.0), &params, |i, r: SectorReading| {
                black_box((i, r));
            })
        })
    });
}

criterion_group!(benches, sensor_bench);
criterion_main!(benches);
