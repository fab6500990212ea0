/*
Sector lock under contention: N publisher threads hammer publish_sector while the
measured thread reads all sectors through the bounded accessor. The lock-free
fallback read is measured alongside for comparison.
*/

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use std::{
    hint::black_box,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
};

use rts_pad_control::component_a::sync_manager::{SectorReading, SharedState};
use rts_pad_control::config::{NUM_CHANNELS, SweepConfig};

const WRITER_COUNTS: &[usize] = &[0, 1, 2, 4];

fn bench_sector_read_under_contention(c: &mut Criterion) {
    let mut group = c.benchmark_group("sector_read_contention");

    for &writers in WRITER_COUNTS {
        let shared = Arc::new(SharedState::new(&SweepConfig::default()));
        let running = Arc::new(AtomicBool::new(true));

        let handles: Vec<_> = (0..writers)
            .map(|w| {
                let s = Arc::clone(&shared);
                let r = Arc::clone(&running);
                thread::spawn(move || {
                    let mut d = 60.0;
                    while r.load(Ordering::Relaxed) {
                        d = if d > 290.0 { 60.0 } else { d + 1.0 };
                        s.publish_sector(w % NUM_CHANNELS, SectorReading { distance_cm: d, angle: 90 });
                    }
                })
            })
            .collect();

        group.bench_with_input(BenchmarkId::new("locked", writers), &writers, |b, _| {
            b.iter(|| black_box(shared.sectors()))
        });
        group.bench_with_input(BenchmarkId::new("fallback", writers), &writers, |b, _| {
            b.iter(|| black_box(shared.sector_fallback(black_box(2))))
        });

        running.store(false, Ordering::Relaxed);
        for h in handles {
            let _ = h.join();
        }
    }
    group.finish();
}

criterion_group!(benches, bench_sector_read_under_contention);
criterion_main!(benches);
