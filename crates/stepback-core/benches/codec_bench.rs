//! Criterion benchmarks for stepback core.
//!
//! Three benchmark groups:
//! - `codec`: encode/decode of a 1,000-ant colony with both codecs
//! - `history`: record and restore, raw and compressed
//! - `rounds`: one scheduler round over 1,000 small units per concurrency mode

use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use stepback_core::codec::{BinaryCodec, JsonCodec, SnapshotCodec};
use stepback_core::compress::{self, Compressor};
use stepback_core::history::Recorder;
use stepback_core::scheduler::Scheduler;
use stepback_core::sim::Simulation;
use stepback_core::test_utils::*;
use stepback_core::unit::UnitHandle;

// ===========================================================================
// Codec
// ===========================================================================

fn bench_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec");
    let ctx = test_context();
    let root = build_colony(1_000);

    for codec in [&BinaryCodec as &dyn SnapshotCodec, &JsonCodec] {
        let bytes = codec.encode_entity(&root, 0).unwrap();
        group.bench_function(BenchmarkId::new("encode_1000_ants", codec.format_name()), |b| {
            b.iter(|| codec.encode_entity(&root, 0).unwrap());
        });
        group.bench_function(BenchmarkId::new("decode_1000_ants", codec.format_name()), |b| {
            b.iter(|| codec.decode_unit(&ctx, &bytes).unwrap());
        });
    }

    group.finish();
}

// ===========================================================================
// History
// ===========================================================================

fn bench_history(c: &mut Criterion) {
    let mut group = c.benchmark_group("history");

    let raw = Recorder::new(Arc::new(BinaryCodec));
    let zipped = Recorder::new(Arc::new(BinaryCodec)).with_compression(Compressor::new(compress::DEFAULT_LEVEL));

    for (label, rec) in [("raw", &raw), ("zlib", &zipped)] {
        group.bench_function(BenchmarkId::new("record_restore_500_ants", label), |b| {
            let mut sim = Simulation::new("bench", test_context()).with_root(build_colony(500));
            b.iter(|| {
                sim.set_cycle(0);
                rec.record(&mut sim).unwrap();
                sim.set_cycle(1);
                rec.record(&mut sim).unwrap();
                rec.restore(&mut sim).unwrap()
            });
            compress::drain();
        });
    }

    group.finish();
}

// ===========================================================================
// Rounds
// ===========================================================================

fn bench_rounds(c: &mut Criterion) {
    let mut group = c.benchmark_group("rounds");

    for concurrency in [0, 1, 4, 8] {
        let mut scheduler = Scheduler::with_concurrency(concurrency).unwrap();
        for _ in 0..1_000 {
            scheduler.register(&UnitHandle::new(CountingUnit::default()));
        }
        group.bench_with_input(
            BenchmarkId::new("1000_units", concurrency),
            &scheduler,
            |b, scheduler| {
                b.iter(|| scheduler.run_round().unwrap());
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_codec, bench_history, bench_rounds);
criterion_main!(benches);
