#![expect(missing_docs, reason = "benchmarks")]

use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

use ca_client::{Channel, DbrType, SyncGroup};
use criterion::{Criterion, criterion_group, criterion_main};
use testing::RecordingChannel;

const DOUBLE: DbrType = DbrType(6);

fn entrypoint(c: &mut Criterion) {
    let mut g = c.benchmark_group("sync_group");

    g.bench_function("issue_complete_block_1", |b| {
        let recording = Arc::new(RecordingChannel::new("BENCH:ONE"));
        recording.complete_inline(true);
        recording.keep_history(false);
        let channel = Arc::clone(&recording);
        let channel: Arc<dyn Channel> = channel;

        let group = SyncGroup::new();

        b.iter(|| {
            group
                .issue_write(&channel, DOUBLE, 1, black_box(&[0; 8]))
                .unwrap();
            black_box(group.block(Duration::ZERO));
        });
    });

    g.bench_function("issue_reset_100", |b| {
        let recording = Arc::new(RecordingChannel::new("BENCH:HUNDRED"));
        recording.keep_history(false);
        let channel = Arc::clone(&recording);
        let channel: Arc<dyn Channel> = channel;

        let group = SyncGroup::new();

        b.iter(|| {
            for _ in 0..100 {
                black_box(group.issue_read(&channel, DOUBLE, 1).unwrap());
            }

            group.reset();
        });
    });

    g.finish();
}

criterion_group!(benches, entrypoint);
criterion_main!(benches);
