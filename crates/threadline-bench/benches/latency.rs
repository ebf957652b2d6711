//! Latency benchmarks for Threadline.
//!
//! These benchmarks measure how long one history page takes to assemble
//! depending on how many buckets it spans.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;
use threadline_core::{
    BucketIndex, HistoryAggregator, HistoryQuery, MemoryMessageStore, MessageRecord,
    PaginatedMessageStore, StoreError, ThreadId, ThreadLookup, DEFAULT_PAGE_SIZE,
};
use tokio::runtime::Runtime;
use uuid::Uuid;

const USER: &str = "reader";

/// Thread created at the custom epoch.
struct CreatedAtEpoch;

#[async_trait::async_trait]
impl ThreadLookup for CreatedAtEpoch {
    async fn created_at_unix_millis(&self, _thread_id: ThreadId) -> Result<u64, StoreError> {
        Ok(0)
    }
}

/// A store where each of `buckets` buckets holds `per_bucket` messages.
fn seeded_store(thread: ThreadId, buckets: i64, per_bucket: u64) -> Arc<MemoryMessageStore> {
    let store = Arc::new(MemoryMessageStore::new());
    for bucket in 0..buckets {
        for i in 0..per_bucket {
            let id = (bucket as u64) * 1_000 + i;
            store.insert(USER, MessageRecord::new(id, thread, bucket, "author", "body"));
        }
    }
    store
}

/// Benchmark a full page spanning 1, 5 and 25 buckets.
fn bench_history_page(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("history_page");
    let thread = Uuid::now_v7();

    for per_bucket in [25u64, 5, 1] {
        let buckets = 30;
        let store = seeded_store(thread, buckets, per_bucket);
        let aggregator = HistoryAggregator::new(
            store as Arc<dyn PaginatedMessageStore>,
            Arc::new(CreatedAtEpoch),
            BucketIndex::new(1_000, 0).unwrap(),
            DEFAULT_PAGE_SIZE,
        )
        .unwrap();
        let spanned = DEFAULT_PAGE_SIZE as u64 / per_bucket;

        group.bench_with_input(
            BenchmarkId::new("buckets", spanned),
            &aggregator,
            |b, aggregator| {
                b.iter(|| {
                    rt.block_on(aggregator.fetch_page(
                        USER,
                        thread,
                        HistoryQuery::in_bucket(buckets - 1),
                    ))
                    .unwrap()
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_history_page);
criterion_main!(benches);
