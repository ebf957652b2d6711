//! Throughput benchmarks for Threadline.
//!
//! These benchmarks measure the raw throughput of id minting, fanout and
//! delivery routing.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use threadline_core::{
    fanout, thread_topic, BucketIndex, DeliveryRouter, IdGenerator, MessageDraft, NodeIdSource,
    Session, SessionRegistry, TopicSubscription, DEFAULT_BUCKET_SIZE_MS,
};
use uuid::Uuid;

fn generator() -> IdGenerator {
    IdGenerator::new(0, NodeIdSource::Explicit(1)).unwrap()
}

/// Benchmark id generation.
fn bench_next_id(c: &mut Criterion) {
    let mut group = c.benchmark_group("snowflake");
    group.throughput(Throughput::Elements(1));

    let generator = generator();
    group.bench_function("next_id", |b| b.iter(|| black_box(generator.next_id())));

    let shared = Arc::new(generator);
    group.bench_function("next_id_4_threads", |b| {
        b.iter_custom(|iters| {
            let start = std::time::Instant::now();
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let generator = Arc::clone(&shared);
                    std::thread::spawn(move || {
                        for _ in 0..iters / 4 {
                            black_box(generator.next_id().unwrap());
                        }
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }
            start.elapsed()
        });
    });

    group.finish();
}

/// Benchmark message fanout.
fn bench_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("fanout");
    let generator = generator();
    let index = BucketIndex::for_generator(&generator, DEFAULT_BUCKET_SIZE_MS).unwrap();
    let thread = Uuid::now_v7();

    for members in [2usize, 10, 100] {
        let member_ids: Vec<String> = (0..members).map(|i| format!("user-{}", i)).collect();
        group.throughput(Throughput::Elements(members as u64));
        group.bench_with_input(
            BenchmarkId::new("members", members),
            &member_ids,
            |b, member_ids| {
                b.iter(|| {
                    let draft = MessageDraft::new(thread, "user-0", "hello");
                    fanout(&generator, &index, draft, black_box(member_ids)).unwrap()
                });
            },
        );
    }

    group.finish();
}

/// Benchmark registry and router operations.
fn bench_registry(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry");

    group.bench_function("subscribe", |b| {
        let registry = SessionRegistry::new();
        registry.connect(Session::new("alice", "s1", 0));
        let mut i = 0u64;
        b.iter(|| {
            let topic = format!("/queue/threads/{}", i % 64);
            registry.subscribe("alice", TopicSubscription::new(topic, "sub", i));
            i += 1;
        });
    });

    let generator = generator();
    let index = BucketIndex::for_generator(&generator, DEFAULT_BUCKET_SIZE_MS).unwrap();
    let registry = Arc::new(SessionRegistry::new());
    let router = DeliveryRouter::for_generator(Arc::clone(&registry), &generator);
    let thread = Uuid::now_v7();

    for users in [10usize, 1_000] {
        for u in 0..users {
            let user = format!("user-{}", u);
            registry.connect(Session::new(user.clone(), "s", 0));
            if u % 2 == 0 {
                registry.subscribe(&user, TopicSubscription::new(thread_topic(thread), "sub", 0));
            }
        }
        let members: Vec<String> = (0..users).map(|u| format!("user-{}", u)).collect();
        let message = fanout(
            &generator,
            &index,
            MessageDraft::new(thread, "author", "hello"),
            &members,
        )
        .unwrap();

        group.throughput(Throughput::Elements(users as u64));
        group.bench_with_input(BenchmarkId::new("route", users), &message, |b, message| {
            b.iter(|| {
                for delivery in &message.deliveries {
                    black_box(router.route(&delivery.target, &message.event));
                }
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_next_id, bench_fanout, bench_registry);
criterion_main!(benches);
