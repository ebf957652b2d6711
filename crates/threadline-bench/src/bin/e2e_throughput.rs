//! End-to-end delivery benchmark for Threadline.
//!
//! Every client joins one shared thread and keeps sending to all members;
//! the benchmark counts messages and notifications received over real
//! WebSocket connections.

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Barrier;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use uuid::Uuid;

const SERVER_URL: &str = "ws://127.0.0.1:8080/ws";
const WARMUP_SECS: u64 = 2;
const BENCH_SECS: u64 = 10;

#[derive(Default)]
struct Counters {
    direct: AtomicU64,
    notifications: AtomicU64,
}

impl Counters {
    fn reset(&self) {
        self.direct.store(0, Ordering::SeqCst);
        self.notifications.store(0, Ordering::SeqCst);
    }
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    let num_clients: usize = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(16);
    let watching: usize = args
        .get(2)
        .and_then(|s| s.parse().ok())
        .unwrap_or(num_clients / 2);

    println!("Threadline end-to-end delivery benchmark");
    println!("Make sure the server is running: cargo run --release --bin threadline");
    println!();

    run_thread_benchmark(num_clients, watching.min(num_clients)).await;
}

async fn run_thread_benchmark(num_clients: usize, watching: usize) {
    println!(
        "Thread benchmark: {} clients, {} watching the thread",
        num_clients, watching
    );
    println!("Warmup: {}s, Measurement: {}s", WARMUP_SECS, BENCH_SECS);

    let thread_id = Uuid::now_v7();
    let members: Vec<String> = (0..num_clients).map(|i| format!("bench-{}", i)).collect();
    let counters = Arc::new(Counters::default());
    let barrier = Arc::new(Barrier::new(num_clients + 1));

    let mut handles = Vec::new();
    for client_id in 0..num_clients {
        let counters = Arc::clone(&counters);
        let barrier = Arc::clone(&barrier);
        let members = members.clone();

        let handle = tokio::spawn(async move {
            let watch = client_id < watching;
            let result =
                run_client(client_id, thread_id, members, watch, counters, barrier).await;
            if let Err(e) = result {
                eprintln!("Client {} error: {}", client_id, e);
            }
        });
        handles.push(handle);
    }

    barrier.wait().await;
    println!("All {} clients connected", num_clients);

    tokio::time::sleep(Duration::from_secs(WARMUP_SECS)).await;

    counters.reset();
    let start = Instant::now();
    tokio::time::sleep(Duration::from_secs(BENCH_SECS)).await;
    let elapsed = start.elapsed().as_secs_f64();

    let direct = counters.direct.load(Ordering::SeqCst);
    let notifications = counters.notifications.load(Ordering::SeqCst);

    println!();
    println!("Results");
    println!("  Clients:         {:>10}", num_clients);
    println!("  Duration:        {:>10.2}s", elapsed);
    println!("  Direct:          {:>10.0} msg/s", direct as f64 / elapsed);
    println!("  Notifications:   {:>10.0} msg/s", notifications as f64 / elapsed);
    println!(
        "  Total delivered: {:>10.0} msg/s",
        (direct + notifications) as f64 / elapsed
    );

    for handle in handles {
        handle.abort();
    }
}

async fn run_client(
    client_id: usize,
    thread_id: Uuid,
    members: Vec<String>,
    watch: bool,
    counters: Arc<Counters>,
    barrier: Arc<Barrier>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let url = format!("{}?user=bench-{}", SERVER_URL, client_id);
    let (ws, _) = connect_async(url.as_str()).await?;
    let (mut sender, mut receiver) = ws.split();

    // Connected frame
    receiver.next().await;

    if watch {
        let subscribe = json!({
            "type": "subscribe",
            "id": 0,
            "topic": format!("/queue/threads/{}", thread_id),
        });
        sender.send(Message::Text(subscribe.to_string())).await?;
        // Ack
        receiver.next().await;
    }

    barrier.wait().await;

    let recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            let Message::Text(text) = message else {
                continue;
            };
            let Ok(frame) = serde_json::from_str::<Value>(&text) else {
                continue;
            };
            match frame["type"].as_str() {
                Some("message") => counters.direct.fetch_add(1, Ordering::Relaxed),
                Some("notification") => counters.notifications.fetch_add(1, Ordering::Relaxed),
                _ => 0,
            };
        }
    });

    let mut id = 1u64;
    loop {
        let send = json!({
            "type": "send",
            "id": id,
            "thread_id": thread_id,
            "members": members,
            "body": "benchmark",
        });
        if sender.send(Message::Text(send.to_string())).await.is_err() {
            break;
        }
        id += 1;
        tokio::task::yield_now().await;
    }

    recv_task.abort();
    Ok(())
}
