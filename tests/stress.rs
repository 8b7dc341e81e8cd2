//! Stress tests for many concurrent relay sessions.
//!
//! These tests are marked #[ignore] and run via: cargo test -- --ignored

mod harness;

use harness::{EchoTarget, Latencies, Metrics, TestClient, TestRelay};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use wsrelay::Config;

fn get_stress_client_count() -> usize {
    std::env::var("WSRELAY_STRESS_CLIENTS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1000)
}

const MAX_CONCURRENT: usize = 200;
const MESSAGES_PER_CLIENT: usize = 10;

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
#[ignore]
async fn test_stress_sessions() {
    let num_clients = get_stress_client_count();
    println!(
        "Stress test: {} clients, {} max concurrent",
        num_clients, MAX_CONCURRENT
    );

    let target = EchoTarget::spawn().await;
    let config = Config::new().with_max_connections(MAX_CONCURRENT);
    let (relay, addr) = TestRelay::spawn_with_config(target.target(), config).await;
    let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT));
    let metrics = Metrics::new();
    let latencies = Latencies::new();

    let start = Instant::now();
    let mut set = JoinSet::new();

    for client_id in 0..num_clients {
        let permit = semaphore.clone().acquire_owned().await.unwrap();
        let metrics = metrics.clone();
        let latencies = latencies.clone();

        set.spawn(async move {
            let _permit = permit;
            let Ok(mut client) = TestClient::connect_with_id(addr, client_id).await else {
                metrics.record_failure();
                return;
            };
            metrics.record_session();

            for seq in 0..MESSAGES_PER_CLIENT {
                let msg = format!("client {} message {}", client_id, seq);
                let sent_at = Instant::now();
                if client.send_text(&msg).await.is_err() {
                    metrics.record_failure();
                    return;
                }
                metrics.record_sent();
                match client.recv_text(msg.len()).await {
                    Ok(echoed) if echoed == msg => {
                        latencies.record(sent_at.elapsed());
                        metrics.record_verified(msg.len());
                    }
                    _ => {
                        metrics.record_failure();
                        return;
                    }
                }
            }
            let _ = client.close().await;
        });
    }

    while let Some(result) = set.join_next().await {
        result.unwrap();
    }
    let elapsed = start.elapsed();

    println!("Sessions:   {}", metrics.sessions());
    println!("Failures:   {}", metrics.failures());
    println!("Verified:   {}/{}", metrics.verified(), metrics.sent());
    println!("Elapsed:    {:?}", elapsed);
    println!(
        "Latency:    p50={:?} p99={:?}",
        latencies.percentile(50),
        latencies.percentile(99)
    );

    assert_eq!(metrics.failures(), 0);
    assert_eq!(metrics.verified(), num_clients * MESSAGES_PER_CLIENT);
    relay.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
#[ignore]
async fn test_stress_throughput() {
    const NUM_CLIENTS: usize = 16;
    const PAYLOAD: usize = 64 * 1024;
    const ROUNDS: usize = 64;

    let target = EchoTarget::spawn().await;
    let (relay, addr) = TestRelay::spawn(target.target()).await;
    let metrics = Metrics::new();

    let start = Instant::now();
    let mut set = JoinSet::new();

    for client_id in 0..NUM_CLIENTS {
        let metrics = metrics.clone();
        set.spawn(async move {
            let mut client = TestClient::connect_with_id(addr, client_id).await.unwrap();
            let payload: Vec<u8> = (0..PAYLOAD).map(|n| (n % 253) as u8).collect();
            for _ in 0..ROUNDS {
                client.send(&payload).await.unwrap();
                let echoed = client.recv_exact(PAYLOAD).await.unwrap();
                assert_eq!(echoed, payload);
                metrics.record_verified(PAYLOAD);
            }
            assert!(client.close().await.unwrap());
        });
    }

    while let Some(result) = set.join_next().await {
        result.unwrap();
    }
    let elapsed = start.elapsed().max(Duration::from_millis(1));

    let mb = metrics.bytes() as f64 / (1024.0 * 1024.0);
    println!(
        "Throughput: {:.1} MiB echoed in {:?} ({:.1} MiB/s)",
        mb,
        elapsed,
        mb / elapsed.as_secs_f64()
    );
    assert_eq!(metrics.verified(), NUM_CLIENTS * ROUNDS);
    relay.shutdown().await;
}
