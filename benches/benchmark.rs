//! Chat fan-out benchmark suite
//!
//! Measures:
//! - Connection lifecycle against a live in-process server (handshake, history, close)
//! - Post round trip: validate, persist, cache, publish and fan back to the sender
//! - Room fan-out in the connection registry, independent of any socket
//! - Recent-message cache push against the in-memory shared store
//!
//! The server runs on in-memory backends so results reflect this crate
//! rather than Redis or PostgreSQL latency.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use futures_util::{SinkExt, StreamExt};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{net::TcpListener, runtime::Runtime, sync::Mutex};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;
use chat_fanout::{
    config::{ServerConfig, StoreBackend},
    server::{
        accept_connections, Backends, BackgroundTasks, ChatMessage, Client, ConnectionRegistry,
        RecentCache, ServerState,
    },
    server::message::MessageId,
    store::MemoryStore,
};

/// Starts a server on an OS-assigned port with limits high enough not to interfere.
async fn start_test_server() -> (SocketAddr, BackgroundTasks, tokio::task::JoinHandle<()>) {
    let config = ServerConfig {
        port: 0,
        store_backend: StoreBackend::Memory,
        connection_rate_limit: 100_000,
        message_rate_limit: u32::MAX,
        ..ServerConfig::default()
    };
    let state = Arc::new(
        ServerState::new(config, Backends::in_memory()).expect("Failed to build server state"),
    );
    let tasks = BackgroundTasks::start(&state);

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("Failed to bind");
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(accept_connections(listener, state));

    tokio::time::sleep(Duration::from_millis(100)).await;
    (addr, tasks, server)
}

/// Connection establishment, initial history and teardown.
fn bench_connections(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let (addr, tasks, server) = rt.block_on(start_test_server());

    let mut group = c.benchmark_group("connections");
    group.sample_size(100);
    group.measurement_time(Duration::from_secs(5));
    group.warm_up_time(Duration::from_secs(1));

    group.bench_function("join_and_leave", |b| {
        b.to_async(&rt).iter(|| async {
            let url = Url::parse(&format!("ws://{}/ws/bench", addr)).unwrap();
            let (mut ws, _) = connect_async(url).await.unwrap();
            let _history = ws.next().await.unwrap().unwrap();
            ws.close(None).await.unwrap();
        });
    });
    group.finish();

    server.abort();
    rt.block_on(tasks.shutdown());
}

/// One post from a member until its own broadcast arrives back.
fn bench_messages(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let (addr, tasks, server) = rt.block_on(start_test_server());

    let socket = rt.block_on(async {
        let url = Url::parse(&format!("ws://{}/ws/throughput", addr)).unwrap();
        let (mut ws, _) = connect_async(url).await.unwrap();
        let _history = ws.next().await.unwrap().unwrap();
        Arc::new(Mutex::new(ws))
    });

    let mut group = c.benchmark_group("messages");
    group.throughput(Throughput::Elements(1));

    group.bench_function("post_round_trip", |b| {
        b.to_async(&rt).iter(|| {
            let socket = socket.clone();
            async move {
                let mut ws = socket.lock().await;
                ws.send(Message::Text(r#"{"username":"bench","content":"ping"}"#.into()))
                    .await
                    .unwrap();
                let _ = ws.next().await.unwrap().unwrap();
            }
        });
    });
    group.finish();

    server.abort();
    rt.block_on(tasks.shutdown());
}

/// Registry fan-out to rooms of increasing size.
fn bench_fanout(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let _guard = rt.enter();

    let mut group = c.benchmark_group("fanout");
    for members in [10usize, 100, 1_000] {
        let registry = ConnectionRegistry::new();
        let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
        // Receivers drain concurrently; a member that still falls behind is evicted.
        let mut drains = Vec::with_capacity(members);
        for _ in 0..members {
            let (client, mut receiver) = Client::channel(addr);
            registry.admit("room", client);
            drains.push(rt.spawn(async move { while receiver.recv().await.is_some() {} }));
        }

        let payload = Message::Text(r#"{"type":"message","item":{}}"#.to_string());
        group.throughput(Throughput::Elements(members as u64));
        group.bench_with_input(BenchmarkId::from_parameter(members), &members, |b, _| {
            b.iter(|| registry.broadcast("room", &payload));
        });

        registry.close_all();
        for drain in drains {
            drain.abort();
        }
    }
    group.finish();
}

/// Prepend-and-trim on a full room buffer.
fn bench_cache(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let cache = RecentCache::new(Arc::new(MemoryStore::new()), 50);
    let message = ChatMessage {
        id: MessageId(1),
        room: "lobby".into(),
        username: "bench".into(),
        content: "x".repeat(200),
        avatar: None,
        created_at: chrono::Utc::now(),
    };

    c.bench_function("cache_push", |b| {
        b.to_async(&rt).iter(|| async {
            cache.push("lobby", &message).await.unwrap();
        });
    });
}

criterion_group!(
    name = benches;
    config = Criterion::default()
        .significance_level(0.05)
        .noise_threshold(0.05);
    targets = bench_connections, bench_messages, bench_fanout, bench_cache
);
criterion_main!(benches);
