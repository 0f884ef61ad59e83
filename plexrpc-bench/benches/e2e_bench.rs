//! End-to-end client-node benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use plexrpc_client::{Client, ConnectionConfig};
use plexrpc_server::{builtin, Config, Node, NodeHandle, SocketMode};
use serde_json::json;
use std::sync::Arc;
use tokio::runtime::Runtime;

struct TestSetup {
    _node: NodeHandle,
    client: Arc<Client>,
}

fn setup_node_and_client(rt: &Runtime, mode: SocketMode) -> TestSetup {
    let mut config = Config::default();
    config.network.bind_addr = "127.0.0.1:0".parse().unwrap();
    config.network.mode = mode;

    rt.block_on(async {
        let node = Node::start(config, builtin::catalog()).await.unwrap();
        let client_config = ConnectionConfig::new(node.socket_addr()).with_client_name("bench");
        let client = Client::new(client_config);
        client.connect().await.unwrap();
        TestSetup {
            _node: node,
            client: Arc::new(client),
        }
    })
}

fn bench_ping_latency(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let setup = setup_node_and_client(&rt, SocketMode::Sync);

    let mut group = c.benchmark_group("e2e_ping");
    group.throughput(Throughput::Elements(1));

    group.bench_function("ping", |b| {
        b.to_async(&rt)
            .iter(|| async { black_box(setup.client.ping().await.unwrap()) });
    });

    group.finish();
}

fn bench_invoke(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("e2e_invoke");
    group.throughput(Throughput::Elements(1));

    for (name, mode) in [("sync", SocketMode::Sync), ("async", SocketMode::Async)] {
        let setup = setup_node_and_client(&rt, mode);
        group.bench_function(name, |b| {
            b.to_async(&rt).iter(|| async {
                black_box(
                    setup
                        .client
                        .invoke(builtin::SERVICE, "ping", vec![json!({"n": 1})])
                        .await
                        .unwrap(),
                )
            });
        });
    }

    group.finish();
}

fn bench_concurrent_invokes(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("e2e_concurrent");
    group.sample_size(20);

    for (name, mode) in [("sync", SocketMode::Sync), ("async", SocketMode::Async)] {
        let setup = setup_node_and_client(&rt, mode);
        for concurrency in [1, 10, 50] {
            group.throughput(Throughput::Elements(concurrency as u64));
            group.bench_with_input(
                BenchmarkId::new(name, concurrency),
                &concurrency,
                |b, &conc| {
                    b.to_async(&rt).iter(|| {
                        let client = &setup.client;
                        async move {
                            let futures: Vec<_> = (0..conc)
                                .map(|i| client.invoke(builtin::SERVICE, "ping", vec![json!(i)]))
                                .collect();
                            black_box(futures::future::join_all(futures).await)
                        }
                    });
                },
            );
        }
    }

    group.finish();
}

fn bench_capabilities(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let setup = setup_node_and_client(&rt, SocketMode::Sync);

    let mut group = c.benchmark_group("e2e_latency");

    group.bench_function("node_configuration", |b| {
        b.to_async(&rt)
            .iter(|| async { black_box(setup.client.node_configuration().await.unwrap()) });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_ping_latency,
    bench_invoke,
    bench_concurrent_invokes,
    bench_capabilities,
);

criterion_main!(benches);
