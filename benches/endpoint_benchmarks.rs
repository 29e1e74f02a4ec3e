/// 端点与连接缓存基准测试
///
/// 对比：
/// 1. ice1 文本与 URI 两种端点格式的解析开销
/// 2. 以 trait 对象为键的哈希表查找
/// 3. 客户端工厂命中缓存时的开销

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use icelink::{parse_endpoint, Config, Endpoint, EndpointSelection, OutgoingConnectionFactory, TransportContext};
use std::collections::HashMap;
use std::sync::Arc;

fn bench_parse(c: &mut Criterion) {
    let context = TransportContext::new(Config::default()).unwrap();
    let mut group = c.benchmark_group("endpoint_parse");
    group.throughput(Throughput::Elements(1));

    group.bench_function("ice1_tcp", |b| {
        b.iter(|| parse_endpoint(&context, black_box("tcp -h 192.168.1.10 -p 10000 -t 5000 -z"), false).unwrap())
    });

    group.bench_function("ice1_udp", |b| {
        b.iter(|| parse_endpoint(&context, black_box("udp -h 239.255.0.1 -p 10000 --ttl 5"), false).unwrap())
    });

    group.bench_function("uri_tcp", |b| {
        b.iter(|| {
            parse_endpoint(&context, black_box("ice+tcp://[::1]:10000?source-address=::1"), false).unwrap()
        })
    });

    group.finish();
}

fn bench_lookup(c: &mut Criterion) {
    let context = TransportContext::new(Config::default()).unwrap();
    let endpoints: Vec<Arc<dyn Endpoint>> = (0..256)
        .map(|port| parse_endpoint(&context, &format!("tcp -h 10.0.0.1 -p {}", 20000 + port), false).unwrap())
        .collect();
    let table: HashMap<(Arc<dyn Endpoint>, String), usize> = endpoints
        .iter()
        .enumerate()
        .map(|(index, endpoint)| ((endpoint.clone(), String::new()), index))
        .collect();

    let key = parse_endpoint(&context, "tcp -h 10.0.0.1 -p 20128", false).unwrap();
    c.bench_function("endpoint_table_lookup", |b| {
        b.iter(|| table.get(&(black_box(key.clone()), String::new())).copied())
    });
}

fn bench_cache_hit(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let context = TransportContext::new(Config::default()).unwrap();

    let (factory, endpoint) = runtime.block_on(async {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut accepted = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                accepted.push(stream);
            }
        });

        let endpoint = parse_endpoint(&context, &format!("tcp -h 127.0.0.1 -p {}", port), false).unwrap();
        let factory = OutgoingConnectionFactory::new(context.clone());
        factory
            .connection(&[endpoint.clone()], false, EndpointSelection::Ordered, "")
            .await
            .unwrap();
        (factory, endpoint)
    });

    c.bench_function("outgoing_cache_hit", |b| {
        b.to_async(&runtime).iter(|| async {
            factory
                .connection(&[endpoint.clone()], false, EndpointSelection::Ordered, "")
                .await
                .unwrap()
        })
    });

    runtime.block_on(factory.dispose());
}

criterion_group!(benches, bench_parse, bench_lookup, bench_cache_hit);
criterion_main!(benches);
