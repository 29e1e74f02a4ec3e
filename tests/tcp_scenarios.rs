#![cfg(all(feature = "tcp", feature = "udp"))]

mod common;

use bytes::BytesMut;
use icelink::{
    create_incoming_factory,
    factory::{DatagramIncomingConnectionFactory, StreamIncomingConnectionFactory}, parse_endpoint, Config, EndpointSelection,
    IncomingConnectionFactory, ObjectAdapter, OutgoingConnectionFactory, TransportContext,
};
use std::sync::Arc;
use std::time::Duration;

fn context() -> Arc<TransportContext> {
    common::init_tracing();
    TransportContext::new(Config::default().with_connect_timeout(Duration::from_secs(2))).unwrap()
}

/// 先绑定再释放，得到一个大概率没有人监听的端口
fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

async fn listening_factory(context: &Arc<TransportContext>) -> Arc<StreamIncomingConnectionFactory> {
    let endpoint = parse_endpoint(context, "tcp -h 127.0.0.1 -p 0", true).unwrap();
    let factory = StreamIncomingConnectionFactory::new(
        context.clone(),
        Arc::new(ObjectAdapter::new("server")),
        endpoint,
        None,
    )
    .await
    .unwrap();
    factory.activate();
    factory
}

#[tokio::test]
async fn test_fallback_from_refused_port() {
    let context = context();
    let server = listening_factory(&context).await;
    let port = server.endpoint().port();
    assert_ne!(port, 0);

    let dead = parse_endpoint(&context, &format!("tcp -h 127.0.0.1 -p {}", closed_port()), false).unwrap();
    let live = parse_endpoint(&context, &format!("tcp -h 127.0.0.1 -p {}", port), false).unwrap();

    let client = OutgoingConnectionFactory::new(context.clone());
    let connection = client
        .connection(&[dead.clone(), live], false, EndpointSelection::Ordered, "")
        .await
        .unwrap();

    assert_eq!(connection.connector().unwrap().to_string(), format!("127.0.0.1:{}", port));
    assert!(common::wait_until(|| server.connection_count() == 1).await);

    let error = client
        .connection(&[dead], false, EndpointSelection::Ordered, "")
        .await
        .unwrap_err();
    assert!(error.is_retryable());

    client.dispose().await;
    server.dispose().await;
}

#[tokio::test]
async fn test_data_flows_over_cached_connection() {
    let context = context();
    let server = listening_factory(&context).await;
    let endpoint = parse_endpoint(&context, &format!("tcp -h 127.0.0.1 -p {}", server.endpoint().port()), false).unwrap();

    let client = OutgoingConnectionFactory::new(context.clone());
    let connection = client
        .connection(&[endpoint.clone()], false, EndpointSelection::Ordered, "")
        .await
        .unwrap();
    connection.write(b"ping").await.unwrap();

    assert!(common::wait_until(|| server.connection_count() == 1).await);
    let accepted = server.connections().remove(0);
    assert!(common::wait_until(|| accepted.is_active()).await);

    let mut buf = BytesMut::with_capacity(64);
    while buf.len() < 4 {
        accepted.read(&mut buf).await.unwrap();
    }
    assert_eq!(&buf[..], b"ping");

    accepted.write(b"pong").await.unwrap();
    let mut buf = BytesMut::with_capacity(64);
    while buf.len() < 4 {
        connection.read(&mut buf).await.unwrap();
    }
    assert_eq!(&buf[..], b"pong");

    // 服务端关闭后客户端读到 EOF，连接从缓存中移除
    server.dispose().await;
    let mut buf = BytesMut::with_capacity(64);
    let _ = connection.read(&mut buf).await;
    assert!(common::wait_until(|| connection.is_closed()).await);
    assert_eq!(client.cache_stats().connections, 0);

    client.dispose().await;
}

#[tokio::test]
async fn test_datagram_round_trip() {
    let context = context();
    let server_endpoint = parse_endpoint(&context, "udp -h 127.0.0.1 -p 0", true).unwrap();
    let server = DatagramIncomingConnectionFactory::new(
        context.clone(),
        Arc::new(ObjectAdapter::new("datagrams")),
        server_endpoint,
        None,
    )
    .await
    .unwrap();
    server.activate();
    let port = server.endpoint().port();
    assert_ne!(port, 0);

    // 数据报没有接受过程，工厂的唯一连接直接收发
    let datagram = server.connection().clone();
    assert!(common::wait_until(|| datagram.is_active()).await);

    let endpoint = parse_endpoint(&context, &format!("udp -h 127.0.0.1 -p {}", port), false).unwrap();
    let client = OutgoingConnectionFactory::new(context.clone());
    let connection = client
        .connection(&[endpoint], false, EndpointSelection::Ordered, "")
        .await
        .unwrap();
    assert!(connection.endpoint().is_datagram());
    connection.write(b"datagram").await.unwrap();

    let mut buf = BytesMut::new();
    let received = tokio::time::timeout(Duration::from_secs(2), datagram.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..received], b"datagram");

    datagram.write(b"reply").await.unwrap();
    let mut buf = BytesMut::new();
    let received = tokio::time::timeout(Duration::from_secs(2), connection.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..received], b"reply");

    client.dispose().await;
    server.dispose().await;
    assert!(datagram.is_closed());
}

#[tokio::test]
async fn test_incoming_factory_for_parsed_endpoints() {
    let context = context();
    let adapter = Arc::new(ObjectAdapter::new("mixed"));

    let stream = create_incoming_factory(
        context.clone(),
        adapter.clone(),
        parse_endpoint(&context, "tcp -h 127.0.0.1 -p 0", true).unwrap(),
        None,
    )
    .await
    .unwrap();
    assert!(!stream.endpoint().is_datagram());
    assert_ne!(stream.endpoint().port(), 0);

    let datagram = create_incoming_factory(
        context.clone(),
        adapter,
        parse_endpoint(&context, "udp -h 127.0.0.1 -p 0", true).unwrap(),
        None,
    )
    .await
    .unwrap();
    assert!(datagram.endpoint().is_datagram());

    stream.dispose().await;
    datagram.dispose().await;
}
