//! 集成测试共用的内存传输
//!
//! `MockNetwork` 记录每个地址被拨号的次数和解析次数，可以把地址设为不可达、
//! 把主机设为无法解析，或者给拨号加延迟。

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::BytesMut;
use icelink::{
    config::TransportConfig,
    context::TransportContext,
    endpoint::{downcast_eq, hash_into},
    instrumentation::{CommunicatorObserver, Observer},
    Acceptor, ConnectionState, Connector, Endpoint, EndpointSelection, Protocol, Transceiver,
    Transport, TransportError,
};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub type AcceptResult = Result<Box<dyn Transceiver>, TransportError>;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// 等待条件成立，超时返回 false
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

pub struct MockNetwork {
    context: Arc<TransportContext>,
    dials: Mutex<HashMap<String, usize>>,
    destroys: Mutex<HashMap<String, usize>>,
    mismatched_streams: AtomicBool,
    lookups: Mutex<HashMap<String, usize>>,
    routes: Mutex<HashMap<String, Vec<String>>>,
    unreachable: Mutex<HashSet<String>>,
    unresolvable: Mutex<HashSet<String>>,
    connect_delay: Mutex<Duration>,
    accept_queue: Mutex<Option<mpsc::UnboundedReceiver<AcceptResult>>>,
}

impl MockNetwork {
    pub fn new() -> Arc<Self> {
        Self::with_config(TransportConfig::default())
    }

    pub fn with_config(config: TransportConfig) -> Arc<Self> {
        Self::with_context(TransportContext::new(config).unwrap())
    }

    pub fn with_context(context: Arc<TransportContext>) -> Arc<Self> {
        init_tracing();
        Arc::new(Self {
            context,
            dials: Mutex::new(HashMap::new()),
            destroys: Mutex::new(HashMap::new()),
            mismatched_streams: AtomicBool::new(false),
            lookups: Mutex::new(HashMap::new()),
            routes: Mutex::new(HashMap::new()),
            unreachable: Mutex::new(HashSet::new()),
            unresolvable: Mutex::new(HashSet::new()),
            connect_delay: Mutex::new(Duration::ZERO),
            accept_queue: Mutex::new(None),
        })
    }

    pub fn context(&self) -> Arc<TransportContext> {
        self.context.clone()
    }

    /// 流式端点，默认解析为与主机同名的单个地址
    pub fn endpoint(self: &Arc<Self>, host: &str) -> Arc<dyn Endpoint> {
        Arc::new(MockEndpoint {
            network: self.clone(),
            host: host.to_string(),
            datagram: false,
            protocol: Protocol::Ice2,
            compress: false,
        })
    }

    pub fn compressed_endpoint(self: &Arc<Self>, host: &str) -> Arc<dyn Endpoint> {
        Arc::new(MockEndpoint {
            network: self.clone(),
            host: host.to_string(),
            datagram: false,
            protocol: Protocol::Ice2,
            compress: true,
        })
    }

    pub fn datagram_endpoint(self: &Arc<Self>, host: &str, protocol: Protocol) -> Arc<dyn Endpoint> {
        Arc::new(MockEndpoint {
            network: self.clone(),
            host: host.to_string(),
            datagram: true,
            protocol,
            compress: false,
        })
    }

    /// 让 `host` 解析为给定的地址列表
    pub fn route(&self, host: &str, addrs: &[&str]) {
        self.routes
            .lock()
            .insert(host.to_string(), addrs.iter().map(|a| a.to_string()).collect());
    }

    pub fn set_unreachable(&self, addr: &str) {
        self.unreachable.lock().insert(addr.to_string());
    }

    pub fn set_unresolvable(&self, host: &str) {
        self.unresolvable.lock().insert(host.to_string());
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock() = delay;
    }

    pub fn dials(&self, addr: &str) -> usize {
        self.dials.lock().get(addr).copied().unwrap_or(0)
    }

    /// 收发器被 `destroy` 的次数（按地址或对端统计）
    pub fn destroys(&self, addr: &str) -> usize {
        self.destroys.lock().get(addr).copied().unwrap_or(0)
    }

    /// 让流式端点自称数据报，ice2 的流式端点因此无法创建连接
    pub fn set_mismatched_streams(&self, mismatched: bool) {
        self.mismatched_streams.store(mismatched, Ordering::SeqCst);
    }

    pub fn total_dials(&self) -> usize {
        self.dials.lock().values().sum()
    }

    pub fn lookups(&self, host: &str) -> usize {
        self.lookups.lock().get(host).copied().unwrap_or(0)
    }

    /// 监听器从返回的发送端取得 accept 结果
    pub fn accept_queue(&self) -> mpsc::UnboundedSender<AcceptResult> {
        let (sender, receiver) = mpsc::unbounded_channel();
        *self.accept_queue.lock() = Some(receiver);
        sender
    }

    pub fn server_transceiver(self: &Arc<Self>, peer: &str) -> Box<dyn Transceiver> {
        Box::new(MockTransceiver::new(self.clone(), peer, true))
    }
}

pub struct MockEndpoint {
    network: Arc<MockNetwork>,
    host: String,
    datagram: bool,
    protocol: Protocol,
    compress: bool,
}

impl PartialEq for MockEndpoint {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.datagram == other.datagram && self.protocol == other.protocol
    }
}

impl Eq for MockEndpoint {}

impl Hash for MockEndpoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host.hash(state);
        self.datagram.hash(state);
        self.protocol.hash(state);
    }
}

impl std::fmt::Debug for MockEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MockEndpoint({})", self.host)
    }
}

impl std::fmt::Display for MockEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "mock -h {}", self.host)
    }
}

#[async_trait]
impl Endpoint for MockEndpoint {
    fn transport(&self) -> Transport {
        if self.datagram {
            Transport::Udp
        } else {
            Transport::Tcp
        }
    }

    fn protocol(&self) -> Protocol {
        self.protocol
    }

    fn host(&self) -> &str {
        &self.host
    }

    fn port(&self) -> u16 {
        0
    }

    fn is_datagram(&self) -> bool {
        self.datagram || self.network.mismatched_streams.load(Ordering::SeqCst)
    }

    fn option(&self, name: &str) -> Option<String> {
        match name {
            "compress" => self.compress.then(|| "true".to_string()),
            _ => None,
        }
    }

    fn is_local(&self, other: &dyn Endpoint) -> bool {
        icelink::endpoint::ip_is_local(self, other)
    }

    fn with_port(&self, _port: u16) -> Arc<dyn Endpoint> {
        Arc::new(MockEndpoint {
            network: self.network.clone(),
            host: self.host.clone(),
            datagram: self.datagram,
            protocol: self.protocol,
            compress: self.compress,
        })
    }

    async fn connectors(&self, _selection: EndpointSelection) -> Result<Vec<Arc<dyn Connector>>, TransportError> {
        *self.network.lookups.lock().entry(self.host.clone()).or_default() += 1;
        tokio::task::yield_now().await;

        if self.network.unresolvable.lock().contains(&self.host) {
            return Err(TransportError::resolution_error(&self.host, "host not found"));
        }
        let addrs = self
            .network
            .routes
            .lock()
            .get(&self.host)
            .cloned()
            .unwrap_or_else(|| vec![self.host.clone()]);
        Ok(addrs
            .into_iter()
            .map(|address| {
                Arc::new(MockConnector {
                    network: self.network.clone(),
                    address,
                }) as Arc<dyn Connector>
            })
            .collect())
    }

    async fn acceptor(&self) -> Result<Box<dyn Acceptor>, TransportError> {
        let receiver = self
            .network
            .accept_queue
            .lock()
            .take()
            .ok_or_else(|| TransportError::config_error("accept_queue", "no accept queue installed"))?;
        Ok(Box::new(MockAcceptor {
            endpoint: self.with_port(0),
            receiver: tokio::sync::Mutex::new(receiver),
            cancel: CancellationToken::new(),
        }))
    }

    async fn bind_datagram(&self) -> Result<(Box<dyn Transceiver>, Arc<dyn Endpoint>), TransportError> {
        Ok((
            Box::new(MockTransceiver::new(self.network.clone(), &self.host, true)),
            self.with_port(0),
        ))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn eq_endpoint(&self, other: &dyn Endpoint) -> bool {
        downcast_eq(self, other.as_any())
    }

    fn hash_endpoint(&self, state: &mut dyn Hasher) {
        hash_into(self, state)
    }
}

pub struct MockConnector {
    network: Arc<MockNetwork>,
    address: String,
}

impl PartialEq for MockConnector {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for MockConnector {}

impl Hash for MockConnector {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
    }
}

impl std::fmt::Debug for MockConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MockConnector({})", self.address)
    }
}

impl std::fmt::Display for MockConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.address)
    }
}

impl Connector for MockConnector {
    fn connect(&self) -> Result<Box<dyn Transceiver>, TransportError> {
        Ok(Box::new(MockTransceiver::new(self.network.clone(), &self.address, false)))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn eq_connector(&self, other: &dyn Connector) -> bool {
        downcast_eq(self, other.as_any())
    }

    fn hash_connector(&self, state: &mut dyn Hasher) {
        hash_into(self, state)
    }
}

pub struct MockTransceiver {
    network: Arc<MockNetwork>,
    address: String,
    server: bool,
    cancel: CancellationToken,
}

impl MockTransceiver {
    fn new(network: Arc<MockNetwork>, address: &str, server: bool) -> Self {
        Self {
            network,
            address: address.to_string(),
            server,
            cancel: CancellationToken::new(),
        }
    }
}

impl std::fmt::Display for MockTransceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "mock transceiver {}", self.address)
    }
}

#[async_trait]
impl Transceiver for MockTransceiver {
    async fn initialize(&self) -> Result<(), TransportError> {
        if self.server {
            return Ok(());
        }
        *self.network.dials.lock().entry(self.address.clone()).or_default() += 1;

        let delay = *self.network.connect_delay.lock();
        if !delay.is_zero() {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Err(TransportError::connection_error("destroyed", false));
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        if self.network.unreachable.lock().contains(&self.address) {
            return Err(TransportError::connection_error(
                format!("connection refused: {}", self.address),
                true,
            ));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }

    fn destroy(&self) {
        *self.network.destroys.lock().entry(self.address.clone()).or_default() += 1;
        self.cancel.cancel();
    }

    async fn read(&self, _buf: &mut BytesMut) -> Result<usize, TransportError> {
        self.cancel.cancelled().await;
        Err(TransportError::connection_error("destroyed", false))
    }

    async fn write(&self, _buf: &[u8]) -> Result<(), TransportError> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::connection_error("destroyed", false));
        }
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }
}

pub struct MockAcceptor {
    endpoint: Arc<dyn Endpoint>,
    receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<AcceptResult>>,
    cancel: CancellationToken,
}

impl std::fmt::Display for MockAcceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "mock acceptor {}", self.endpoint)
    }
}

#[async_trait]
impl Acceptor for MockAcceptor {
    fn endpoint(&self) -> Arc<dyn Endpoint> {
        self.endpoint.clone()
    }

    async fn accept(&self) -> AcceptResult {
        let mut receiver = self.receiver.lock().await;
        tokio::select! {
            _ = self.cancel.cancelled() => Err(TransportError::disposed("mock acceptor")),
            next = receiver.recv() => match next {
                Some(result) => result,
                None => {
                    self.cancel.cancelled().await;
                    Err(TransportError::disposed("mock acceptor"))
                }
            },
        }
    }

    fn close(&self) {
        self.cancel.cancel();
    }
}

/// 统计 attach / detach / failed 调用次数的观测器
#[derive(Default)]
pub struct CountingObserver {
    pub attached: AtomicUsize,
    pub detached: AtomicUsize,
    pub failed: AtomicUsize,
}

impl Observer for CountingObserver {
    fn attach(&self) {
        self.attached.fetch_add(1, Ordering::SeqCst);
    }

    fn detach(&self) {
        self.detached.fetch_add(1, Ordering::SeqCst);
    }

    fn failed(&self, _reason: &str) {
        self.failed.fetch_add(1, Ordering::SeqCst);
    }
}

/// 每类观测共用一个计数器
#[derive(Default)]
pub struct CountingCommunicatorObserver {
    pub lookup: Arc<CountingObserver>,
    pub establishment: Arc<CountingObserver>,
    pub states: Mutex<Vec<ConnectionState>>,
}

impl CommunicatorObserver for CountingCommunicatorObserver {
    fn endpoint_lookup_observer(&self, _endpoint: &dyn Endpoint) -> Option<Arc<dyn Observer>> {
        Some(self.lookup.clone())
    }

    fn connection_establishment_observer(
        &self,
        _endpoint: &dyn Endpoint,
        _connector: &str,
    ) -> Option<Arc<dyn Observer>> {
        Some(self.establishment.clone())
    }

    fn connection_observer(
        &self,
        _endpoint: &dyn Endpoint,
        state: ConnectionState,
        _previous: Option<Arc<dyn Observer>>,
    ) -> Option<Arc<dyn Observer>> {
        self.states.lock().push(state);
        None
    }
}
