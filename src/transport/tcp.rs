use async_trait::async_trait;
use bytes::BytesMut;
use std::any::Any;
use std::hash::{Hash, Hasher};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpSocket, TcpStream,
    },
};
use tokio_util::sync::CancellationToken;

use crate::{
    context::TransportContext,
    endpoint::{
        downcast_eq, hash_into, ip_is_local, network, Connector, Endpoint, EndpointSelection,
        Protocol, Transport,
    },
    error::TransportError,
    transport::{Acceptor, Transceiver},
};

/// TCP传输错误类型
#[derive(Debug, thiserror::Error)]
pub enum TcpError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection timeout after {0:?}")]
    Timeout(Duration),

    #[error("Transceiver destroyed")]
    Destroyed,

    #[error("Not connected")]
    NotConnected,
}

impl From<TcpError> for TransportError {
    fn from(error: TcpError) -> Self {
        match error {
            TcpError::Io(io_err) => TransportError::connection_error(format!("TCP IO error: {}", io_err), true),
            TcpError::Timeout(duration) => TransportError::timeout_error("tcp connect", duration),
            TcpError::Destroyed => TransportError::connection_error("TCP transceiver destroyed", false),
            TcpError::NotConnected => TransportError::connection_error("TCP transceiver not connected", false),
        }
    }
}

/// TCP 端点
///
/// 相等和哈希只看协议、主机、端口、源地址和超时，压缩标志不参与。
#[derive(Clone)]
pub struct TcpEndpoint {
    context: Arc<TransportContext>,
    protocol: Protocol,
    host: String,
    port: u16,
    source_address: Option<IpAddr>,
    timeout: Option<Duration>,
    compress: bool,
}

impl TcpEndpoint {
    pub fn new(context: Arc<TransportContext>, protocol: Protocol, host: impl Into<String>, port: u16) -> Self {
        Self {
            context,
            protocol,
            host: host.into(),
            port,
            source_address: None,
            timeout: None,
            compress: false,
        }
    }

    /// 客户端连接使用的源地址
    pub fn with_source_address(mut self, source_address: Option<IpAddr>) -> Self {
        self.source_address = source_address;
        self
    }

    /// 连接超时，None 时使用配置中的 `connect_timeout`
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_compress(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    pub fn source_address(&self) -> Option<IpAddr> {
        self.source_address
    }

    pub fn compress(&self) -> bool {
        self.compress
    }

    fn connect_timeout(&self) -> Duration {
        self.timeout.unwrap_or(self.context.config().connect_timeout)
    }
}

impl PartialEq for TcpEndpoint {
    fn eq(&self, other: &Self) -> bool {
        self.protocol == other.protocol
            && self.host == other.host
            && self.port == other.port
            && self.source_address == other.source_address
            && self.timeout == other.timeout
    }
}

impl Eq for TcpEndpoint {}

impl Hash for TcpEndpoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.protocol.hash(state);
        self.host.hash(state);
        self.port.hash(state);
        self.source_address.hash(state);
        self.timeout.hash(state);
    }
}

impl std::fmt::Debug for TcpEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpEndpoint")
            .field("protocol", &self.protocol)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("source_address", &self.source_address)
            .field("timeout", &self.timeout)
            .field("compress", &self.compress)
            .finish()
    }
}

impl std::fmt::Display for TcpEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.protocol {
            Protocol::Ice1 => {
                write!(f, "tcp")?;
                if !self.host.is_empty() {
                    if self.host.contains(':') {
                        write!(f, " -h \"{}\"", self.host)?;
                    } else {
                        write!(f, " -h {}", self.host)?;
                    }
                }
                write!(f, " -p {}", self.port)?;
                match self.timeout {
                    Some(timeout) if timeout.is_zero() => write!(f, " -t infinite")?,
                    Some(timeout) => write!(f, " -t {}", timeout.as_millis())?,
                    None => {}
                }
                if self.compress {
                    write!(f, " -z")?;
                }
                if let Some(source) = self.source_address {
                    write!(f, " --sourceAddress {}", source)?;
                }
                Ok(())
            }
            Protocol::Ice2 => {
                if self.host.contains(':') {
                    write!(f, "ice+tcp://[{}]:{}", self.host, self.port)?;
                } else {
                    write!(f, "ice+tcp://{}:{}", self.host, self.port)?;
                }
                if let Some(source) = self.source_address {
                    write!(f, "?source-address={}", source)?;
                }
                Ok(())
            }
        }
    }
}

#[async_trait]
impl Endpoint for TcpEndpoint {
    fn transport(&self) -> Transport {
        Transport::Tcp
    }

    fn protocol(&self) -> Protocol {
        self.protocol
    }

    fn host(&self) -> &str {
        &self.host
    }

    fn port(&self) -> u16 {
        self.port
    }

    fn option(&self, name: &str) -> Option<String> {
        match name {
            "source-address" => self.source_address.map(|ip| ip.to_string()),
            "timeout" => self.timeout.map(|t| {
                if t.is_zero() {
                    "infinite".to_string()
                } else {
                    t.as_millis().to_string()
                }
            }),
            "compress" => self.compress.then(|| "true".to_string()),
            _ => None,
        }
    }

    fn is_local(&self, other: &dyn Endpoint) -> bool {
        ip_is_local(self, other)
    }

    fn with_port(&self, port: u16) -> Arc<dyn Endpoint> {
        let mut endpoint = self.clone();
        endpoint.port = port;
        Arc::new(endpoint)
    }

    async fn connectors(&self, selection: EndpointSelection) -> Result<Vec<Arc<dyn Connector>>, TransportError> {
        let addrs = network::resolve_for_client(&self.context, self, selection).await?;
        let timeout = self.connect_timeout();
        Ok(addrs
            .into_iter()
            .map(|addr| {
                Arc::new(TcpConnector {
                    protocol: self.protocol,
                    addr,
                    source_address: self.source_address,
                    timeout,
                }) as Arc<dyn Connector>
            })
            .collect())
    }

    async fn acceptor(&self) -> Result<Box<dyn Acceptor>, TransportError> {
        let bind_addr = network::resolve_for_bind(self.context.config(), &self.host, self.port).await?;
        tracing::debug!("🚀 TCP监听器绑定到: {}", bind_addr);

        let listener = TcpListener::bind(bind_addr).await.map_err(TcpError::Io)?;
        let local_addr = listener.local_addr().map_err(TcpError::Io)?;
        tracing::info!("✅ TCP监听器成功启动在: {}", local_addr);

        Ok(Box::new(TcpAcceptor {
            listener: parking_lot::Mutex::new(Some(Arc::new(listener))),
            local_addr,
            endpoint: self.with_port(local_addr.port()),
            cancel: CancellationToken::new(),
        }))
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

/// 解析后的 TCP 目的地
#[derive(Debug, Clone)]
pub struct TcpConnector {
    protocol: Protocol,
    addr: SocketAddr,
    source_address: Option<IpAddr>,
    timeout: Duration,
}

impl TcpConnector {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl PartialEq for TcpConnector {
    fn eq(&self, other: &Self) -> bool {
        self.protocol == other.protocol && self.addr == other.addr && self.source_address == other.source_address
    }
}

impl Eq for TcpConnector {}

impl Hash for TcpConnector {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.protocol.hash(state);
        self.addr.hash(state);
        self.source_address.hash(state);
    }
}

impl std::fmt::Display for TcpConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.addr)
    }
}

impl Connector for TcpConnector {
    fn connect(&self) -> Result<Box<dyn Transceiver>, TransportError> {
        Ok(Box::new(TcpTransceiver::client(self.addr, self.source_address, self.timeout)))
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

#[derive(Debug, Clone, Copy)]
struct TcpTarget {
    addr: SocketAddr,
    source_address: Option<IpAddr>,
    timeout: Duration,
}

impl TcpTarget {
    async fn connect(&self) -> Result<TcpStream, TcpError> {
        tracing::debug!("🔌 TCP客户端连接到: {}", self.addr);

        let socket = if self.addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        if let Some(source) = self.source_address {
            socket.bind(SocketAddr::new(source, 0))?;
        }

        let stream = if self.timeout != Duration::from_secs(0) {
            tokio::time::timeout(self.timeout, socket.connect(self.addr))
                .await
                .map_err(|_| TcpError::Timeout(self.timeout))??
        } else {
            socket.connect(self.addr).await?
        };

        tracing::debug!("✅ TCP连接建立成功: {}", self.addr);
        Ok(stream)
    }
}

/// TCP 收发器
///
/// 读写两半分别加锁，读和写可以并发进行；`destroy` 通过取消令牌中断挂起的 I/O。
pub struct TcpTransceiver {
    target: Option<TcpTarget>,
    reader: tokio::sync::Mutex<Option<OwnedReadHalf>>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    addrs: parking_lot::Mutex<(Option<SocketAddr>, Option<SocketAddr>)>,
    cancel: CancellationToken,
}

impl TcpTransceiver {
    async fn release(&self) {
        self.writer.lock().await.take();
        self.reader.lock().await.take();
        self.addrs.lock().0 = None;
    }

    /// 尚未连接的客户端收发器
    pub fn client(addr: SocketAddr, source_address: Option<IpAddr>, timeout: Duration) -> Self {
        Self {
            target: Some(TcpTarget {
                addr,
                source_address,
                timeout,
            }),
            reader: tokio::sync::Mutex::new(None),
            writer: tokio::sync::Mutex::new(None),
            addrs: parking_lot::Mutex::new((None, Some(addr))),
            cancel: CancellationToken::new(),
        }
    }

    /// 由监听器接受的已连接收发器
    pub fn accepted(stream: TcpStream) -> Result<Self, TcpError> {
        stream.set_nodelay(true)?;
        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            target: None,
            reader: tokio::sync::Mutex::new(Some(reader)),
            writer: tokio::sync::Mutex::new(Some(writer)),
            addrs: parking_lot::Mutex::new((Some(local_addr), Some(peer_addr))),
            cancel: CancellationToken::new(),
        })
    }
}

#[async_trait]
impl Transceiver for TcpTransceiver {
    async fn initialize(&self) -> Result<(), TransportError> {
        let Some(target) = self.target else {
            return Ok(());
        };
        if self.cancel.is_cancelled() {
            return Err(TcpError::Destroyed.into());
        }

        let stream = tokio::select! {
            _ = self.cancel.cancelled() => return Err(TcpError::Destroyed.into()),
            result = target.connect() => result?,
        };

        stream.set_nodelay(true).map_err(TcpError::Io)?;
        let local_addr = stream.local_addr().map_err(TcpError::Io)?;
        let (reader, writer) = stream.into_split();
        *self.reader.lock().await = Some(reader);
        *self.writer.lock().await = Some(writer);
        self.addrs.lock().0 = Some(local_addr);

        // destroy 可能发生在连接完成和保存读写两半之间
        if self.cancel.is_cancelled() {
            self.release().await;
            return Err(TcpError::Destroyed.into());
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut guard = self.writer.lock().await;
        if let Some(writer) = guard.as_mut() {
            match writer.shutdown().await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotConnected => {}
                Err(e) => return Err(TcpError::Io(e).into()),
            }
        }
        Ok(())
    }

    fn destroy(&self) {
        self.cancel.cancel();
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }
        if let Ok(mut reader) = self.reader.try_lock() {
            reader.take();
        }
    }

    async fn read(&self, buf: &mut BytesMut) -> Result<usize, TransportError> {
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(TcpError::NotConnected)?;
        tokio::select! {
            _ = self.cancel.cancelled() => Err(TcpError::Destroyed.into()),
            result = reader.read_buf(buf) => Ok(result.map_err(TcpError::Io)?),
        }
    }

    async fn write(&self, buf: &[u8]) -> Result<(), TransportError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(TcpError::NotConnected)?;
        tokio::select! {
            _ = self.cancel.cancelled() => Err(TcpError::Destroyed.into()),
            result = writer.write_all(buf) => Ok(result.map_err(TcpError::Io)?),
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.addrs.lock().0
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.addrs.lock().1
    }
}

impl std::fmt::Display for TcpTransceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (local, peer) = *self.addrs.lock();
        match local {
            Some(local) => write!(f, "local address = {}", local)?,
            None => write!(f, "local address = <not connected>")?,
        }
        match peer {
            Some(peer) => write!(f, "\nremote address = {}", peer),
            None => write!(f, "\nremote address = <not connected>"),
        }
    }
}

/// TCP 监听器
///
/// `close` 释放监听套接字；挂起的 `accept` 持有的引用在取消后随之释放，之后端口不再接受连接。
pub struct TcpAcceptor {
    listener: parking_lot::Mutex<Option<Arc<TcpListener>>>,
    local_addr: SocketAddr,
    endpoint: Arc<dyn Endpoint>,
    cancel: CancellationToken,
}

#[async_trait]
impl Acceptor for TcpAcceptor {
    fn endpoint(&self) -> Arc<dyn Endpoint> {
        self.endpoint.clone()
    }

    async fn accept(&self) -> Result<Box<dyn Transceiver>, TransportError> {
        let Some(listener) = self.listener.lock().clone() else {
            return Err(TransportError::disposed("tcp acceptor"));
        };
        let (stream, peer_addr) = tokio::select! {
            _ = self.cancel.cancelled() => return Err(TransportError::disposed("tcp acceptor")),
            result = listener.accept() => result.map_err(TcpError::Io)?,
        };
        tracing::debug!("🔗 TCP新连接来自: {}", peer_addr);
        Ok(Box::new(TcpTransceiver::accepted(stream)?))
    }

    fn close(&self) {
        tracing::debug!("🛑 关闭TCP监听器: {}", self.endpoint);
        self.cancel.cancel();
        self.listener.lock().take();
    }
}

impl std::fmt::Display for TcpAcceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.listener.lock().is_some() {
            write!(f, "local address = {}", self.local_addr)
        } else {
            write!(f, "local address = {} <closed>", self.local_addr)
        }
    }
}
