/// UDP 传输，只支持 ice1 协议

use async_trait::async_trait;
use bytes::BytesMut;
use std::any::Any;
use std::hash::{Hash, Hasher};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::{
    context::TransportContext,
    endpoint::{
        downcast_eq, hash_into, ip_is_local, network, Connector, Endpoint, EndpointSelection,
        Protocol, Transport,
    },
    error::TransportError,
    transport::Transceiver,
};

/// 单个数据报的最大负载
pub const MAX_DATAGRAM_SIZE: usize = 65507;

fn io_error(error: io::Error) -> TransportError {
    TransportError::connection_error(format!("UDP IO error: {}", error), true)
}

/// UDP 端点
#[derive(Clone)]
pub struct UdpEndpoint {
    context: Arc<TransportContext>,
    host: String,
    port: u16,
    source_address: Option<IpAddr>,
    multicast_interface: Option<String>,
    multicast_ttl: Option<u32>,
    connect: bool,
    compress: bool,
}

impl UdpEndpoint {
    pub fn new(context: Arc<TransportContext>, host: impl Into<String>, port: u16) -> Self {
        Self {
            context,
            host: host.into(),
            port,
            source_address: None,
            multicast_interface: None,
            multicast_ttl: None,
            connect: false,
            compress: false,
        }
    }

    pub fn with_source_address(mut self, source_address: Option<IpAddr>) -> Self {
        self.source_address = source_address;
        self
    }

    pub fn with_multicast_interface(mut self, interface: Option<String>) -> Self {
        self.multicast_interface = interface;
        self
    }

    pub fn with_multicast_ttl(mut self, ttl: Option<u32>) -> Self {
        self.multicast_ttl = ttl;
        self
    }

    pub fn with_connect(mut self, connect: bool) -> Self {
        self.connect = connect;
        self
    }

    pub fn with_compress(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    fn multicast_interface_v4(&self) -> Ipv4Addr {
        self.multicast_interface
            .as_deref()
            .and_then(|iface| iface.parse().ok())
            .unwrap_or(Ipv4Addr::UNSPECIFIED)
    }
}

impl PartialEq for UdpEndpoint {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host
            && self.port == other.port
            && self.source_address == other.source_address
            && self.multicast_interface == other.multicast_interface
            && self.multicast_ttl == other.multicast_ttl
            && self.connect == other.connect
    }
}

impl Eq for UdpEndpoint {}

impl Hash for UdpEndpoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host.hash(state);
        self.port.hash(state);
        self.source_address.hash(state);
        self.multicast_interface.hash(state);
        self.multicast_ttl.hash(state);
        self.connect.hash(state);
    }
}

impl std::fmt::Debug for UdpEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpEndpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("source_address", &self.source_address)
            .field("multicast_interface", &self.multicast_interface)
            .field("multicast_ttl", &self.multicast_ttl)
            .field("connect", &self.connect)
            .field("compress", &self.compress)
            .finish()
    }
}

impl std::fmt::Display for UdpEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "udp")?;
        if !self.host.is_empty() {
            if self.host.contains(':') {
                write!(f, " -h \"{}\"", self.host)?;
            } else {
                write!(f, " -h {}", self.host)?;
            }
        }
        write!(f, " -p {}", self.port)?;
        if self.connect {
            write!(f, " -c")?;
        }
        if self.compress {
            write!(f, " -z")?;
        }
        if let Some(source) = self.source_address {
            write!(f, " --sourceAddress {}", source)?;
        }
        if let Some(iface) = &self.multicast_interface {
            write!(f, " --interface {}", iface)?;
        }
        if let Some(ttl) = self.multicast_ttl {
            write!(f, " --ttl {}", ttl)?;
        }
        Ok(())
    }
}

#[async_trait]
impl Endpoint for UdpEndpoint {
    fn transport(&self) -> Transport {
        Transport::Udp
    }

    fn protocol(&self) -> Protocol {
        Protocol::Ice1
    }

    fn host(&self) -> &str {
        &self.host
    }

    fn port(&self) -> u16 {
        self.port
    }

    fn is_datagram(&self) -> bool {
        true
    }

    fn option(&self, name: &str) -> Option<String> {
        match name {
            "source-address" => self.source_address.map(|ip| ip.to_string()),
            "interface" => self.multicast_interface.clone(),
            "ttl" => self.multicast_ttl.map(|ttl| ttl.to_string()),
            "connect" => self.connect.then(|| "true".to_string()),
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
        Ok(addrs
            .into_iter()
            .map(|addr| {
                Arc::new(UdpConnector {
                    addr,
                    source_address: self.source_address,
                    multicast_interface: self.multicast_interface.clone(),
                    multicast_ttl: self.multicast_ttl,
                }) as Arc<dyn Connector>
            })
            .collect())
    }

    async fn bind_datagram(&self) -> Result<(Box<dyn Transceiver>, Arc<dyn Endpoint>), TransportError> {
        let addr = network::resolve_for_bind(self.context.config(), &self.host, self.port).await?;

        let socket = match addr.ip() {
            IpAddr::V4(group) if group.is_multicast() => {
                let socket = UdpSocket::bind(SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), addr.port()))
                    .await
                    .map_err(io_error)?;
                socket
                    .join_multicast_v4(group, self.multicast_interface_v4())
                    .map_err(io_error)?;
                socket
            }
            IpAddr::V6(group) if group.is_multicast() => {
                let socket = UdpSocket::bind(SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), addr.port()))
                    .await
                    .map_err(io_error)?;
                socket.join_multicast_v6(&group, 0).map_err(io_error)?;
                socket
            }
            _ => UdpSocket::bind(addr).await.map_err(io_error)?,
        };

        let local_addr = socket.local_addr().map_err(io_error)?;
        tracing::info!("✅ UDP套接字绑定到: {}", local_addr);

        Ok((Box::new(UdpTransceiver::server(socket)), self.with_port(local_addr.port())))
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

/// 解析后的 UDP 目的地
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UdpConnector {
    addr: SocketAddr,
    source_address: Option<IpAddr>,
    multicast_interface: Option<String>,
    multicast_ttl: Option<u32>,
}

impl std::fmt::Display for UdpConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.addr)
    }
}

impl Connector for UdpConnector {
    fn connect(&self) -> Result<Box<dyn Transceiver>, TransportError> {
        Ok(Box::new(UdpTransceiver::client(self.addr, self.source_address, self.multicast_ttl)))
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
struct UdpTarget {
    addr: SocketAddr,
    source_address: Option<IpAddr>,
    multicast_ttl: Option<u32>,
}

/// UDP 收发器
///
/// 客户端收发器 connect 到目的地址；服务端收发器记录最近一个数据报的来源，回复发给它。
pub struct UdpTransceiver {
    target: Option<UdpTarget>,
    socket: parking_lot::Mutex<Option<Arc<UdpSocket>>>,
    peer: parking_lot::Mutex<Option<SocketAddr>>,
    cancel: CancellationToken,
}

impl UdpTransceiver {
    pub fn client(addr: SocketAddr, source_address: Option<IpAddr>, multicast_ttl: Option<u32>) -> Self {
        Self {
            target: Some(UdpTarget {
                addr,
                source_address,
                multicast_ttl,
            }),
            socket: parking_lot::Mutex::new(None),
            peer: parking_lot::Mutex::new(Some(addr)),
            cancel: CancellationToken::new(),
        }
    }

    pub fn server(socket: UdpSocket) -> Self {
        Self {
            target: None,
            socket: parking_lot::Mutex::new(Some(Arc::new(socket))),
            peer: parking_lot::Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    fn socket(&self) -> Result<Arc<UdpSocket>, TransportError> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::connection_error("UDP transceiver destroyed", false));
        }
        self.socket
            .lock()
            .clone()
            .ok_or_else(|| TransportError::connection_error("UDP transceiver not connected", false))
    }
}

#[async_trait]
impl Transceiver for UdpTransceiver {
    async fn initialize(&self) -> Result<(), TransportError> {
        let Some(target) = self.target else {
            return Ok(());
        };

        let local = match (target.source_address, target.addr) {
            (Some(source), _) => SocketAddr::new(source, 0),
            (None, SocketAddr::V4(_)) => SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0),
            (None, SocketAddr::V6(_)) => SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), 0),
        };
        let socket = UdpSocket::bind(local).await.map_err(io_error)?;
        if let (Some(ttl), IpAddr::V4(ip)) = (target.multicast_ttl, target.addr.ip()) {
            if ip.is_multicast() {
                socket.set_multicast_ttl_v4(ttl).map_err(io_error)?;
            }
        }
        socket.connect(target.addr).await.map_err(io_error)?;
        tracing::debug!("🔌 UDP客户端连接到: {}", target.addr);

        if self.cancel.is_cancelled() {
            return Err(TransportError::connection_error("UDP transceiver destroyed", false));
        }
        *self.socket.lock() = Some(Arc::new(socket));
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }

    fn destroy(&self) {
        self.cancel.cancel();
        self.socket.lock().take();
    }

    async fn read(&self, buf: &mut BytesMut) -> Result<usize, TransportError> {
        let socket = self.socket()?;
        buf.reserve(MAX_DATAGRAM_SIZE);
        if self.target.is_some() {
            tokio::select! {
                _ = self.cancel.cancelled() => Err(TransportError::connection_error("UDP transceiver destroyed", false)),
                result = socket.recv_buf(buf) => result.map_err(io_error),
            }
        } else {
            let (n, from) = tokio::select! {
                _ = self.cancel.cancelled() => return Err(TransportError::connection_error("UDP transceiver destroyed", false)),
                result = socket.recv_buf_from(buf) => result.map_err(io_error)?,
            };
            *self.peer.lock() = Some(from);
            Ok(n)
        }
    }

    async fn write(&self, buf: &[u8]) -> Result<(), TransportError> {
        if buf.len() > MAX_DATAGRAM_SIZE {
            return Err(TransportError::protocol_error(
                "udp",
                format!("datagram of {} bytes exceeds the maximum size", buf.len()),
            ));
        }
        let socket = self.socket()?;
        if self.target.is_some() {
            socket.send(buf).await.map_err(io_error)?;
        } else {
            let peer = (*self.peer.lock())
                .ok_or_else(|| TransportError::connection_error("no datagram received yet", false))?;
            socket.send_to(buf, peer).await.map_err(io_error)?;
        }
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.lock().as_ref().and_then(|socket| socket.local_addr().ok())
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        *self.peer.lock()
    }
}

impl std::fmt::Display for UdpTransceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.local_addr() {
            Some(local) => write!(f, "local address = {}", local)?,
            None => write!(f, "local address = <not bound>")?,
        }
        match self.peer_addr() {
            Some(peer) => write!(f, "\nremote address = {}", peer),
            None => write!(f, "\nremote address = <none>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IpVersion, TransportConfig};

    fn context() -> Arc<TransportContext> {
        TransportContext::new(TransportConfig::default().with_ip_version(IpVersion::V4)).unwrap()
    }

    #[test]
    fn test_display_and_options() {
        let endpoint = UdpEndpoint::new(context(), "239.255.1.1", 10000)
            .with_multicast_ttl(Some(5))
            .with_connect(true);
        assert_eq!(endpoint.to_string(), "udp -h 239.255.1.1 -p 10000 -c --ttl 5");
        assert_eq!(endpoint.option("ttl").as_deref(), Some("5"));
        assert!(endpoint.is_datagram());
        assert_eq!(endpoint.protocol(), Protocol::Ice1);
    }

    #[tokio::test]
    async fn test_datagram_exchange() {
        let endpoint = UdpEndpoint::new(context(), "127.0.0.1", 0);
        let (server, bound) = endpoint.bind_datagram().await.unwrap();
        assert_ne!(bound.port(), 0);

        let connectors = bound.connectors(EndpointSelection::Ordered).await.unwrap();
        let client = connectors[0].connect().unwrap();
        client.initialize().await.unwrap();
        client.write(b"hello").await.unwrap();

        let mut buf = BytesMut::new();
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(
            server.peer_addr().map(|addr| addr.port()),
            client.local_addr().map(|addr| addr.port())
        );

        server.write(b"world").await.unwrap();
        let mut reply = BytesMut::new();
        let n = client.read(&mut reply).await.unwrap();
        assert_eq!(&reply[..n], b"world");

        client.destroy();
        server.destroy();
        assert!(server.write(b"late").await.is_err());
    }
}
