/// 传输层
///
/// 收发器（Transceiver）是连接底下的字节通道，监听器（Acceptor）产生服务端收发器。
/// 具体协议实现放在各自的子模块里，按 feature 开关。

use async_trait::async_trait;
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::{endpoint::Endpoint, error::TransportError};

#[cfg(feature = "tcp")]
pub mod tcp;
#[cfg(feature = "udp")]
pub mod udp;

#[cfg(feature = "tcp")]
pub use tcp::{TcpAcceptor, TcpConnector, TcpEndpoint, TcpTransceiver};
#[cfg(feature = "udp")]
pub use udp::{UdpConnector, UdpEndpoint, UdpTransceiver};

/// 连接底下的字节通道
///
/// 客户端收发器由 [`Connector::connect`](crate::endpoint::Connector::connect) 同步创建，
/// 此时还没有任何网络 I/O；[`Transceiver::initialize`] 负责真正的连接和握手。
#[async_trait]
pub trait Transceiver: std::fmt::Display + Send + Sync {
    /// 建立连接 / 完成握手，服务端收发器通常直接返回
    async fn initialize(&self) -> Result<(), TransportError>;

    /// 优雅关闭，发送端先关闭
    async fn close(&self) -> Result<(), TransportError>;

    /// 立即释放底层资源，正在进行的 I/O 会以错误结束，可重复调用
    fn destroy(&self);

    /// 读取数据追加到 `buf`，返回读取的字节数；流式传输返回 0 表示对端已关闭
    async fn read(&self, buf: &mut BytesMut) -> Result<usize, TransportError>;

    /// 写入全部数据
    async fn write(&self, buf: &[u8]) -> Result<(), TransportError>;

    /// 本地地址，未连接时为 None
    fn local_addr(&self) -> Option<SocketAddr>;

    /// 对端地址，未连接或未收到数据报时为 None
    fn peer_addr(&self) -> Option<SocketAddr>;
}

/// 流式监听器
#[async_trait]
pub trait Acceptor: std::fmt::Display + Send + Sync {
    /// 实际绑定后的端点（端口 0 已被替换为系统分配的端口）
    fn endpoint(&self) -> Arc<dyn Endpoint>;

    /// 接受下一个连接，返回的收发器已连接
    async fn accept(&self) -> Result<Box<dyn Transceiver>, TransportError>;

    /// 停止监听，挂起的 `accept` 以错误返回
    fn close(&self);
}
