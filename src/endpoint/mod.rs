/// 端点与连接器抽象
///
/// 端点是逻辑目的地（传输 + 协议 + 主机 + 端口 + 选项），异步展开为一个或多个连接器；
/// 连接器是一个具体可达的网络目的地（例如一个解析出来的 IP + 端口）。两者都以 trait 对象
/// 的形式在缓存中充当键，所以这里给 `dyn Endpoint` / `dyn Connector` 提供相等和哈希。

use async_trait::async_trait;
use std::any::Any;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::{
    error::TransportError,
    transport::{Acceptor, Transceiver},
};

pub mod network;
pub mod parse;

pub use parse::parse_endpoint;

/// ice2 端点的缺省端口
pub const DEFAULT_IP_PORT: u16 = 4062;

/// RPC 协议版本
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Ice1,
    Ice2,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Ice1 => write!(f, "ice1"),
            Protocol::Ice2 => write!(f, "ice2"),
        }
    }
}

/// 传输类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Tcp,
    Ssl,
    Udp,
    Ws,
    Wss,
}

impl Transport {
    /// 传输名称
    pub fn name(&self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
            Transport::Ssl => "ssl",
            Transport::Udp => "udp",
            Transport::Ws => "ws",
            Transport::Wss => "wss",
        }
    }

    /// 按名称查找传输
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "tcp" => Some(Transport::Tcp),
            "ssl" => Some(Transport::Ssl),
            "udp" => Some(Transport::Udp),
            "ws" => Some(Transport::Ws),
            "wss" => Some(Transport::Wss),
            _ => None,
        }
    }
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// 端点展开为连接器时的排序策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointSelection {
    /// 打乱解析结果
    Random,
    /// 保持解析结果的顺序
    Ordered,
}

/// 逻辑端点
///
/// 端点构造后不可变，"修改"端点的方法（例如 [`Endpoint::with_port`]）返回新实例。
/// 缓存使用的相等和哈希忽略压缩标志。
#[async_trait]
pub trait Endpoint: std::fmt::Display + std::fmt::Debug + Send + Sync + Any {
    /// 传输类型
    fn transport(&self) -> Transport;

    /// 传输名称，用于日志
    fn transport_name(&self) -> &'static str {
        self.transport().name()
    }

    /// 协议版本
    fn protocol(&self) -> Protocol;

    /// 主机名或 IP 地址，空字符串表示通配地址
    fn host(&self) -> &str;

    /// 端口
    fn port(&self) -> u16;

    /// 是否为数据报端点
    fn is_datagram(&self) -> bool {
        false
    }

    /// 查询传输相关选项，例如 `source-address`、`ttl`
    fn option(&self, _name: &str) -> Option<String> {
        None
    }

    /// 除连接ID外与 `other` 指向同一个监听点
    fn is_local(&self, other: &dyn Endpoint) -> bool;

    /// 返回端口替换为 `port` 的新端点
    fn with_port(&self, port: u16) -> Arc<dyn Endpoint>;

    /// 异步展开为连接器，可能需要域名解析
    async fn connectors(
        &self,
        selection: EndpointSelection,
    ) -> Result<Vec<Arc<dyn Connector>>, TransportError>;

    /// 创建流式监听器，返回的监听器持有实际绑定后的端点
    async fn acceptor(&self) -> Result<Box<dyn Acceptor>, TransportError> {
        Err(TransportError::protocol_error(
            self.transport_name(),
            format!("transport `{}' cannot accept stream connections", self.transport_name()),
        ))
    }

    /// 绑定数据报收发器，返回收发器和实际绑定后的端点
    async fn bind_datagram(&self) -> Result<(Box<dyn Transceiver>, Arc<dyn Endpoint>), TransportError> {
        Err(TransportError::protocol_error(
            self.transport_name(),
            format!("transport `{}' is not a datagram transport", self.transport_name()),
        ))
    }

    fn as_any(&self) -> &dyn Any;

    /// `dyn Endpoint` 的相等比较，通常实现为 [`downcast_eq`]
    fn eq_endpoint(&self, other: &dyn Endpoint) -> bool;

    /// `dyn Endpoint` 的哈希，通常实现为 [`hash_into`]
    fn hash_endpoint(&self, state: &mut dyn Hasher);
}

impl<'a> PartialEq for dyn Endpoint + 'a {
    fn eq(&self, other: &Self) -> bool {
        self.eq_endpoint(other)
    }
}

impl<'a> Eq for dyn Endpoint + 'a {}

impl<'a> Hash for dyn Endpoint + 'a {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash_endpoint(state)
    }
}

/// 具体的网络目的地
///
/// 按 (协议, 传输, 解析后的地址, 源地址) 比较和哈希。
pub trait Connector: std::fmt::Display + std::fmt::Debug + Send + Sync + Any {
    /// 创建尚未连接的收发器，实际的 socket 连接在 [`Transceiver::initialize`] 中完成
    fn connect(&self) -> Result<Box<dyn Transceiver>, TransportError>;

    fn as_any(&self) -> &dyn Any;

    fn eq_connector(&self, other: &dyn Connector) -> bool;

    fn hash_connector(&self, state: &mut dyn Hasher);
}

impl<'a> PartialEq for dyn Connector + 'a {
    fn eq(&self, other: &Self) -> bool {
        self.eq_connector(other)
    }
}

impl<'a> Eq for dyn Connector + 'a {}

impl<'a> Hash for dyn Connector + 'a {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash_connector(state)
    }
}

/// 同类型才可能相等
pub fn downcast_eq<T: PartialEq + 'static>(this: &T, other: &dyn Any) -> bool {
    other.downcast_ref::<T>().is_some_and(|other| this == other)
}

/// 把具体类型的哈希写入 `dyn Hasher`
pub fn hash_into<T: Hash + 'static>(this: &T, mut state: &mut dyn Hasher) {
    std::any::TypeId::of::<T>().hash(&mut state);
    this.hash(&mut state);
}

/// IP 类端点的 `is_local`：比较传输、主机、端口和源地址，不考虑连接ID和协议
pub fn ip_is_local(this: &dyn Endpoint, other: &dyn Endpoint) -> bool {
    this.transport() == other.transport()
        && this.host() == other.host()
        && this.port() == other.port()
        && this.option("source-address") == other.option("source-address")
}
