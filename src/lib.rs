/// icelink - RPC 连接管理核心
///
/// 客户端连接工厂负责缓存、去重并发建连、在候选地址之间回退；服务端连接工厂负责
/// 接受流式连接或承载单个数据报连接。端点、连接器和收发器是可替换的传输抽象，
/// 内置 TCP 和 UDP 实现。

// 传输层
pub mod transport;

// 端点与连接器
pub mod endpoint;

// 连接与连接工厂
pub mod connection;
pub mod factory;

// 核心类型
pub mod adapter;
pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod instrumentation;
pub mod router;

/// 会话ID的类型安全包装器
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    /// 创建新的会话ID
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// 获取原始ID值
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

impl From<u64> for SessionId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl From<SessionId> for u64 {
    fn from(session_id: SessionId) -> Self {
        session_id.0
    }
}

// 重新导出核心类型
pub use adapter::ObjectAdapter;
pub use config::{AcmConfig, IpVersion, TransportConfig as Config};
pub use connection::{Connection, ConnectionInfo, ConnectionManager, ConnectionState};
pub use context::TransportContext;
pub use endpoint::{parse_endpoint, Connector, Endpoint, EndpointSelection, Protocol, Transport};
pub use error::{CloseReason, TransportError};
pub use event::TransportEvent as Event;
pub use factory::{
    create_incoming_factory, IncomingConnectionFactory, OutgoingConnectionFactory,
};
pub use instrumentation::{CommunicatorObserver, Observer};
pub use router::RouterInfo;
pub use transport::{Acceptor, Transceiver};

// 便捷的类型别名
pub type Result<T> = std::result::Result<T, TransportError>;
