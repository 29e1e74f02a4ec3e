/// 连接对象与连接管理器接口
///
/// 连接的生命周期：Initializing -> Active -> Closing -> Closed，任何状态都可以直接进入 Closed。
/// 状态只前进不后退。进入 Closed 的那一次转换负责释放收发器、通知所属管理器移除自己，
/// 所以管理器的 `remove` 对每个连接恰好调用一次。

use bytes::BytesMut;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::SystemTime;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::{
    adapter::ObjectAdapter,
    config::AcmConfig,
    context::TransportContext,
    endpoint::{Connector, Endpoint, Protocol},
    error::{CloseReason, TransportError},
    event::TransportEvent,
    instrumentation::Observer,
    transport::Transceiver,
    SessionId,
};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConnectionState {
    /// 正在建立（连接 / 握手）
    Initializing,
    /// 可用
    Active,
    /// 正在优雅关闭
    Closing,
    /// 已关闭
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Initializing => write!(f, "initializing"),
            ConnectionState::Active => write!(f, "active"),
            ConnectionState::Closing => write!(f, "closing"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// 连接信息快照
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// 会话ID
    pub session_id: SessionId,
    /// 传输名称
    pub transport: String,
    /// 协议版本
    pub protocol: Protocol,
    /// 连接ID，用于隔离同一目的地的多条连接
    pub connection_id: String,
    /// 是否为服务端接受的连接
    pub incoming: bool,
    /// 关联的对象适配器
    pub adapter_name: Option<String>,
    /// 本地地址
    pub local_addr: Option<std::net::SocketAddr>,
    /// 远程地址
    pub peer_addr: Option<std::net::SocketAddr>,
    /// 连接状态
    pub state: ConnectionState,
    /// 创建时间
    pub established_at: SystemTime,
}

/// 连接的所属管理器（连接工厂）
pub trait ConnectionManager: Send + Sync {
    /// 新连接使用的 ACM 配置
    fn acm(&self) -> AcmConfig;

    /// 连接已关闭，从管理器的表中移除；每个连接只会调用一次
    fn remove(&self, connection: &Connection);
}

/// 创建连接时由管理器提供的上下文
#[derive(Clone)]
pub struct ManagerHandle {
    context: Arc<TransportContext>,
    manager: Weak<dyn ConnectionManager>,
    acm: AcmConfig,
}

impl ManagerHandle {
    pub fn new(context: Arc<TransportContext>, manager: Weak<dyn ConnectionManager>, acm: AcmConfig) -> Self {
        Self { context, manager, acm }
    }
}

/// 单条连接
///
/// 连接由工厂创建，工厂的表和所有使用者共享同一个 `Arc<Connection>`。
pub struct Connection {
    session_id: SessionId,
    owner: ManagerHandle,
    transceiver: Box<dyn Transceiver>,
    connector: Option<Arc<dyn Connector>>,
    endpoint: Arc<dyn Endpoint>,
    endpoints: Mutex<Vec<Arc<dyn Endpoint>>>,
    connection_id: String,
    adapter: Mutex<Option<Arc<ObjectAdapter>>>,
    state: watch::Sender<ConnectionState>,
    observer: Mutex<Option<Arc<dyn Observer>>>,
    established_at: SystemTime,
}

impl Connection {
    /// 校验端点并创建连接，校验失败时收发器会被释放
    ///
    /// `connector` 为 None 表示服务端接受的连接。
    pub fn create(
        owner: ManagerHandle,
        endpoint: Arc<dyn Endpoint>,
        transceiver: Box<dyn Transceiver>,
        connector: Option<Arc<dyn Connector>>,
        connection_id: impl Into<String>,
        adapter: Option<Arc<ObjectAdapter>>,
    ) -> Result<Arc<Self>, TransportError> {
        if let Err(error) = Self::validate(endpoint.as_ref()) {
            transceiver.destroy();
            return Err(error);
        }
        Ok(Self::build(owner, endpoint, transceiver, connector, connection_id.into(), adapter))
    }

    /// 端点能否承载连接
    pub(crate) fn validate(endpoint: &dyn Endpoint) -> Result<(), TransportError> {
        if endpoint.is_datagram() && endpoint.protocol() != Protocol::Ice1 {
            return Err(TransportError::protocol_error(
                endpoint.transport_name(),
                format!("datagram connections require the ice1 protocol, not {}", endpoint.protocol()),
            ));
        }
        Ok(())
    }

    pub(crate) fn build(
        owner: ManagerHandle,
        endpoint: Arc<dyn Endpoint>,
        transceiver: Box<dyn Transceiver>,
        connector: Option<Arc<dyn Connector>>,
        connection_id: String,
        adapter: Option<Arc<ObjectAdapter>>,
    ) -> Arc<Self> {
        let session_id = SessionId::new(NEXT_SESSION_ID.fetch_add(1, Ordering::SeqCst));
        let (state, _) = watch::channel(ConnectionState::Initializing);
        let connection = Arc::new(Self {
            session_id,
            owner,
            transceiver,
            connector,
            endpoints: Mutex::new(vec![endpoint.clone()]),
            endpoint,
            connection_id,
            adapter: Mutex::new(adapter),
            state,
            observer: Mutex::new(None),
            established_at: SystemTime::now(),
        });
        connection.update_observer();
        connection
    }

    /// 会话ID
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_active(&self) -> bool {
        self.state() == ConnectionState::Active
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// 是否为服务端接受的连接
    pub fn is_incoming(&self) -> bool {
        self.connector.is_none()
    }

    /// 建立连接使用的连接器，服务端连接为 None
    pub fn connector(&self) -> Option<&Arc<dyn Connector>> {
        self.connector.as_ref()
    }

    /// 创建连接时使用的端点
    pub fn endpoint(&self) -> &Arc<dyn Endpoint> {
        &self.endpoint
    }

    /// 指向这条连接的所有端点
    pub fn endpoints(&self) -> Vec<Arc<dyn Endpoint>> {
        self.endpoints.lock().clone()
    }

    pub fn has_endpoint(&self, endpoint: &dyn Endpoint) -> bool {
        self.endpoints.lock().iter().any(|e| e.eq_endpoint(endpoint))
    }

    /// 由工厂在持有自身锁时调用
    pub(crate) fn add_endpoint(&self, endpoint: Arc<dyn Endpoint>) {
        self.endpoints.lock().push(endpoint);
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn acm(&self) -> &AcmConfig {
        &self.owner.acm
    }

    /// 关联的对象适配器
    pub fn adapter(&self) -> Option<Arc<ObjectAdapter>> {
        self.adapter.lock().clone()
    }

    pub fn set_adapter(&self, adapter: Option<Arc<ObjectAdapter>>) {
        *self.adapter.lock() = adapter;
    }

    /// 如果当前关联的正是 `adapter`，解除关联
    pub fn clear_adapter(&self, adapter: &Arc<ObjectAdapter>) -> bool {
        let mut current = self.adapter.lock();
        match current.as_ref() {
            Some(existing) if Arc::ptr_eq(existing, adapter) => {
                *current = None;
                true
            }
            _ => false,
        }
    }

    /// 连接信息快照
    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            session_id: self.session_id,
            transport: self.endpoint.transport_name().to_string(),
            protocol: self.endpoint.protocol(),
            connection_id: self.connection_id.clone(),
            incoming: self.is_incoming(),
            adapter_name: self.adapter().map(|adapter| adapter.name().to_string()),
            local_addr: self.transceiver.local_addr(),
            peer_addr: self.transceiver.peer_addr(),
            state: self.state(),
            established_at: self.established_at,
        }
    }

    /// 启动连接：完成收发器的连接和握手后进入 Active
    ///
    /// 失败时连接直接关闭（同时从管理器移除）并返回错误。启动期间连接被关闭也返回错误。
    pub async fn start(&self) -> Result<(), TransportError> {
        if let Err(error) = self.transceiver.initialize().await {
            self.finish(CloseReason::from(&error));
            return Err(error.with_session(self.session_id));
        }

        let activated = self.state.send_if_modified(|state| {
            if *state == ConnectionState::Initializing {
                *state = ConnectionState::Active;
                true
            } else {
                false
            }
        });
        if !activated {
            return Err(TransportError::connection_error(
                format!("connection closed during startup ({})", self.state()),
                false,
            )
            .with_session(self.session_id));
        }

        self.update_observer();
        if self.is_incoming() {
            tracing::debug!("✅ 接受 {} 连接\n{}", self.endpoint.transport_name(), self.transceiver);
        } else {
            tracing::info!("✅ 建立 {} 连接\n{}", self.endpoint.transport_name(), self.transceiver);
        }
        self.owner
            .context
            .emit(TransportEvent::ConnectionEstablished { info: self.info() });
        Ok(())
    }

    /// 优雅关闭，返回时连接已进入 Closed
    ///
    /// 已经在关闭的连接只等待关闭完成。
    pub async fn graceful_close(&self, reason: CloseReason) {
        let initiated = self.state.send_if_modified(|state| match state {
            ConnectionState::Initializing | ConnectionState::Active => {
                *state = ConnectionState::Closing;
                true
            }
            ConnectionState::Closing | ConnectionState::Closed => false,
        });

        if !initiated {
            self.closed().await;
            return;
        }

        tracing::debug!("🔗 优雅关闭连接 {} ({})", self.session_id, reason);
        self.update_observer();
        if let Err(error) = self.transceiver.close().await {
            tracing::debug!("🔗 关闭收发器失败 {}: {}", self.session_id, error);
        }
        self.finish(reason);
    }

    /// 立即关闭
    pub fn abort(&self, reason: CloseReason) {
        self.finish(reason);
    }

    /// 等待连接进入 Closed
    pub async fn closed(&self) {
        let mut receiver = self.state.subscribe();
        let _ = receiver.wait_for(|state| *state == ConnectionState::Closed).await;
    }

    /// 读取数据，I/O 错误会关闭连接
    pub async fn read(&self, buf: &mut BytesMut) -> Result<usize, TransportError> {
        self.ensure_usable()?;
        match self.transceiver.read(buf).await {
            Ok(0) if !self.endpoint.is_datagram() => {
                self.finish(CloseReason::Normal);
                Ok(0)
            }
            Ok(n) => Ok(n),
            Err(error) => {
                self.finish(CloseReason::from(&error));
                Err(error.with_session(self.session_id))
            }
        }
    }

    /// 写入数据，I/O 错误会关闭连接
    pub async fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        self.ensure_usable()?;
        if let Err(error) = self.transceiver.write(data).await {
            self.finish(CloseReason::from(&error));
            return Err(error.with_session(self.session_id));
        }
        Ok(())
    }

    /// 按当前状态重新获取连接观测器
    pub fn update_observer(&self) {
        let state = self.state();
        let mut guard = self.observer.lock();
        let previous = guard.take();
        let next = if state == ConnectionState::Closed {
            None
        } else {
            self.owner
                .context
                .observer()
                .and_then(|observer| observer.connection_observer(self.endpoint.as_ref(), state, previous.clone()))
        };

        match (&previous, &next) {
            (Some(previous), Some(next)) if Arc::ptr_eq(previous, next) => {}
            _ => {
                if let Some(previous) = &previous {
                    previous.detach();
                }
                if let Some(next) = &next {
                    next.attach();
                }
            }
        }
        *guard = next;
    }

    fn ensure_usable(&self) -> Result<(), TransportError> {
        match self.state() {
            ConnectionState::Active => Ok(()),
            state => Err(TransportError::connection_error(
                format!("connection is {}", state),
                false,
            )
            .with_session(self.session_id)),
        }
    }

    /// 进入 Closed；只有真正完成转换的那一次调用会通知管理器
    fn finish(&self, reason: CloseReason) {
        let closed = self.state.send_if_modified(|state| {
            if *state != ConnectionState::Closed {
                *state = ConnectionState::Closed;
                true
            } else {
                false
            }
        });
        if !closed {
            return;
        }

        self.transceiver.destroy();
        self.update_observer();

        match &reason {
            CloseReason::Error(_) if self.owner.context.config().warn_connections => {
                tracing::warn!("⚠️ 连接 {} 异常关闭: {}\n{}", self.session_id, reason, self.transceiver);
            }
            _ => {
                tracing::debug!("🔌 连接 {} 已关闭: {}", self.session_id, reason);
            }
        }

        if let Some(manager) = self.owner.manager.upgrade() {
            manager.remove(self);
        }
        self.owner.context.emit(TransportEvent::ConnectionClosed {
            session_id: self.session_id,
            reason,
        });
    }
}

impl std::fmt::Display for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.transceiver)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("session_id", &self.session_id)
            .field("endpoint", &self.endpoint.to_string())
            .field("connection_id", &self.connection_id)
            .field("state", &self.state())
            .finish()
    }
}
