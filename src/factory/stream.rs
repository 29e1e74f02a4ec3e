/// 流式传输（TCP）的服务端连接工厂
///
/// 状态：Created -> Activated -> Accepting -> Disposed，只前进不后退。
/// 接受循环在独立任务中运行，只持有工厂的弱引用。

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

use crate::{
    adapter::ObjectAdapter,
    config::AcmConfig,
    connection::{Connection, ConnectionManager, ManagerHandle},
    context::TransportContext,
    endpoint::Endpoint,
    error::{CloseReason, TransportError},
    event::TransportEvent,
    factory::incoming::{is_local_to, IncomingConnectionFactory},
    transport::{Acceptor, Transceiver},
    SessionId,
};

struct StreamState {
    connections: HashMap<SessionId, Arc<Connection>>,
    activated: bool,
    disposed: bool,
}

/// 流式传输的服务端连接工厂
pub struct StreamIncomingConnectionFactory {
    context: Arc<TransportContext>,
    adapter: Arc<ObjectAdapter>,
    acm: AcmConfig,
    endpoint: Arc<dyn Endpoint>,
    published: Option<Arc<dyn Endpoint>>,
    acceptor: Arc<dyn Acceptor>,
    weak_self: Weak<Self>,
    state: Mutex<StreamState>,
}

impl StreamIncomingConnectionFactory {
    /// 绑定监听器，实际绑定的端点（例如系统分配的端口）替换传入的端点
    pub async fn new(
        context: Arc<TransportContext>,
        adapter: Arc<ObjectAdapter>,
        endpoint: Arc<dyn Endpoint>,
        published: Option<Arc<dyn Endpoint>>,
    ) -> Result<Arc<Self>, TransportError> {
        let acceptor: Arc<dyn Acceptor> = Arc::from(endpoint.acceptor().await?);
        let endpoint = acceptor.endpoint();
        let acm = context.config().server_acm;

        tracing::info!("👂 监听 {} 连接\n{}", endpoint.transport_name(), acceptor);
        context.emit(TransportEvent::ListenerStarted {
            endpoint: endpoint.to_string(),
        });

        Ok(Arc::new_cyclic(|weak_self| Self {
            context,
            adapter,
            acm,
            endpoint,
            published,
            acceptor,
            weak_self: weak_self.clone(),
            state: Mutex::new(StreamState {
                connections: HashMap::new(),
                activated: false,
                disposed: false,
            }),
        }))
    }

    fn handle(&self) -> ManagerHandle {
        let manager: Weak<dyn ConnectionManager> = self.weak_self.clone();
        ManagerHandle::new(self.context.clone(), manager, self.acm())
    }

    /// 当前跟踪的连接数
    pub fn connection_count(&self) -> usize {
        self.state.lock().connections.len()
    }

    /// 当前跟踪的连接
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.state.lock().connections.values().cloned().collect()
    }

    pub fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }

    async fn accept_loop(weak: Weak<Self>, acceptor: Arc<dyn Acceptor>) {
        loop {
            let result = acceptor.accept().await;
            let Some(factory) = weak.upgrade() else {
                if let Ok(transceiver) = result {
                    transceiver.destroy();
                }
                return;
            };

            match result {
                Err(error) => {
                    if factory.is_disposed() {
                        return;
                    }
                    tracing::error!("❌ 接受连接失败: {}\n{}", error, acceptor);
                    factory.context.emit(TransportEvent::AcceptFailed {
                        endpoint: factory.endpoint.to_string(),
                        error,
                    });
                    let delay = factory.context.config().accept_retry_delay;
                    drop(factory);
                    tokio::time::sleep(delay).await;
                }
                Ok(transceiver) => {
                    if !factory.handle_accepted(transceiver) {
                        return;
                    }
                }
            }
        }
    }

    /// 包装新接受的收发器，返回 false 表示工厂已销毁，接受循环应退出
    fn handle_accepted(&self, transceiver: Box<dyn Transceiver>) -> bool {
        let connection = {
            let mut state = self.state.lock();
            if state.disposed {
                transceiver.destroy();
                return false;
            }

            tracing::debug!("🔗 尝试接受 {} 连接\n{}", self.endpoint.transport_name(), transceiver);
            match Connection::create(
                self.handle(),
                self.endpoint.clone(),
                transceiver,
                None,
                String::new(),
                Some(self.adapter.clone()),
            ) {
                Ok(connection) => {
                    state.connections.insert(connection.session_id(), connection.clone());
                    connection
                }
                Err(error) => {
                    if self.context.config().warn_connections {
                        tracing::warn!("⚠️ 无法创建 {} 连接: {}", self.endpoint.transport_name(), error);
                    }
                    return true;
                }
            }
        };

        tokio::spawn(async move {
            if let Err(error) = connection.start().await {
                tracing::debug!("🔌 连接启动失败 {}: {}", connection.session_id(), error);
            }
        });
        true
    }
}

#[async_trait]
impl IncomingConnectionFactory for StreamIncomingConnectionFactory {
    fn endpoint(&self) -> Arc<dyn Endpoint> {
        self.endpoint.clone()
    }

    fn published_endpoint(&self) -> Arc<dyn Endpoint> {
        self.published.clone().unwrap_or_else(|| self.endpoint.clone())
    }

    fn is_local(&self, endpoint: &dyn Endpoint) -> bool {
        is_local_to(endpoint, self.endpoint.as_ref(), self.published.as_ref())
    }

    fn activate(&self) {
        {
            let mut state = self.state.lock();
            if state.disposed || state.activated {
                return;
            }
            state.activated = true;
        }

        tracing::info!("🚀 开始接受 {} 连接: {}", self.endpoint.transport_name(), self.acceptor);
        tokio::spawn(Self::accept_loop(self.weak_self.clone(), self.acceptor.clone()));
    }

    fn update_connection_observers(&self) {
        let state = self.state.lock();
        for connection in state.connections.values() {
            connection.update_observer();
        }
    }

    async fn dispose(&self) {
        let connections: Vec<Arc<Connection>> = {
            let mut state = self.state.lock();
            if !state.disposed {
                tracing::info!("🛑 停止接受 {} 连接: {}", self.endpoint.transport_name(), self.acceptor);
                state.disposed = true;
                self.acceptor.close();
                self.context.emit(TransportEvent::ListenerStopped {
                    endpoint: self.endpoint.to_string(),
                });
            }
            state.connections.values().cloned().collect()
        };

        let reason = CloseReason::AdapterDeactivated(self.adapter.name().to_string());
        join_all(
            connections
                .iter()
                .map(|connection| connection.graceful_close(reason.clone())),
        )
        .await;
    }
}

impl ConnectionManager for StreamIncomingConnectionFactory {
    fn acm(&self) -> AcmConfig {
        self.acm
    }

    fn remove(&self, connection: &Connection) {
        let mut state = self.state.lock();
        if !state.disposed {
            state.connections.remove(&connection.session_id());
        }
    }
}

impl Drop for StreamIncomingConnectionFactory {
    fn drop(&mut self) {
        // 接受循环只持有弱引用，未销毁就被释放时由这里关闭监听器
        self.acceptor.close();
    }
}

impl std::fmt::Display for StreamIncomingConnectionFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.endpoint)
    }
}
