use async_trait::async_trait;
use std::sync::{Arc, Weak};

use crate::{
    adapter::ObjectAdapter,
    config::AcmConfig,
    connection::{Connection, ConnectionManager, ManagerHandle},
    context::TransportContext,
    endpoint::Endpoint,
    error::{CloseReason, TransportError},
    factory::incoming::{is_local_to, IncomingConnectionFactory},
};

/// 数据报传输（UDP）的服务端连接工厂
///
/// 数据报没有"接受"的概念，同一个套接字既是监听点也是通道，所以整个工厂只有一条连接，
/// 构造时就已经启动。
pub struct DatagramIncomingConnectionFactory {
    adapter: Arc<ObjectAdapter>,
    endpoint: Arc<dyn Endpoint>,
    published: Option<Arc<dyn Endpoint>>,
    connection: Arc<Connection>,
}

impl DatagramIncomingConnectionFactory {
    pub async fn new(
        context: Arc<TransportContext>,
        adapter: Arc<ObjectAdapter>,
        endpoint: Arc<dyn Endpoint>,
        published: Option<Arc<dyn Endpoint>>,
    ) -> Result<Arc<Self>, TransportError> {
        let (transceiver, endpoint) = endpoint.bind_datagram().await?;
        if let Err(error) = Connection::validate(endpoint.as_ref()) {
            transceiver.destroy();
            return Err(error);
        }
        tracing::info!("👂 监听 {} 数据报\n{}", endpoint.transport_name(), transceiver);

        let factory = Arc::new_cyclic(|weak_self: &Weak<Self>| {
            let manager: Weak<dyn ConnectionManager> = weak_self.clone();
            let handle = ManagerHandle::new(context, manager, AcmConfig::disabled());
            let connection = Connection::build(
                handle,
                endpoint.clone(),
                transceiver,
                None,
                String::new(),
                Some(adapter.clone()),
            );
            Self {
                adapter,
                endpoint,
                published,
                connection,
            }
        });

        let connection = factory.connection.clone();
        tokio::spawn(async move {
            if let Err(error) = connection.start().await {
                tracing::debug!("🔌 数据报连接启动失败 {}: {}", connection.session_id(), error);
            }
        });
        Ok(factory)
    }

    /// 唯一的连接
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }
}

#[async_trait]
impl IncomingConnectionFactory for DatagramIncomingConnectionFactory {
    fn endpoint(&self) -> Arc<dyn Endpoint> {
        self.endpoint.clone()
    }

    fn published_endpoint(&self) -> Arc<dyn Endpoint> {
        self.published.clone().unwrap_or_else(|| self.endpoint.clone())
    }

    fn is_local(&self, endpoint: &dyn Endpoint) -> bool {
        is_local_to(endpoint, self.endpoint.as_ref(), self.published.as_ref())
    }

    fn activate(&self) {}

    fn update_connection_observers(&self) {
        self.connection.update_observer();
    }

    async fn dispose(&self) {
        tracing::info!("🛑 停止接收 {} 数据报: {}", self.endpoint.transport_name(), self.endpoint);
        self.connection
            .graceful_close(CloseReason::AdapterDeactivated(self.adapter.name().to_string()))
            .await;
    }
}

impl ConnectionManager for DatagramIncomingConnectionFactory {
    fn acm(&self) -> AcmConfig {
        AcmConfig::disabled()
    }

    fn remove(&self, _connection: &Connection) {}
}

impl std::fmt::Display for DatagramIncomingConnectionFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.endpoint)
    }
}
