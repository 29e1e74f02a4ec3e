/// 客户端连接工厂
///
/// 按 (连接器, 连接ID) 和 (端点, 连接ID) 两张表缓存连接；对同一连接器的并发请求共享
/// 同一个进行中的建连任务；候选连接器依次尝试，除了工厂已销毁，任何失败都会继续尝试下一个。

use futures::future::{join_all, BoxFuture, Shared};
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use crate::{
    adapter::ObjectAdapter,
    config::AcmConfig,
    connection::{Connection, ConnectionManager, ManagerHandle},
    context::TransportContext,
    endpoint::{Connector, Endpoint, EndpointSelection},
    error::{CloseReason, TransportError},
    factory::multimap::MultiMap,
    instrumentation::ObserverScope,
    router::RouterInfo,
};

type ConnectorKey = (Arc<dyn Connector>, String);
type EndpointKey = (Arc<dyn Endpoint>, String);
type ConnectResult = Result<Arc<Connection>, TransportError>;
type PendingConnect = Shared<BoxFuture<'static, ConnectResult>>;

/// 一次建连的候选：连接器以及展开出它的端点
type Candidate = (Arc<dyn Connector>, Arc<dyn Endpoint>);

/// 缓存统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// 缓存的连接数
    pub connections: usize,
    /// (连接器, 连接ID) 键的数量
    pub connector_keys: usize,
    /// (端点, 连接ID) 键的数量
    pub endpoint_keys: usize,
    /// 进行中的建连任务登记数
    pub pending: usize,
}

struct OutgoingState {
    by_connector: MultiMap<ConnectorKey, Arc<Connection>>,
    by_endpoint: MultiMap<EndpointKey, Arc<Connection>>,
    pending: HashMap<ConnectorKey, PendingConnect>,
    dispose: Option<Shared<BoxFuture<'static, ()>>>,
}

impl OutgoingState {
    fn is_disposed(&self) -> bool {
        self.dispose.is_some()
    }

    fn find_by_endpoint(&self, endpoint: &Arc<dyn Endpoint>, connection_id: &str) -> Option<Arc<Connection>> {
        self.by_endpoint
            .get(&(endpoint.clone(), connection_id.to_string()))
            .and_then(|bucket| bucket.iter().find(|connection| connection.is_active()).cloned())
    }

    fn find_by_connector(&self, key: &ConnectorKey) -> Option<Arc<Connection>> {
        self.by_connector
            .get(key)
            .and_then(|bucket| bucket.iter().find(|connection| connection.is_active()).cloned())
    }

    fn contains(&self, key: &ConnectorKey, connection: &Arc<Connection>) -> bool {
        self.by_connector
            .get(key)
            .is_some_and(|bucket| bucket.iter().any(|c| Arc::ptr_eq(c, connection)))
    }
}

/// 客户端连接工厂
pub struct OutgoingConnectionFactory {
    context: Arc<TransportContext>,
    acm: AcmConfig,
    weak_self: Weak<Self>,
    state: Mutex<OutgoingState>,
}

impl OutgoingConnectionFactory {
    pub fn new(context: Arc<TransportContext>) -> Arc<Self> {
        let acm = context.config().client_acm;
        Arc::new_cyclic(|weak_self| Self {
            context,
            acm,
            weak_self: weak_self.clone(),
            state: Mutex::new(OutgoingState {
                by_connector: MultiMap::new(),
                by_endpoint: MultiMap::new(),
                pending: HashMap::new(),
                dispose: None,
            }),
        })
    }

    fn handle(&self) -> ManagerHandle {
        let manager: Weak<dyn ConnectionManager> = self.weak_self.clone();
        ManagerHandle::new(self.context.clone(), manager, self.acm())
    }

    /// 获取到 `endpoints` 之一的连接，优先复用缓存，必要时新建
    ///
    /// `has_more` 表示调用方还有其他端点可以尝试，影响失败时的日志级别。
    pub async fn connection(
        &self,
        endpoints: &[Arc<dyn Endpoint>],
        has_more: bool,
        selection: EndpointSelection,
        connection_id: &str,
    ) -> Result<Arc<Connection>, TransportError> {
        if endpoints.is_empty() {
            return Err(TransportError::config_error("endpoints", "no endpoint to connect to"));
        }

        {
            let state = self.state.lock();
            if state.is_disposed() {
                return Err(TransportError::disposed("communicator"));
            }
            for endpoint in endpoints {
                if let Some(connection) = state.find_by_endpoint(endpoint, connection_id) {
                    tracing::debug!("♻️ 复用连接 {} (端点: {})", connection.session_id(), endpoint);
                    return Ok(connection);
                }
            }
        }

        let mut candidates = self.resolve(endpoints, has_more, selection).await?;
        let mut last_error = None;

        loop {
            let mut waiting: Vec<PendingConnect> = Vec::new();
            let mut tried: HashSet<Arc<dyn Connector>> = HashSet::new();
            {
                let mut state = self.state.lock();
                if state.is_disposed() {
                    return Err(TransportError::disposed("communicator"));
                }

                for (connector, _) in &candidates {
                    let key = (connector.clone(), connection_id.to_string());
                    if let Some(connection) = state.find_by_connector(&key) {
                        tracing::debug!("♻️ 复用连接 {} (连接器: {})", connection.session_id(), connector);
                        drop(state);
                        self.attach_endpoint(&connection, &candidates, connection_id);
                        return Ok(connection);
                    }
                    if let Some(task) = state.pending.get(&key) {
                        if !waiting.iter().any(|w| w.ptr_eq(task)) {
                            waiting.push(task.clone());
                        }
                        tried.insert(connector.clone());
                    }
                }

                if waiting.is_empty() {
                    let task = self.spawn_connect(candidates.clone(), connection_id.to_string(), has_more);
                    for (connector, _) in &candidates {
                        state
                            .pending
                            .entry((connector.clone(), connection_id.to_string()))
                            .or_insert_with(|| task.clone());
                        tried.insert(connector.clone());
                    }
                    waiting.push(task);
                }
            }

            let mut waiting: FuturesUnordered<PendingConnect> = waiting.into_iter().collect();
            while let Some(result) = waiting.next().await {
                match result {
                    Ok(connection) => {
                        self.attach_endpoint(&connection, &candidates, connection_id);
                        return Ok(connection);
                    }
                    Err(error) if error.is_disposed() => return Err(error),
                    Err(error) => last_error = Some(error),
                }
            }

            // 只剩下没人尝试过的连接器时再来一轮
            candidates.retain(|(connector, _)| !tried.contains(connector));
            if candidates.is_empty() {
                return Err(last_error.unwrap_or_else(|| {
                    TransportError::connection_error("all connection attempts failed", true)
                }));
            }
        }
    }

    /// 把所有端点展开为候选连接器，保持端点顺序
    async fn resolve(
        &self,
        endpoints: &[Arc<dyn Endpoint>],
        has_more: bool,
        selection: EndpointSelection,
    ) -> Result<Vec<Candidate>, TransportError> {
        let mut candidates: Vec<Candidate> = Vec::new();
        let mut last_error = None;

        for (index, endpoint) in endpoints.iter().enumerate() {
            match endpoint.connectors(selection).await {
                Ok(connectors) => {
                    candidates.extend(connectors.into_iter().map(|connector| (connector, endpoint.clone())));
                }
                Err(error) if error.is_disposed() => return Err(error),
                Err(error) => {
                    let last = index + 1 == endpoints.len();
                    if self.context.config().warn_connections && last && !has_more && candidates.is_empty() {
                        tracing::warn!("⚠️ 无法解析端点 {}: {}", endpoint, error);
                    } else {
                        tracing::debug!("🔍 无法解析端点 {}: {}", endpoint, error);
                    }
                    last_error = Some(error);
                }
            }
        }

        if candidates.is_empty() {
            return Err(last_error.unwrap_or_else(|| {
                TransportError::resolution_error(endpoints[0].host(), "endpoint resolved to no address")
            }));
        }
        Ok(candidates)
    }

    /// 在独立任务中依次尝试候选连接器
    ///
    /// 独立任务保证等待者全部放弃时仍会完成并清理 `pending` 登记。
    fn spawn_connect(&self, candidates: Vec<Candidate>, connection_id: String, has_more: bool) -> PendingConnect {
        let Some(factory) = self.weak_self.upgrade() else {
            return futures::future::ready(Err(TransportError::disposed("communicator")))
                .boxed()
                .shared();
        };

        let handle = tokio::spawn(async move {
            let result = factory.try_candidates(&candidates, &connection_id, has_more).await;
            {
                let mut state = factory.state.lock();
                for (connector, _) in &candidates {
                    state.pending.remove(&(connector.clone(), connection_id.clone()));
                }
            }
            result
        });

        async move {
            handle.await.unwrap_or_else(|error| {
                Err(TransportError::connection_error(format!("connect task failed: {}", error), false))
            })
        }
        .boxed()
        .shared()
    }

    async fn try_candidates(&self, candidates: &[Candidate], connection_id: &str, has_more: bool) -> ConnectResult {
        let mut last_error = None;

        for (index, (connector, endpoint)) in candidates.iter().enumerate() {
            let observer = ObserverScope::new(self.context.observer().and_then(|observer| {
                observer.connection_establishment_observer(endpoint.as_ref(), &connector.to_string())
            }));

            tracing::debug!("🔌 尝试建立 {} 连接到 {}", endpoint.transport_name(), connector);
            match self.establish(connector, endpoint, connection_id).await {
                Ok(connection) => return Ok(connection),
                Err(error) => {
                    observer.failed(error.error_code());
                    if error.is_disposed() {
                        return Err(error);
                    }

                    let last = index + 1 == candidates.len();
                    if self.context.config().warn_connections && last && !has_more {
                        tracing::warn!("⚠️ 建立 {} 连接失败 {}: {}", endpoint.transport_name(), connector, error);
                    } else {
                        tracing::debug!("🔌 建立 {} 连接失败 {}: {}", endpoint.transport_name(), connector, error);
                    }

                    last_error = Some(error);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| TransportError::connection_error("no connector to try", true)))
    }

    async fn establish(
        &self,
        connector: &Arc<dyn Connector>,
        endpoint: &Arc<dyn Endpoint>,
        connection_id: &str,
    ) -> ConnectResult {
        let connection = {
            let mut state = self.state.lock();
            if state.is_disposed() {
                return Err(TransportError::disposed("communicator"));
            }

            let transceiver = connector.connect()?;
            let connection = Connection::create(
                self.handle(),
                endpoint.clone(),
                transceiver,
                Some(connector.clone()),
                connection_id,
                None,
            )?;
            state
                .by_connector
                .insert((connector.clone(), connection_id.to_string()), connection.clone());
            state
                .by_endpoint
                .insert((endpoint.clone(), connection_id.to_string()), connection.clone());
            connection
        };

        connection.start().await?;
        Ok(connection)
    }

    /// 把请求中指向同一连接器的端点登记到连接上
    ///
    /// 连接已经从表中移除（关闭了）时不再登记。
    fn attach_endpoint(&self, connection: &Arc<Connection>, candidates: &[Candidate], connection_id: &str) {
        let Some(connection_connector) = connection.connector() else {
            return;
        };
        let mut state = self.state.lock();
        let key = (connection_connector.clone(), connection_id.to_string());
        if !state.contains(&key, connection) {
            return;
        }

        for (connector, endpoint) in candidates {
            if connector.as_ref() == connection_connector.as_ref() && !connection.has_endpoint(endpoint.as_ref()) {
                debug_assert_eq!(connection.connection_id(), connection_id);
                connection.add_endpoint(endpoint.clone());
                state
                    .by_endpoint
                    .insert((endpoint.clone(), connection_id.to_string()), connection.clone());
                break;
            }
        }
    }

    /// 解除所有连接与 `adapter` 的关联；工厂已销毁时什么也不做
    pub fn remove_adapter(&self, adapter: &Arc<ObjectAdapter>) {
        let state = self.state.lock();
        if state.is_disposed() {
            return;
        }
        for connection in state.by_connector.values() {
            connection.clear_adapter(adapter);
        }
    }

    /// 把经由路由器的连接关联到路由器的对象适配器，解析失败直接忽略
    pub async fn set_router_info(&self, router: &dyn RouterInfo) {
        let adapter = router.adapter();
        let endpoints = match router.client_endpoints().await {
            Ok(endpoints) => endpoints,
            Err(error) => {
                tracing::debug!("🔍 获取路由器端点失败: {}", error);
                return;
            }
        };

        for endpoint in endpoints {
            let connectors = match endpoint.connectors(EndpointSelection::Ordered).await {
                Ok(connectors) => connectors,
                Err(error) => {
                    tracing::debug!("🔍 无法解析路由器端点 {}: {}", endpoint, error);
                    continue;
                }
            };

            let state = self.state.lock();
            if state.is_disposed() {
                return;
            }
            for connector in connectors {
                let key = (connector, router.connection_id().to_string());
                if let Some(bucket) = state.by_connector.get(&key) {
                    for connection in bucket {
                        connection.set_adapter(adapter.clone());
                    }
                }
            }
        }
    }

    /// 让所有缓存的连接重新获取观测器
    pub fn update_connection_observers(&self) {
        let state = self.state.lock();
        for connection in state.by_connector.values() {
            connection.update_observer();
        }
    }

    /// 销毁工厂：拒绝新请求，优雅关闭所有缓存的连接
    ///
    /// 可以重复调用，所有调用等待同一个关闭过程。
    pub async fn dispose(&self) {
        let task = {
            let mut state = self.state.lock();
            match &state.dispose {
                Some(task) => task.clone(),
                None => {
                    let connections: Vec<Arc<Connection>> = state.by_connector.values().cloned().collect();
                    tracing::info!("🛑 销毁连接工厂，关闭 {} 个连接", connections.len());
                    let task = async move {
                        join_all(
                            connections
                                .iter()
                                .map(|connection| connection.graceful_close(CloseReason::Disposed("communicator".to_string()))),
                        )
                        .await;
                    }
                    .boxed()
                    .shared();
                    state.dispose = Some(task.clone());
                    task
                }
            }
        };

        task.await;

        let state = self.state.lock();
        debug_assert!(state.by_connector.is_empty());
        debug_assert!(state.by_endpoint.is_empty());
    }

    pub fn is_disposed(&self) -> bool {
        self.state.lock().is_disposed()
    }

    pub fn cache_stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            connections: state.by_connector.values().count(),
            connector_keys: state.by_connector.key_count(),
            endpoint_keys: state.by_endpoint.key_count(),
            pending: state.pending.len(),
        }
    }
}

impl ConnectionManager for OutgoingConnectionFactory {
    fn acm(&self) -> AcmConfig {
        self.acm
    }

    fn remove(&self, connection: &Connection) {
        let Some(connector) = connection.connector() else {
            return;
        };
        let session_id = connection.session_id();
        let connection_id = connection.connection_id().to_string();

        let mut state = self.state.lock();
        state
            .by_connector
            .remove_first(&(connector.clone(), connection_id.clone()), |c| c.session_id() == session_id);
        for endpoint in connection.endpoints() {
            state
                .by_endpoint
                .remove_first(&(endpoint, connection_id.clone()), |c| c.session_id() == session_id);
        }
    }
}

impl std::fmt::Debug for OutgoingConnectionFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutgoingConnectionFactory")
            .field("stats", &self.cache_stats())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
