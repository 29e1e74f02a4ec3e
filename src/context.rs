use std::sync::Arc;
use tokio::sync::broadcast;

use crate::{
    config::TransportConfig,
    error::TransportError,
    event::TransportEvent,
    instrumentation::CommunicatorObserver,
};

/// 连接工厂、端点和连接共享的运行环境
///
/// 相当于通信器里与连接管理有关的那一部分：配置、可选的观测器和事件广播。
pub struct TransportContext {
    config: TransportConfig,
    observer: Option<Arc<dyn CommunicatorObserver>>,
    event_sender: broadcast::Sender<TransportEvent>,
}

impl TransportContext {
    /// 创建新的 TransportContext，配置不合法时返回错误
    pub fn new(config: TransportConfig) -> Result<Arc<Self>, TransportError> {
        Self::with_observer(config, None)
    }

    /// 创建带观测器的 TransportContext
    pub fn with_observer(
        config: TransportConfig,
        observer: Option<Arc<dyn CommunicatorObserver>>,
    ) -> Result<Arc<Self>, TransportError> {
        config.validate()?;
        let (event_sender, _) = broadcast::channel(config.event_buffer);
        Ok(Arc::new(Self {
            config,
            observer,
            event_sender,
        }))
    }

    /// 获取配置
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// 获取观测器
    pub fn observer(&self) -> Option<&Arc<dyn CommunicatorObserver>> {
        self.observer.as_ref()
    }

    /// 订阅事件
    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.event_sender.subscribe()
    }

    /// 广播事件，没有订阅者时忽略
    pub(crate) fn emit(&self, event: TransportEvent) {
        let _ = self.event_sender.send(event);
    }
}

impl std::fmt::Debug for TransportContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportContext")
            .field("config", &self.config)
            .field("has_observer", &self.observer.is_some())
            .finish()
    }
}
