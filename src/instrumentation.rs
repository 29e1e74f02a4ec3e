/// 观测接口
///
/// 连接管理核心只负责在解析、建连前后调用这些钩子，是否以及如何统计由实现方决定。

use std::sync::Arc;

use crate::connection::ConnectionState;
use crate::endpoint::Endpoint;

/// 单次观测
pub trait Observer: Send + Sync {
    /// 观测开始
    fn attach(&self);

    /// 观测结束，成功和失败都会调用
    fn detach(&self);

    /// 记录失败，`reason` 为错误代码
    fn failed(&self, reason: &str);
}

/// 观测器工厂，挂在 [`TransportContext`](crate::context::TransportContext) 上
pub trait CommunicatorObserver: Send + Sync {
    /// 端点解析（主机名 -> 连接器）
    fn endpoint_lookup_observer(&self, endpoint: &dyn Endpoint) -> Option<Arc<dyn Observer>>;

    /// 对单个连接器的建连尝试
    fn connection_establishment_observer(
        &self,
        endpoint: &dyn Endpoint,
        connector: &str,
    ) -> Option<Arc<dyn Observer>>;

    /// 连接自身，状态变化或者调用 `update_connection_observers` 时会重新获取
    fn connection_observer(
        &self,
        endpoint: &dyn Endpoint,
        state: ConnectionState,
        previous: Option<Arc<dyn Observer>>,
    ) -> Option<Arc<dyn Observer>>;
}

/// 在一段异步操作前后调用 attach / detach
pub(crate) struct ObserverScope {
    observer: Option<Arc<dyn Observer>>,
}

impl ObserverScope {
    pub(crate) fn new(observer: Option<Arc<dyn Observer>>) -> Self {
        if let Some(observer) = &observer {
            observer.attach();
        }
        Self { observer }
    }

    pub(crate) fn failed(&self, reason: &str) {
        if let Some(observer) = &self.observer {
            observer.failed(reason);
        }
    }
}

impl Drop for ObserverScope {
    fn drop(&mut self) {
        if let Some(observer) = &self.observer {
            observer.detach();
        }
    }
}
