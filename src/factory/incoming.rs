use async_trait::async_trait;
use std::sync::Arc;

use crate::{
    adapter::ObjectAdapter,
    context::TransportContext,
    endpoint::Endpoint,
    error::TransportError,
    factory::{DatagramIncomingConnectionFactory, StreamIncomingConnectionFactory},
};

/// 服务端连接工厂的公共接口
#[async_trait]
pub trait IncomingConnectionFactory: Send + Sync {
    /// 实际绑定后的端点
    fn endpoint(&self) -> Arc<dyn Endpoint>;

    /// 对外发布的端点，没有配置时与 [`IncomingConnectionFactory::endpoint`] 相同
    fn published_endpoint(&self) -> Arc<dyn Endpoint>;

    /// `endpoint` 是否指向本工厂；只有配置了发布端点时才可能为 true
    fn is_local(&self, endpoint: &dyn Endpoint) -> bool;

    /// 开始接受连接
    fn activate(&self);

    /// 让所有连接重新获取观测器
    fn update_connection_observers(&self);

    /// 停止接受连接并优雅关闭所有连接
    async fn dispose(&self);
}

pub(crate) fn is_local_to(
    endpoint: &dyn Endpoint,
    realized: &dyn Endpoint,
    published: Option<&Arc<dyn Endpoint>>,
) -> bool {
    match published {
        Some(published) => endpoint.is_local(published.as_ref()) || endpoint.is_local(realized),
        None => false,
    }
}

/// 按端点类型创建流式或数据报工厂
pub async fn create_incoming_factory(
    context: Arc<TransportContext>,
    adapter: Arc<ObjectAdapter>,
    endpoint: Arc<dyn Endpoint>,
    published: Option<Arc<dyn Endpoint>>,
) -> Result<Arc<dyn IncomingConnectionFactory>, TransportError> {
    if endpoint.is_datagram() {
        let factory = DatagramIncomingConnectionFactory::new(context, adapter, endpoint, published).await?;
        Ok(factory as Arc<dyn IncomingConnectionFactory>)
    } else {
        let factory = StreamIncomingConnectionFactory::new(context, adapter, endpoint, published).await?;
        Ok(factory as Arc<dyn IncomingConnectionFactory>)
    }
}
