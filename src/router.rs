use async_trait::async_trait;
use std::sync::Arc;

use crate::{adapter::ObjectAdapter, endpoint::Endpoint, error::TransportError};

/// 路由器信息
///
/// 路由器的定位和客户端端点查询由上层实现，这里只消费结果：通过路由器建立的连接要能接收
/// 路由器转发回来的回调请求，所以要把这些连接关联到路由器的对象适配器上。
#[async_trait]
pub trait RouterInfo: Send + Sync {
    /// 接收回调的对象适配器
    fn adapter(&self) -> Option<Arc<ObjectAdapter>>;

    /// 路由器代理使用的连接ID
    fn connection_id(&self) -> &str;

    /// 路由器面向客户端的端点
    async fn client_endpoints(&self) -> Result<Vec<Arc<dyn Endpoint>>, TransportError>;
}
