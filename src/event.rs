use crate::{SessionId, CloseReason};
use crate::connection::ConnectionInfo;
use crate::error::TransportError;

/// 连接管理层事件的统一抽象
///
/// 通过 [`TransportContext`](crate::context::TransportContext) 的广播通道发出，
/// 没有订阅者时直接丢弃。
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// 连接完成启动（握手成功）
    ConnectionEstablished { info: ConnectionInfo },
    /// 连接已关闭并已从所属管理器移除
    ConnectionClosed { session_id: SessionId, reason: CloseReason },

    /// 监听器事件
    ListenerStarted { endpoint: String },
    ListenerStopped { endpoint: String },
    AcceptFailed { endpoint: String, error: TransportError },
}
