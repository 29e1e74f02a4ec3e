use std::time::Duration;
use crate::SessionId;

/// 连接关闭原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// 正常关闭
    Normal,
    /// 所属组件已销毁（通信器 / 连接工厂）
    Disposed(String),
    /// 对象适配器已停用
    AdapterDeactivated(String),
    /// 错误
    Error(String),
    /// 被强制关闭
    Forced,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::Normal => write!(f, "normal close"),
            CloseReason::Disposed(component) => write!(f, "{} disposed", component),
            CloseReason::AdapterDeactivated(name) => write!(f, "object adapter `{}' deactivated", name),
            CloseReason::Error(reason) => write!(f, "error: {}", reason),
            CloseReason::Forced => write!(f, "forced close"),
        }
    }
}

impl From<&TransportError> for CloseReason {
    fn from(error: &TransportError) -> Self {
        match error {
            TransportError::Disposed { component } => CloseReason::Disposed(component.clone()),
            other => CloseReason::Error(other.to_string()),
        }
    }
}

/// 统一传输错误类型
///
/// 需要 `Clone`：同一个进行中的建连任务会被多个等待者共享，失败结果要原样交给每一个等待者。
#[derive(Debug, thiserror::Error, Clone)]
pub enum TransportError {
    /// 所属组件已经开始或完成销毁
    #[error("{component} disposed")]
    Disposed {
        component: String,
    },

    /// 端点地址解析失败
    #[error("Cannot resolve '{host}': {reason}")]
    Resolution {
        host: String,
        reason: String,
    },

    /// 连接相关错误
    #[error("Connection error: {reason} (retryable: {retryable})")]
    Connection {
        reason: String,
        retryable: bool,
    },

    /// 协议相关错误
    #[error("Protocol error ({protocol}): {reason}")]
    Protocol {
        protocol: String,
        reason: String,
    },

    /// 配置相关错误
    #[error("Configuration error in field '{field}': {reason}")]
    Configuration {
        field: String,
        reason: String,
    },

    /// 超时错误
    #[error("Operation '{operation}' timeout after {duration:?}")]
    Timeout {
        operation: String,
        duration: Duration,
    },
}

impl TransportError {
    /// 判断错误是否可重试
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Disposed { .. } => false,
            TransportError::Resolution { .. } => true,
            TransportError::Connection { retryable, .. } => *retryable,
            TransportError::Protocol { .. } => false,
            TransportError::Configuration { .. } => false,
            TransportError::Timeout { .. } => true,
        }
    }

    /// 是否为销毁错误（不再尝试其他候选地址）
    pub fn is_disposed(&self) -> bool {
        matches!(self, TransportError::Disposed { .. })
    }

    /// 获取错误代码
    pub fn error_code(&self) -> &'static str {
        match self {
            TransportError::Disposed { .. } => "DISPOSED_ERROR",
            TransportError::Resolution { .. } => "RESOLUTION_ERROR",
            TransportError::Connection { .. } => "CONNECTION_ERROR",
            TransportError::Protocol { .. } => "PROTOCOL_ERROR",
            TransportError::Configuration { .. } => "CONFIG_ERROR",
            TransportError::Timeout { .. } => "TIMEOUT_ERROR",
        }
    }

    /// 添加会话上下文
    pub fn with_session(mut self, session_id: SessionId) -> Self {
        match &mut self {
            TransportError::Connection { reason, .. } | TransportError::Protocol { reason, .. } => {
                if !reason.contains("session:") {
                    *reason = format!("{} (session: {})", reason, session_id);
                }
            }
            _ => {}
        }
        self
    }
}

/// 便利构造函数
impl TransportError {
    /// 创建销毁错误
    pub fn disposed(component: impl Into<String>) -> Self {
        Self::Disposed {
            component: component.into(),
        }
    }

    /// 创建地址解析错误
    pub fn resolution_error(host: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Resolution {
            host: host.into(),
            reason: reason.into(),
        }
    }

    /// 创建连接错误
    pub fn connection_error(reason: impl Into<String>, retryable: bool) -> Self {
        Self::Connection {
            reason: reason.into(),
            retryable,
        }
    }

    /// 创建协议错误
    pub fn protocol_error(protocol: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Protocol {
            protocol: protocol.into(),
            reason: reason.into(),
        }
    }

    /// 创建配置错误
    pub fn config_error(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Configuration {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// 创建超时错误
    pub fn timeout_error(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }
}

/// 兼容性转换 - 从标准IO错误
impl From<std::io::Error> for TransportError {
    fn from(error: std::io::Error) -> Self {
        let retryable = matches!(
            error.kind(),
            std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::Interrupted
        );

        TransportError::Connection {
            reason: format!("IO error: {}", error),
            retryable,
        }
    }
}

impl From<crate::config::ConfigError> for TransportError {
    fn from(error: crate::config::ConfigError) -> Self {
        TransportError::Configuration {
            field: error.field().to_string(),
            reason: error.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_retryability() {
        let refused: TransportError = std::io::Error::from(std::io::ErrorKind::ConnectionRefused).into();
        assert!(refused.is_retryable());
        assert_eq!(refused.error_code(), "CONNECTION_ERROR");

        let denied: TransportError = std::io::Error::from(std::io::ErrorKind::PermissionDenied).into();
        assert!(!denied.is_retryable());
    }

    #[test]
    fn test_disposed_is_fatal() {
        let error = TransportError::disposed("communicator");
        assert!(error.is_disposed());
        assert!(!error.is_retryable());
        assert_eq!(error.to_string(), "communicator disposed");
        assert_eq!(CloseReason::from(&error), CloseReason::Disposed("communicator".to_string()));
    }

    #[test]
    fn test_context_is_added_once() {
        let error = TransportError::connection_error("refused", true)
            .with_session(SessionId::new(7))
            .with_session(SessionId::new(8));
        let text = error.to_string();
        assert!(text.contains("session: session-7"));
        assert!(!text.contains("session-8"));
    }
}
