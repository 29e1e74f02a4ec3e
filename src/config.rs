/// 统一配置系统
///
/// 连接管理核心只消费已经加载好的配置值；属性文件的解析不在这里。

use serde::{Serialize, Deserialize};
use std::time::Duration;

/// 配置错误
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for field '{field}': {value} - {reason}. Suggestion: {suggestion}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
        suggestion: String,
    },

    #[error("Missing required field: {field}. {suggestion}")]
    MissingField {
        field: String,
        suggestion: String,
    },

    #[error("Invalid address: {address} - {reason}")]
    InvalidAddress {
        address: String,
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Configuration conflict: {message}")]
    Conflict { message: String },
}

impl ConfigError {
    /// 出错的字段名
    pub fn field(&self) -> &str {
        match self {
            ConfigError::InvalidValue { field, .. } => field,
            ConfigError::MissingField { field, .. } => field,
            ConfigError::InvalidAddress { .. } => "address",
            ConfigError::Conflict { .. } => "config",
        }
    }
}

/// 解析主机名时使用的 IP 版本
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IpVersion {
    V4,
    V6,
    Both,
}

/// ACM 关闭策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AcmClose {
    Off,
    OnIdle,
    OnInvocation,
    OnInvocationAndIdle,
    OnIdleForceful,
}

/// ACM 心跳策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AcmHeartbeat {
    Off,
    OnDispatch,
    OnIdle,
    Always,
}

/// 活动连接监控（ACM）策略
///
/// 每个连接管理器持有一份，连接创建时复制给连接。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcmConfig {
    /// 空闲超时
    pub timeout: Duration,
    /// 关闭策略
    pub close: AcmClose,
    /// 心跳策略
    pub heartbeat: AcmHeartbeat,
}

impl Default for AcmConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            close: AcmClose::OnInvocationAndIdle,
            heartbeat: AcmHeartbeat::OnDispatch,
        }
    }
}

impl AcmConfig {
    /// 关闭监控（数据报连接使用）
    pub fn disabled() -> Self {
        Self {
            timeout: Duration::ZERO,
            close: AcmClose::Off,
            heartbeat: AcmHeartbeat::Off,
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.timeout.is_zero() || (self.close == AcmClose::Off && self.heartbeat == AcmHeartbeat::Off)
    }
}

/// 连接管理核心的配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// 连接超时时间（0 表示不限制）
    pub connect_timeout: Duration,
    /// accept 出错后的重试间隔
    pub accept_retry_delay: Duration,
    /// 是否对服务端建连失败打印警告
    pub warn_connections: bool,
    /// 解析主机名时使用的 IP 版本
    pub ip_version: IpVersion,
    /// 同时有 IPv4 / IPv6 地址时优先 IPv6
    pub prefer_ipv6: bool,
    /// ice1 端点缺省 `-h` 时使用的主机
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_host: Option<String>,
    /// 客户端连接的 ACM 策略
    pub client_acm: AcmConfig,
    /// 服务端连接的 ACM 策略
    pub server_acm: AcmConfig,
    /// 事件广播通道容量
    pub event_buffer: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            accept_retry_delay: Duration::from_secs(1),
            warn_connections: false,
            ip_version: IpVersion::Both,
            prefer_ipv6: false,
            default_host: None,
            client_acm: AcmConfig::default(),
            server_acm: AcmConfig::default(),
            event_buffer: 1000,
        }
    }
}

impl TransportConfig {
    /// 创建默认配置
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置连接超时时间
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// 设置 accept 失败后的重试间隔
    pub fn with_accept_retry_delay(mut self, delay: Duration) -> Self {
        self.accept_retry_delay = delay;
        self
    }

    /// 打开或关闭服务端建连警告
    pub fn with_warn_connections(mut self, warn: bool) -> Self {
        self.warn_connections = warn;
        self
    }

    /// 设置 IP 版本
    pub fn with_ip_version(mut self, ip_version: IpVersion) -> Self {
        self.ip_version = ip_version;
        self
    }

    /// 设置是否优先 IPv6
    pub fn with_prefer_ipv6(mut self, prefer: bool) -> Self {
        self.prefer_ipv6 = prefer;
        self
    }

    /// 设置缺省主机
    pub fn with_default_host(mut self, host: impl Into<String>) -> Self {
        self.default_host = Some(host.into());
        self
    }

    /// 设置客户端 ACM 策略
    pub fn with_client_acm(mut self, acm: AcmConfig) -> Self {
        self.client_acm = acm;
        self
    }

    /// 设置服务端 ACM 策略
    pub fn with_server_acm(mut self, acm: AcmConfig) -> Self {
        self.server_acm = acm;
        self
    }

    /// 验证配置
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.accept_retry_delay.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "accept_retry_delay".to_string(),
                value: "0".to_string(),
                reason: "a zero delay turns a failing accept into a busy loop".to_string(),
                suggestion: "set a positive value like 1s".to_string(),
            });
        }

        if self.event_buffer == 0 {
            return Err(ConfigError::InvalidValue {
                field: "event_buffer".to_string(),
                value: "0".to_string(),
                reason: "must be > 0".to_string(),
                suggestion: "set a positive value like 1000".to_string(),
            });
        }

        if self.prefer_ipv6 && self.ip_version == IpVersion::V4 {
            return Err(ConfigError::Conflict {
                message: "prefer_ipv6 is set but ip_version only allows IPv4".to_string(),
            });
        }

        Ok(())
    }

    /// 构建并验证配置
    pub fn build(self) -> Result<Self, ConfigError> {
        self.validate()?;
        Ok(self)
    }
}
