/// 地址解析辅助函数

use rand::seq::SliceRandom;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::{
    config::{IpVersion, TransportConfig},
    context::TransportContext,
    endpoint::{Endpoint, EndpointSelection},
    error::TransportError,
    instrumentation::ObserverScope,
};

/// 把客户端端点解析为一组套接字地址
///
/// 空主机名解析为回环地址。结果按 IP 版本过滤，按 `prefer_ipv6` 排序，
/// `Random` 选择策略下再整体打乱。
pub async fn resolve_for_client(
    context: &TransportContext,
    endpoint: &dyn Endpoint,
    selection: EndpointSelection,
) -> Result<Vec<SocketAddr>, TransportError> {
    let scope = ObserverScope::new(
        context
            .observer()
            .and_then(|observer| observer.endpoint_lookup_observer(endpoint)),
    );

    let result = lookup(context.config(), endpoint.host(), endpoint.port()).await;
    match result {
        Ok(mut addrs) => {
            if selection == EndpointSelection::Random {
                addrs.shuffle(&mut rand::thread_rng());
            }
            tracing::debug!("🔍 解析 {} 得到 {} 个地址", endpoint, addrs.len());
            Ok(addrs)
        }
        Err(error) => {
            scope.failed(error.error_code());
            Err(error)
        }
    }
}

/// 解析服务端绑定地址，空主机名或 `*` 表示通配地址
pub async fn resolve_for_bind(
    config: &TransportConfig,
    host: &str,
    port: u16,
) -> Result<SocketAddr, TransportError> {
    if host.is_empty() || host == "*" {
        let ip = match config.ip_version {
            IpVersion::V6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            _ => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        };
        return Ok(SocketAddr::new(ip, port));
    }

    let addrs = lookup(config, host, port).await?;
    addrs
        .into_iter()
        .next()
        .ok_or_else(|| TransportError::resolution_error(host, "no suitable address"))
}

async fn lookup(
    config: &TransportConfig,
    host: &str,
    port: u16,
) -> Result<Vec<SocketAddr>, TransportError> {
    if host.is_empty() {
        return Ok(loopback(config.ip_version, config.prefer_ipv6)
            .into_iter()
            .map(|ip| SocketAddr::new(ip, port))
            .collect());
    }

    // IP 字面量不走 DNS
    if let Ok(ip) = host.parse::<IpAddr>() {
        let addr = SocketAddr::new(ip, port);
        return if accepts(config.ip_version, &addr) {
            Ok(vec![addr])
        } else {
            Err(TransportError::resolution_error(
                host,
                format!("address family not enabled by ip version {:?}", config.ip_version),
            ))
        };
    }

    let resolved = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| TransportError::resolution_error(host, e.to_string()))?;

    let mut addrs: Vec<SocketAddr> = resolved
        .filter(|addr| accepts(config.ip_version, addr))
        .collect();
    addrs.dedup();

    if addrs.is_empty() {
        return Err(TransportError::resolution_error(host, "no suitable address"));
    }

    // 稳定排序，保留同族地址的原始顺序
    addrs.sort_by_key(|addr| addr.is_ipv6() != config.prefer_ipv6);
    Ok(addrs)
}

fn accepts(ip_version: IpVersion, addr: &SocketAddr) -> bool {
    match ip_version {
        IpVersion::V4 => addr.is_ipv4(),
        IpVersion::V6 => addr.is_ipv6(),
        IpVersion::Both => true,
    }
}

fn loopback(ip_version: IpVersion, prefer_ipv6: bool) -> Vec<IpAddr> {
    let v4 = IpAddr::V4(Ipv4Addr::LOCALHOST);
    let v6 = IpAddr::V6(Ipv6Addr::LOCALHOST);
    match ip_version {
        IpVersion::V4 => vec![v4],
        IpVersion::V6 => vec![v6],
        IpVersion::Both if prefer_ipv6 => vec![v6, v4],
        IpVersion::Both => vec![v4, v6],
    }
}
