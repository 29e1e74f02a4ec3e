/// 端点字符串解析
///
/// 支持两种写法：
/// - ice1: `tcp -h host -p port [-t ms] [-z] [--sourceAddress ip]`、
///   `udp -h host -p port [-c] [-z] [--ttl n] [--interface iface] [--sourceAddress ip]`
/// - ice2: `ice+tcp://host[:port][?source-address=ip]`

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::{
    context::TransportContext,
    endpoint::{Endpoint, Protocol, Transport, DEFAULT_IP_PORT},
    error::TransportError,
};

fn format_error(input: &str, reason: impl std::fmt::Display) -> TransportError {
    TransportError::config_error("endpoint", format!("invalid endpoint `{}': {}", input, reason))
}

/// 解析端点字符串
///
/// `server_endpoint` 为 true 时允许 `-h *` 通配主机，同时拒绝源地址选项。
pub fn parse_endpoint(
    context: &Arc<TransportContext>,
    input: &str,
    server_endpoint: bool,
) -> Result<Arc<dyn Endpoint>, TransportError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(format_error(input, "empty endpoint"));
    }
    if trimmed.starts_with("ice+") {
        parse_uri(context, trimmed, server_endpoint)
    } else {
        parse_ice1(context, trimmed, server_endpoint)
    }
}

/// 按空白切分，双引号内的空白保留
fn tokenize(input: &str) -> Result<Vec<String>, TransportError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut has_token = false;

    for c in input.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                has_token = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if has_token {
                    tokens.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            c => {
                current.push(c);
                has_token = true;
            }
        }
    }
    if in_quotes {
        return Err(format_error(input, "mismatched quotes"));
    }
    if has_token {
        tokens.push(current);
    }
    Ok(tokens)
}

fn parse_ice1(
    context: &Arc<TransportContext>,
    input: &str,
    server_endpoint: bool,
) -> Result<Arc<dyn Endpoint>, TransportError> {
    let tokens = tokenize(input)?;
    let (transport_name, args) = tokens
        .split_first()
        .ok_or_else(|| format_error(input, "empty endpoint"))?;

    let transport = match transport_name.as_str() {
        "default" => Transport::Tcp,
        name => Transport::from_name(name)
            .ok_or_else(|| format_error(input, format!("unknown transport `{}'", name)))?,
    };

    let mut options: HashMap<String, Option<String>> = HashMap::new();
    let mut iter = args.iter().peekable();
    while let Some(option) = iter.next() {
        if !option.starts_with('-') {
            return Err(format_error(input, format!("expected an option but found `{}'", option)));
        }
        let argument = match iter.peek() {
            Some(next) if !next.starts_with('-') => iter.next().cloned(),
            _ => None,
        };
        if options.insert(option.clone(), argument).is_some() {
            return Err(format_error(input, format!("duplicate option `{}'", option)));
        }
    }

    let common = Ice1Options::extract(context, input, &mut options, server_endpoint)?;

    let endpoint: Arc<dyn Endpoint> = match transport {
        #[cfg(feature = "tcp")]
        Transport::Tcp => {
            let timeout = match take_argument(input, &mut options, "-t")? {
                None => None,
                Some(value) if value == "infinite" => Some(Duration::ZERO),
                Some(value) => {
                    let ms: u64 = value
                        .parse()
                        .map_err(|_| format_error(input, format!("invalid timeout value `{}'", value)))?;
                    if ms == 0 {
                        return Err(format_error(input, "timeout must be greater than 0"));
                    }
                    Some(Duration::from_millis(ms))
                }
            };
            Arc::new(
                crate::transport::TcpEndpoint::new(context.clone(), Protocol::Ice1, common.host, common.port)
                    .with_source_address(common.source_address)
                    .with_timeout(timeout)
                    .with_compress(common.compress),
            )
        }
        #[cfg(feature = "udp")]
        Transport::Udp => {
            let connect = take_flag(input, &mut options, "-c")?;
            let ttl = match take_argument(input, &mut options, "--ttl")? {
                None => None,
                Some(value) => Some(
                    value
                        .parse::<u32>()
                        .map_err(|_| format_error(input, format!("invalid ttl value `{}'", value)))?,
                ),
            };
            let interface = take_argument(input, &mut options, "--interface")?;
            Arc::new(
                crate::transport::UdpEndpoint::new(context.clone(), common.host, common.port)
                    .with_source_address(common.source_address)
                    .with_multicast_ttl(ttl)
                    .with_multicast_interface(interface)
                    .with_connect(connect)
                    .with_compress(common.compress),
            )
        }
        other => {
            return Err(format_error(input, format!("transport `{}' is not supported", other)));
        }
    };

    if let Some(unknown) = options.keys().next() {
        return Err(format_error(input, format!("unknown option `{}'", unknown)));
    }
    Ok(endpoint)
}

/// tcp 和 udp 共用的 ice1 选项
struct Ice1Options {
    host: String,
    port: u16,
    source_address: Option<IpAddr>,
    compress: bool,
}

impl Ice1Options {
    fn extract(
        context: &TransportContext,
        input: &str,
        options: &mut HashMap<String, Option<String>>,
        server_endpoint: bool,
    ) -> Result<Self, TransportError> {
        let host = match take_argument(input, options, "-h")? {
            Some(host) if host == "*" => {
                if !server_endpoint {
                    return Err(format_error(input, "`-h *' is only allowed for server endpoints"));
                }
                String::new()
            }
            Some(host) => host,
            None => context.config().default_host.clone().unwrap_or_default(),
        };

        let port = match take_argument(input, options, "-p")? {
            Some(port) => port
                .parse::<u16>()
                .map_err(|_| format_error(input, format!("invalid port value `{}'", port)))?,
            None => 0,
        };

        let source_address = parse_source_address(input, take_argument(input, options, "--sourceAddress")?, server_endpoint)?;
        let compress = take_flag(input, options, "-z")?;

        Ok(Self {
            host,
            port,
            source_address,
            compress,
        })
    }
}

fn take_argument(
    input: &str,
    options: &mut HashMap<String, Option<String>>,
    name: &str,
) -> Result<Option<String>, TransportError> {
    match options.remove(name) {
        None => Ok(None),
        Some(Some(value)) => Ok(Some(value)),
        Some(None) => Err(format_error(input, format!("no argument provided for `{}' option", name))),
    }
}

fn take_flag(
    input: &str,
    options: &mut HashMap<String, Option<String>>,
    name: &str,
) -> Result<bool, TransportError> {
    match options.remove(name) {
        None => Ok(false),
        Some(None) => Ok(true),
        Some(Some(value)) => Err(format_error(
            input,
            format!("unexpected argument `{}' provided for `{}' option", value, name),
        )),
    }
}

fn parse_source_address(
    input: &str,
    value: Option<String>,
    server_endpoint: bool,
) -> Result<Option<IpAddr>, TransportError> {
    let Some(value) = value else {
        return Ok(None);
    };
    if server_endpoint {
        return Err(format_error(input, "source address is not allowed for server endpoints"));
    }
    value
        .parse::<IpAddr>()
        .map(Some)
        .map_err(|_| format_error(input, format!("invalid source address `{}'", value)))
}

fn parse_uri(
    context: &Arc<TransportContext>,
    input: &str,
    server_endpoint: bool,
) -> Result<Arc<dyn Endpoint>, TransportError> {
    let url = url::Url::parse(input).map_err(|e| format_error(input, e))?;

    let transport_name = url.scheme().trim_start_matches("ice+");
    let transport = Transport::from_name(transport_name)
        .ok_or_else(|| format_error(input, format!("unknown transport `{}'", transport_name)))?;

    let host = url
        .host_str()
        .filter(|host| !host.is_empty())
        .ok_or_else(|| format_error(input, "missing host"))?;
    let host = host.trim_start_matches('[').trim_end_matches(']').to_string();
    let port = url.port().unwrap_or(DEFAULT_IP_PORT);

    if !url.path().is_empty() && url.path() != "/" {
        return Err(format_error(input, format!("unexpected path `{}'", url.path())));
    }

    let mut source_address = None;
    for (name, value) in url.query_pairs() {
        match name.as_ref() {
            "source-address" => {
                if source_address.is_some() {
                    return Err(format_error(input, "duplicate source-address parameter"));
                }
                source_address = parse_source_address(input, Some(value.into_owned()), server_endpoint)?;
            }
            other => return Err(format_error(input, format!("unknown parameter `{}'", other))),
        }
    }

    match transport {
        #[cfg(feature = "tcp")]
        Transport::Tcp => Ok(Arc::new(
            crate::transport::TcpEndpoint::new(context.clone(), Protocol::Ice2, host, port)
                .with_source_address(source_address),
        )),
        Transport::Udp => Err(format_error(input, "udp endpoints only support the ice1 protocol")),
        other => Err(format_error(input, format!("transport `{}' is not supported", other))),
    }
}
