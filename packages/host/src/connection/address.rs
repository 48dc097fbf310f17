//! Multiaddress parsing for connection-open requests.
//!
//! Supported grammar:
//!
//! ```text
//! /{ip4|ip6|dns4|dns6|dns}/<host>/tcp/<port>[/{ws|wss}]
//! ```
//!
//! Peers decide the content of these addresses, so nothing here trusts them.

use url::Url;

use crate::error::ConnectionError;

/// Where and how to connect for a given multiaddress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectTarget {
    /// A socket-stream (WebSocket) transport, `ws://` or `wss://`.
    WebSocket { url: String },
    /// A raw TCP stream.
    Tcp { host: String, port: u16 },
}

impl ConnectTarget {
    /// Short name of the transport kind, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ConnectTarget::WebSocket { .. } => "websocket",
            ConnectTarget::Tcp { .. } => "tcp",
        }
    }
}

impl std::fmt::Display for ConnectTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectTarget::WebSocket { url } => write!(f, "{}", url),
            ConnectTarget::Tcp { host, port } => write!(f, "tcp://{}:{}", host, port),
        }
    }
}

/// Parse a multiaddress into a connection target.
///
/// A trailing `ws`/`wss` segment always selects the WebSocket transport.
pub fn parse_address(addr: &str) -> Result<ConnectTarget, ConnectionError> {
    let unsupported = || ConnectionError::UnsupportedAddress(addr.to_string());

    let rest = addr.strip_prefix('/').ok_or_else(unsupported)?;
    let segments: Vec<&str> = rest.split('/').collect();

    let (proto, host, tcp, port, ws) = match segments.as_slice() {
        [proto, host, tcp, port] => (*proto, *host, *tcp, *port, None),
        [proto, host, tcp, port, ws] => (*proto, *host, *tcp, *port, Some(*ws)),
        _ => return Err(unsupported()),
    };

    if !matches!(proto, "ip4" | "ip6" | "dns4" | "dns6" | "dns") || tcp != "tcp" || host.is_empty()
    {
        return Err(unsupported());
    }
    let port: u16 = port.parse().map_err(|_| unsupported())?;

    match ws {
        None => Ok(ConnectTarget::Tcp {
            host: host.to_string(),
            port,
        }),
        Some(scheme @ ("ws" | "wss")) => {
            let url = if proto == "ip6" {
                format!("{}://[{}]:{}", scheme, host, port)
            } else {
                format!("{}://{}:{}", scheme, host, port)
            };
            // Reject hosts that cannot form a valid URL (spaces, stray brackets, ...).
            Url::parse(&url).map_err(|_| unsupported())?;
            Ok(ConnectTarget::WebSocket { url })
        }
        Some(_) => Err(unsupported()),
    }
}
