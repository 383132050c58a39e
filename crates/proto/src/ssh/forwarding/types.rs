//! Forward address parsing.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use tern_platform::{TernError, TernResult};

/// A `host:port` pair used for listeners and forward targets.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ForwardAddr {
    /// Host name or IP literal (IPv6 without brackets)
    pub host: String,
    /// Port number
    pub port: u16,
}

impl ForwardAddr {
    /// Creates a new forward address.
    pub fn new(host: String, port: u16) -> Self {
        Self { host, port }
    }

    /// Returns a socket address when the host is an IP literal.
    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        self.host
            .parse::<IpAddr>()
            .ok()
            .map(|ip| SocketAddr::new(ip, self.port))
    }

    /// Converts a resolved socket address back into a forward address.
    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl fmt::Display for ForwardAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Parses `host:port` or `[v6-literal]:port`.
///
/// ```rust
/// use tern_proto::ssh::forwarding::parse_forward_addr;
///
/// let addr = parse_forward_addr("localhost:8080").unwrap();
/// assert_eq!(addr.host, "localhost");
/// assert_eq!(addr.port, 8080);
///
/// let addr = parse_forward_addr("[::1]:22").unwrap();
/// assert_eq!(addr.host, "::1");
/// ```
pub fn parse_forward_addr(addr: &str) -> TernResult<ForwardAddr> {
    let invalid = |why: &str| TernError::Config(format!("Invalid forward address '{}': {}", addr, why));

    let (host, port) = if let Some(rest) = addr.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(|| invalid("missing ']'"))?;
        let port = tail
            .strip_prefix(':')
            .ok_or_else(|| invalid("missing ':' after ']'"))?;
        (host, port)
    } else {
        addr.rsplit_once(':')
            .ok_or_else(|| invalid("expected host:port"))?
    };

    if host.is_empty() {
        return Err(invalid("empty host"));
    }
    let port = port.parse::<u16>().map_err(|_| invalid("bad port"))?;
    Ok(ForwardAddr::new(host.to_string(), port))
}
