//! Endpoint identity of a forwarded connection.

use super::types::ForwardAddr;
use std::fmt;

/// Identifies a forwarded TCP connection by both of its endpoints.
///
/// For a `direct-tcpip` channel the local side is the originator (the peer
/// that connected to our listener) and the remote side is the target the
/// server should connect to. For `forwarded-tcpip` the remote side is the
/// address the server accepted on and the local side is the originator it
/// reports.
///
/// Hosts compare byte for byte; no name resolution is involved. Equal values
/// hash identically, so `Parameters` works as a map key.
///
/// ```rust
/// use std::collections::HashMap;
/// use tern_proto::ssh::forwarding::Parameters;
///
/// let key = Parameters::new("127.0.0.1", 50000, "db.internal", 5432);
/// let mut relays = HashMap::new();
/// relays.insert(key, "relay-1");
///
/// let lookup = Parameters::new("127.0.0.1", 50000, "db.internal", 5432);
/// assert_eq!(relays.get(&lookup), Some(&"relay-1"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Parameters {
    local_host: String,
    local_port: u16,
    remote_host: String,
    remote_port: u16,
}

impl Parameters {
    /// Creates an endpoint identity.
    pub fn new(
        local_host: impl Into<String>,
        local_port: u16,
        remote_host: impl Into<String>,
        remote_port: u16,
    ) -> Self {
        Self {
            local_host: local_host.into(),
            local_port,
            remote_host: remote_host.into(),
            remote_port,
        }
    }

    /// Builds the identity from two forward addresses.
    pub fn from_addrs(local: &ForwardAddr, remote: &ForwardAddr) -> Self {
        Self::new(local.host.clone(), local.port, remote.host.clone(), remote.port)
    }

    /// Local host.
    pub fn local_host(&self) -> &str {
        &self.local_host
    }

    /// Local port.
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Remote host.
    pub fn remote_host(&self) -> &str {
        &self.remote_host
    }

    /// Remote port.
    pub fn remote_port(&self) -> u16 {
        self.remote_port
    }

    /// Local endpoint as a forward address.
    pub fn local_addr(&self) -> ForwardAddr {
        ForwardAddr::new(self.local_host.clone(), self.local_port)
    }

    /// Remote endpoint as a forward address.
    pub fn remote_addr(&self) -> ForwardAddr {
        ForwardAddr::new(self.remote_host.clone(), self.remote_port)
    }
}

impl fmt::Display for Parameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {}",
            self.local_addr(),
            self.remote_addr()
        )
    }
}
