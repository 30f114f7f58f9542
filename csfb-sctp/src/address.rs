//! Peer address resolution
//!
//! Turns a comma-separated host list plus a port into the (possibly
//! multi-homed) address descriptor used to connect or bind.

use std::fmt;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::str::FromStr;

use tracing::warn;

/// Separator between hosts in a host list
pub const HOST_LIST_DELIMITER: char = ',';

/// One logical transport address: a set of IP addresses sharing a port.
///
/// Tokens that could not be resolved are kept in `unresolved` so callers can
/// tell a partially resolved list from a complete one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddress {
    addrs: Vec<IpAddr>,
    port: u16,
    unresolved: Vec<String>,
}

impl PeerAddress {
    /// Resolved IP addresses, in host list order
    pub fn addrs(&self) -> &[IpAddr] {
        &self.addrs
    }

    /// Port shared by every address
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Host tokens that did not resolve
    pub fn unresolved(&self) -> &[String] {
        &self.unresolved
    }

    /// True when no host resolved
    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    /// First resolved address with the port attached
    pub fn primary(&self) -> Option<SocketAddr> {
        self.addrs.first().map(|ip| SocketAddr::new(*ip, self.port))
    }

    /// Every resolved address with the port attached
    pub fn socket_addrs(&self) -> Vec<SocketAddr> {
        self.addrs
            .iter()
            .map(|ip| SocketAddr::new(*ip, self.port))
            .collect()
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hosts: Vec<String> = self.addrs.iter().map(IpAddr::to_string).collect();
        write!(f, "{}:{}", hosts.join(","), self.port)
    }
}

/// Resolves a comma-separated host list into a [`PeerAddress`].
///
/// Each token keeps at most one address, so the result holds exactly one
/// entry per resolvable token. Unresolvable tokens are dropped from the
/// address set and reported through [`PeerAddress::unresolved`]. The port is
/// carried verbatim.
pub fn resolve_peer_address(host_list: &str, port: u16) -> PeerAddress {
    let mut addrs = Vec::new();
    let mut unresolved = Vec::new();

    if !host_list.trim().is_empty() {
        for token in host_list.split(HOST_LIST_DELIMITER) {
            match resolve_host(token.trim()) {
                Some(ip) => addrs.push(ip),
                None => {
                    warn!(host = token, "Dropping unresolvable host from address list");
                    unresolved.push(token.to_string());
                }
            }
        }
    }

    PeerAddress {
        addrs,
        port,
        unresolved,
    }
}

fn resolve_host(host: &str) -> Option<IpAddr> {
    if host.is_empty() {
        return None;
    }

    // Fast path for IP literals
    if let Ok(ip) = IpAddr::from_str(host) {
        return Some(ip);
    }

    (host, 0u16)
        .to_socket_addrs()
        .ok()?
        .next()
        .map(|addr| addr.ip())
}
