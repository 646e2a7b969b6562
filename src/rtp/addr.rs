//! Remote address helpers

use std::net::{SocketAddr, ToSocketAddrs};

use crate::constants::RESOLVE_PROBE_PORT;
use crate::error::TransportError;

/// Whether `remote` resolves to an IPv6 address.
///
/// Only the first resolved address is inspected. Resolution failure is
/// logged and reported as `false`
pub fn is_ipv6(remote: &str) -> bool {
    match (remote, RESOLVE_PROBE_PORT).to_socket_addrs() {
        Ok(mut addrs) => match addrs.next() {
            Some(addr) => addr.is_ipv6(),
            None => {
                tracing::warn!("No address found for {}", remote);
                false
            }
        },
        Err(e) => {
            tracing::warn!("Could not resolve {}: {}", remote, e);
            false
        }
    }
}

/// Resolve `host:port` to an address usable from a socket of the given family
pub fn resolve(host: &str, port: u16, ipv6_socket: bool) -> Result<SocketAddr, TransportError> {
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|e| TransportError::Resolve(format!("{}: {}", host, e)))?
        .collect();

    if let Some(addr) = addrs.iter().find(|a| a.is_ipv6() == ipv6_socket) {
        return Ok(*addr);
    }
    match addrs.first() {
        // Dual-stack socket reaching an IPv4 peer
        Some(SocketAddr::V4(v4)) if ipv6_socket => {
            Ok(SocketAddr::new(v4.ip().to_ipv6_mapped().into(), v4.port()))
        }
        Some(addr) => Err(TransportError::Resolve(format!(
            "{} has no address usable from an {} socket",
            addr,
            if ipv6_socket { "IPv6" } else { "IPv4" }
        ))),
        None => Err(TransportError::Resolve(format!("{}: no address", host))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_ipv6() {
        assert!(!is_ipv6("192.0.2.1"));
        assert!(is_ipv6("::1"));
        assert!(!is_ipv6("nonexistent.invalid"));
    }

    #[test]
    fn test_resolve_families() {
        let v4 = resolve("127.0.0.1", 5004, false).unwrap();
        assert_eq!(v4, "127.0.0.1:5004".parse().unwrap());

        let mapped = resolve("127.0.0.1", 5004, true).unwrap();
        assert!(mapped.is_ipv6());

        assert!(resolve("::1", 5004, false).is_err());
        assert!(resolve("nonexistent.invalid", 5004, false).is_err());
    }
}
