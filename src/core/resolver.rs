//! Endpoint resolution: hostname + port ke satu alamat IPv4

use std::net::{SocketAddr, ToSocketAddrs};

use tracing::debug;

use crate::error::{Error, Result};

/// Resolve `host:port` to the first IPv4 address the system lookup returns.
///
/// IPv6 results are skipped. No IPv4 address at all is an
/// `Error::Resolve`; the lookup is never retried.
pub fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    let candidates = (host, port).to_socket_addrs().map_err(|e| Error::Resolve {
        host: host.to_string(),
        port,
        source: Some(e),
    })?;

    let addr = candidates
        .into_iter()
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| Error::Resolve {
            host: host.to_string(),
            port,
            source: None,
        })?;

    debug!(host, port, %addr, "Resolved endpoint");
    Ok(addr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_resolve_literal() {
        let addr = resolve("127.0.0.1", 8080).unwrap();
        assert_eq!(addr, SocketAddr::from((Ipv4Addr::LOCALHOST, 8080)));
    }

    #[test]
    fn test_resolve_localhost_is_ipv4() {
        let addr = resolve("localhost", 0).unwrap();
        assert!(addr.is_ipv4());
        assert!(addr.ip().is_loopback());
    }

    #[test]
    fn test_ipv6_only_host_fails() {
        let err = resolve("::1", 80).unwrap_err();
        assert!(matches!(err, Error::Resolve { source: None, .. }));
    }

    #[test]
    fn test_unresolvable_host_fails() {
        let err = resolve("host.invalid", 80).unwrap_err();
        assert!(matches!(err, Error::Resolve { .. }));
    }
}
