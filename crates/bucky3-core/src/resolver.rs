//! Host name parsing and cached resolution.

use std::net::{SocketAddr, ToSocketAddrs};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::CoreError;

/// How long resolved remote addresses stay cached.
const RESOLVE_TTL: Duration = Duration::from_secs(180);

/// Split `"host"` or `"host:port"` and resolve it. Resolution failure yields
/// an empty set; a malformed address is an error.
pub fn parse_address(address: &str, default_port: u16) -> Result<Vec<SocketAddr>, CoreError> {
    let mut bits = address.split(':');
    let host = bits.next().unwrap_or_default();
    let port = match bits.next() {
        None => default_port,
        Some(port) => port
            .parse::<u16>()
            .map_err(|_| CoreError::InvalidAddress(address.to_string()))?,
    };
    if host.is_empty() || bits.next().is_some() {
        return Err(CoreError::InvalidAddress(address.to_string()));
    }

    match (host, port).to_socket_addrs() {
        Ok(addrs) => Ok(addrs.collect()),
        Err(e) => {
            debug!("could not resolve {host}: {e}");
            Ok(Vec::new())
        }
    }
}

/// Resolve the local bind address. Failure here is a misconfiguration and is
/// fatal, unlike remote resolution.
pub fn resolve_local(address: &str, default_port: u16) -> Result<SocketAddr, CoreError> {
    let mut resolved = parse_address(address, default_port)?;
    if resolved.is_empty() {
        return Err(CoreError::UnresolvedLocalHost(address.to_string()));
    }
    let pick = fastrand::usize(..resolved.len());
    Ok(resolved.swap_remove(pick))
}

/// Remote host resolution with a 180 second cache. Callers always get the
/// current filtered set; no particular order is guaranteed.
pub struct CachedResolver {
    hosts: Vec<String>,
    default_port: u16,
    resolved: Vec<SocketAddr>,
    refreshed: Option<Instant>,
}

impl CachedResolver {
    pub fn new(hosts: Vec<String>, default_port: u16) -> Self {
        Self {
            hosts,
            default_port,
            resolved: Vec::new(),
            refreshed: None,
        }
    }

    pub fn resolve(&mut self) -> &[SocketAddr] {
        let stale = match self.refreshed {
            None => true,
            Some(at) => at.elapsed() > RESOLVE_TTL,
        };
        if stale {
            let mut resolved = Vec::new();
            for host in &self.hosts {
                match parse_address(host, self.default_port) {
                    Ok(addrs) => resolved.extend(addrs),
                    Err(e) => debug!("skipping remote host {host}: {e}"),
                }
            }
            resolved.sort();
            resolved.dedup();
            self.resolved = resolved;
            self.refreshed = Some(Instant::now());
        }
        &self.resolved
    }

    /// The resolved set in a freshly shuffled order, for connection attempts
    /// that should spread load across the pool.
    pub fn resolve_shuffled(&mut self) -> Vec<SocketAddr> {
        let mut addrs = self.resolve().to_vec();
        fastrand::shuffle(&mut addrs);
        addrs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_and_port() {
        let addrs = parse_address("127.0.0.1:9000", 1234).unwrap();
        assert_eq!(addrs, vec!["127.0.0.1:9000".parse().unwrap()]);
    }

    #[test]
    fn default_port_applies() {
        let addrs = parse_address("127.0.0.1", 1234).unwrap();
        assert_eq!(addrs, vec!["127.0.0.1:1234".parse().unwrap()]);
    }

    #[test]
    fn bad_port_is_an_error() {
        assert!(parse_address("localhost:not-a-port", 1).is_err());
        assert!(parse_address("", 1).is_err());
    }

    #[test]
    fn unresolvable_remote_is_empty() {
        let addrs = parse_address("no-such-host.invalid", 1).unwrap();
        assert!(addrs.is_empty());
    }

    #[test]
    fn unresolvable_local_is_fatal() {
        assert!(resolve_local("no-such-host.invalid", 1).is_err());
    }

    #[test]
    fn cached_resolver_filters_failures() {
        let mut resolver = CachedResolver::new(
            vec!["127.0.0.1:9000".to_string(), "no-such-host.invalid".to_string()],
            9000,
        );
        let expected: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        assert_eq!(resolver.resolve().to_vec(), vec![expected]);
    }
}
