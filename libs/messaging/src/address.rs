//! Cluster Member Address
//!
//! Host + port endpoint of a cluster member. Immutable value type with
//! structural equality so it can key per-peer state maps. Hostname
//! resolution happens at dial time, never at construction.

use crate::error::{MessagingError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

/// Network endpoint of a cluster member
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    host: String,
    port: u16,
}

impl Address {
    /// Create an address from a host and port
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Create a loopback address for the given port
    pub fn local(port: u16) -> Self {
        Self::new("127.0.0.1", port)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The host as an IP literal, if it is one
    pub fn ip(&self) -> Option<IpAddr> {
        self.host.parse().ok()
    }

    /// Resolve the address to a socket address, performing a DNS lookup for
    /// hostnames. The first resolved entry wins.
    pub async fn resolve(&self) -> Result<SocketAddr> {
        if let Some(ip) = self.ip() {
            return Ok(SocketAddr::new(ip, self.port));
        }
        let mut addrs = tokio::net::lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|e| MessagingError::connect(self, e))?;
        addrs
            .next()
            .ok_or_else(|| MessagingError::connect_msg(self, "hostname resolved to no addresses"))
    }

    /// Resolve only the IP portion of the address
    pub async fn resolve_ip(&self) -> Result<IpAddr> {
        self.resolve().await.map(|sa| sa.ip())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl FromStr for Address {
    type Err = MessagingError;

    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| MessagingError::configuration(format!("invalid address '{s}'")))?;
        let port = port
            .parse()
            .map_err(|_| MessagingError::configuration(format!("invalid port in '{s}'")))?;
        if host.is_empty() {
            return Err(MessagingError::configuration(format!(
                "empty host in '{s}'"
            )));
        }
        Ok(Self::new(host, port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_and_port() {
        let addr: Address = "node-1.cluster.local:26502".parse().unwrap();
        assert_eq!(addr.host(), "node-1.cluster.local");
        assert_eq!(addr.port(), 26502);
        assert_eq!(addr.to_string(), "node-1.cluster.local:26502");
    }

    #[test]
    fn rejects_malformed_addresses() {
        assert!("no-port".parse::<Address>().is_err());
        assert!(":123".parse::<Address>().is_err());
        assert!("host:notaport".parse::<Address>().is_err());
    }

    #[test]
    fn structural_equality_for_map_keys() {
        let a = Address::new("10.0.0.1", 9000);
        let b: Address = "10.0.0.1:9000".parse().unwrap();
        assert_eq!(a, b);

        let mut map = std::collections::HashMap::new();
        map.insert(a, 1);
        assert_eq!(map.get(&b), Some(&1));
    }

    #[tokio::test]
    async fn resolves_ip_literals_without_dns() {
        let addr = Address::local(1234);
        let resolved = addr.resolve().await.unwrap();
        assert_eq!(resolved, "127.0.0.1:1234".parse().unwrap());
    }
}
