use std::fmt;
use std::str::FromStr;

use crate::error::TransportError;

/// Default plaintext control channel port.
pub const DEFAULT_CONTROL_PORT: u16 = 9000;

/// Port used by older controllers that predate the 9000 default.
pub const LEGACY_CONTROL_PORT: u16 = 8080;

/// A controller address: host name or IP plus TCP port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Same host on the legacy control port.
    pub fn legacy(&self) -> Self {
        Self::new(self.host.clone(), LEGACY_CONTROL_PORT)
    }

    /// `host:port` form accepted by `tokio::net` address resolution.
    ///
    /// IPv6 literals are bracketed.
    pub fn authority(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.authority())
    }
}

impl FromStr for Endpoint {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| TransportError::InvalidEndpoint(s.to_string()))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(TransportError::InvalidEndpoint(s.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| TransportError::InvalidEndpoint(s.to_string()))?;
        Ok(Self::new(host, port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_and_port() {
        let ep: Endpoint = "192.168.0.100:9000".parse().unwrap();
        assert_eq!(ep.host, "192.168.0.100");
        assert_eq!(ep.port, 9000);
        assert_eq!(ep.to_string(), "192.168.0.100:9000");
    }

    #[test]
    fn brackets_ipv6_literals() {
        let ep: Endpoint = "[::1]:9000".parse().unwrap();
        assert_eq!(ep.host, "::1");
        assert_eq!(ep.authority(), "[::1]:9000");
    }

    #[test]
    fn rejects_missing_port() {
        assert!(matches!(
            "controller".parse::<Endpoint>(),
            Err(TransportError::InvalidEndpoint(_))
        ));
        assert!(":9000".parse::<Endpoint>().is_err());
        assert!("host:notaport".parse::<Endpoint>().is_err());
    }

    #[test]
    fn legacy_switches_port_only() {
        let ep = Endpoint::new("pc.local", DEFAULT_CONTROL_PORT).legacy();
        assert_eq!(ep, Endpoint::new("pc.local", LEGACY_CONTROL_PORT));
    }
}
