use std::fmt;
use std::str::FromStr;

use crate::error::TransportError;

const SCHEME: &str = "tcp://";

/// A network endpoint: protocol, host and port.
///
/// Rendered as `tcp://host:port`, the form stored in the discovery store
/// and embedded in request envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    /// Create an endpoint from host and port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// The host part.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The port part.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The same host with another port.
    pub fn with_port(&self, port: u16) -> Self {
        Self {
            host: self.host.clone(),
            port,
        }
    }

    /// The `host:port` form accepted by `std::net` connect/bind calls.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{SCHEME}{}:{}", self.host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s.strip_prefix(SCHEME).unwrap_or(s);
        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| TransportError::InvalidEndpoint(s.to_string()))?;
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
    fn display_roundtrip() {
        let endpoint = Endpoint::new("10.0.0.7", 7001);
        assert_eq!(endpoint.to_string(), "tcp://10.0.0.7:7001");

        let parsed: Endpoint = endpoint.to_string().parse().unwrap();
        assert_eq!(parsed, endpoint);
    }

    #[test]
    fn parses_without_scheme() {
        let endpoint: Endpoint = "localhost:9000".parse().unwrap();
        assert_eq!(endpoint.host(), "localhost");
        assert_eq!(endpoint.port(), 9000);
    }

    #[test]
    fn with_port_keeps_host() {
        let endpoint = Endpoint::new("127.0.0.1", 8000);
        let other = endpoint.with_port(8001);
        assert_eq!(other.host(), "127.0.0.1");
        assert_eq!(other.port(), 8001);
    }

    #[test]
    fn rejects_missing_port() {
        assert!(matches!(
            "tcp://justahost".parse::<Endpoint>(),
            Err(TransportError::InvalidEndpoint(_))
        ));
    }

    #[test]
    fn rejects_empty_host() {
        assert!(matches!(
            "tcp://:8000".parse::<Endpoint>(),
            Err(TransportError::InvalidEndpoint(_))
        ));
    }

    #[test]
    fn rejects_non_numeric_port() {
        assert!(matches!(
            "host:port".parse::<Endpoint>(),
            Err(TransportError::InvalidEndpoint(_))
        ));
    }
}
