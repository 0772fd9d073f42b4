//! Node endpoints.
//!
//! An [`Endpoint`] is a `host:port` pair. IPv6 literals are written in
//! brackets (`[::1]:20200`). The display form doubles as the pool key, so two
//! endpoints with the same host and port always dedupe to one session.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced while parsing an endpoint string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EndpointError {
    /// No `:port` suffix was found.
    #[error("missing port in endpoint '{0}'")]
    MissingPort(String),
    /// The port was not a number in `1..=65535`.
    #[error("invalid port in endpoint '{0}'")]
    InvalidPort(String),
    /// The host part was empty or malformed.
    #[error("invalid host in endpoint '{0}'")]
    InvalidHost(String),
}

/// A remote node address.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    /// Build an endpoint from parts. Brackets around an IPv6 host are stripped.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .map_or(host.clone(), str::to_owned);
        Self { host, port }
    }

    /// Host name or IP literal, without brackets.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// TCP port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Whether the host is an IPv6 literal.
    pub fn is_ipv6(&self) -> bool {
        self.host.contains(':')
    }

    /// Key used to index sessions and topology entries.
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ipv6() {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Endpoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| EndpointError::InvalidHost(s.to_owned()))?;
            let port = tail
                .strip_prefix(':')
                .ok_or_else(|| EndpointError::MissingPort(s.to_owned()))?;
            (host, port)
        } else {
            let (host, port) = s
                .rsplit_once(':')
                .ok_or_else(|| EndpointError::MissingPort(s.to_owned()))?;
            // bare IPv6 without brackets is ambiguous
            if host.contains(':') {
                return Err(EndpointError::InvalidHost(s.to_owned()));
            }
            (host, port)
        };

        if host.is_empty() {
            return Err(EndpointError::InvalidHost(s.to_owned()));
        }
        let port: u16 = port
            .parse()
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| EndpointError::InvalidPort(s.to_owned()))?;

        Ok(Self {
            host: host.to_owned(),
            port,
        })
    }
}

impl TryFrom<String> for Endpoint {
    type Error = EndpointError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Endpoint> for String {
    fn from(ep: Endpoint) -> Self {
        ep.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn parses_ipv4() {
        let ep: Endpoint = "127.0.0.1:20200".parse().unwrap();
        assert_eq!(ep.host(), "127.0.0.1");
        assert_eq!(ep.port(), 20200);
        assert!(!ep.is_ipv6());
    }

    #[test]
    fn parses_dns_name() {
        let ep: Endpoint = "node0.example.org:20201".parse().unwrap();
        assert_eq!(ep.host(), "node0.example.org");
        assert_eq!(ep.to_string(), "node0.example.org:20201");
    }

    #[test]
    fn parses_bracketed_ipv6() {
        let ep: Endpoint = "[::1]:20200".parse().unwrap();
        assert_eq!(ep.host(), "::1");
        assert!(ep.is_ipv6());
        assert_eq!(ep.to_string(), "[::1]:20200");
    }

    #[test]
    fn new_strips_brackets() {
        let ep = Endpoint::new("[fe80::1]", 30300);
        assert_eq!(ep.host(), "fe80::1");
        assert_eq!(ep.key(), "[fe80::1]:30300");
    }

    #[test]
    fn rejects_missing_port() {
        assert_matches!("127.0.0.1".parse::<Endpoint>(), Err(EndpointError::MissingPort(_)));
        assert_matches!("[::1]".parse::<Endpoint>(), Err(EndpointError::MissingPort(_)));
    }

    #[test]
    fn rejects_bad_port() {
        assert_matches!("host:0".parse::<Endpoint>(), Err(EndpointError::InvalidPort(_)));
        assert_matches!("host:70000".parse::<Endpoint>(), Err(EndpointError::InvalidPort(_)));
        assert_matches!("host:abc".parse::<Endpoint>(), Err(EndpointError::InvalidPort(_)));
    }

    #[test]
    fn rejects_unbracketed_ipv6() {
        assert_matches!("::1:20200".parse::<Endpoint>(), Err(EndpointError::InvalidHost(_)));
    }

    #[test]
    fn rejects_empty_host() {
        assert_matches!(":20200".parse::<Endpoint>(), Err(EndpointError::InvalidHost(_)));
    }

    #[test]
    fn same_host_port_share_key() {
        let a: Endpoint = "10.0.0.1:20200".parse().unwrap();
        let b = Endpoint::new("10.0.0.1", 20200);
        assert_eq!(a, b);
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn serde_as_string() {
        let ep: Endpoint = "127.0.0.1:20200".parse().unwrap();
        let json = serde_json::to_string(&ep).unwrap();
        assert_eq!(json, "\"127.0.0.1:20200\"");
        let back: Endpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ep);
    }

    #[test]
    fn serde_rejects_invalid() {
        assert!(serde_json::from_str::<Endpoint>("\"nope\"").is_err());
    }
}
