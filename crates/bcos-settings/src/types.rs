//! Settings types.
//!
//! Every struct uses `#[serde(rename_all = "camelCase", default)]` so a
//! settings file only needs the keys it overrides.

use std::collections::BTreeSet;
use std::time::Duration;

use bcos_core::Endpoint;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BcosSettings {
    /// Connection pool and request settings.
    pub transport: TransportSettings,
    /// Log output settings.
    pub logging: LoggingSettings,
    /// Topic pub/sub settings.
    pub amop: AmopSettings,
}

impl BcosSettings {
    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        let _ = self.transport.endpoints()?;
        if self.transport.reconnect_period_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "transport.reconnectPeriodMs must be > 0".into(),
            ));
        }
        if self.transport.connect_timeout_ms == 0 || self.transport.handshake_timeout_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "transport connect/handshake timeouts must be > 0".into(),
            ));
        }
        if self.amop.topics.iter().any(|t| t.is_empty() || t.len() > usize::from(u16::MAX)) {
            return Err(SettingsError::InvalidValue(
                "amop.topics entries must be 1..=65535 bytes".into(),
            ));
        }
        Ok(())
    }
}

/// Connection pool settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransportSettings {
    /// Node endpoints as `host:port` (`[v6]:port` for IPv6 literals).
    pub peers: Vec<String>,
    /// Interval between reconnection attempts (and event resubscribes).
    pub reconnect_period_ms: u64,
    /// Deadline for resolve + TCP connect + WebSocket upgrade.
    pub connect_timeout_ms: u64,
    /// Deadline for the protocol handshake on a fresh session.
    pub handshake_timeout_ms: u64,
    /// Default timeout applied to requests that expect a reply.
    pub request_timeout_ms: u64,
    /// Largest frame accepted from a peer, in bytes.
    pub max_message_size: usize,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            peers: vec!["127.0.0.1:20200".to_string()],
            reconnect_period_ms: 10_000,
            connect_timeout_ms: 10_000,
            handshake_timeout_ms: 10_000,
            request_timeout_ms: 30_000,
            max_message_size: 100 * 1024 * 1024,
        }
    }
}

impl TransportSettings {
    /// Parse and dedupe the peer list. Order follows first appearance.
    pub fn endpoints(&self) -> Result<Vec<Endpoint>> {
        let mut seen = BTreeSet::new();
        let mut out = Vec::with_capacity(self.peers.len());
        for peer in &self.peers {
            let ep: Endpoint = peer.parse()?;
            if seen.insert(ep.key()) {
                out.push(ep);
            }
        }
        Ok(out)
    }

    /// Reconnect period as a [`Duration`].
    pub fn reconnect_period(&self) -> Duration {
        Duration::from_millis(self.reconnect_period_ms)
    }

    /// Connect deadline as a [`Duration`].
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Handshake deadline as a [`Duration`].
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Default request timeout as a [`Duration`].
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Log output settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Topic pub/sub settings.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AmopSettings {
    /// Topics subscribed at startup.
    pub topics: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn transport_defaults() {
        let t = TransportSettings::default();
        assert_eq!(t.reconnect_period(), Duration::from_secs(10));
        assert_eq!(t.connect_timeout(), Duration::from_secs(10));
        assert_eq!(t.handshake_timeout(), Duration::from_secs(10));
        assert_eq!(t.request_timeout(), Duration::from_secs(30));
        assert_eq!(t.max_message_size, 104_857_600);
    }

    #[test]
    fn endpoints_dedupe_and_keep_order() {
        let t = TransportSettings {
            peers: vec![
                "127.0.0.1:20201".into(),
                "127.0.0.1:20200".into(),
                "127.0.0.1:20201".into(),
            ],
            ..TransportSettings::default()
        };
        let eps = t.endpoints().unwrap();
        let keys: Vec<String> = eps.iter().map(Endpoint::key).collect();
        assert_eq!(keys, vec!["127.0.0.1:20201", "127.0.0.1:20200"]);
    }

    #[test]
    fn endpoints_reject_invalid_peer() {
        let t = TransportSettings {
            peers: vec!["bad".into()],
            ..TransportSettings::default()
        };
        assert_matches!(t.endpoints(), Err(SettingsError::Peer(_)));
    }

    #[test]
    fn validate_rejects_zero_period() {
        let mut s = BcosSettings::default();
        s.transport.reconnect_period_ms = 0;
        assert_matches!(s.validate(), Err(SettingsError::InvalidValue(_)));
    }

    #[test]
    fn validate_rejects_empty_topic() {
        let mut s = BcosSettings::default();
        s.amop.topics = vec![String::new()];
        assert_matches!(s.validate(), Err(SettingsError::InvalidValue(_)));
    }

    #[test]
    fn serde_uses_camel_case() {
        let json = serde_json::to_value(BcosSettings::default()).unwrap();
        assert_eq!(json["transport"]["reconnectPeriodMs"], 10_000);
        assert_eq!(json["transport"]["maxMessageSize"], 104_857_600);
        assert_eq!(json["logging"]["level"], "info");
    }

    #[test]
    fn partial_json_fills_defaults() {
        let s: BcosSettings =
            serde_json::from_str(r#"{"transport": {"peers": ["10.0.0.1:20200"]}}"#).unwrap();
        assert_eq!(s.transport.peers, vec!["10.0.0.1:20200".to_string()]);
        assert_eq!(s.transport.request_timeout_ms, 30_000);
        assert!(!s.logging.json);
    }
}
