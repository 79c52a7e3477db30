use serde::Deserialize;
use std::time::Duration;

use crate::error::Result;

/// Top level server configuration. Read once at startup.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FanoutConfig {
    pub http: HttpConfig,
    pub webrtc: WebRtcConfig,
    pub relay: RelayConfig,
    pub stats: StatsConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub bind_address: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:7000".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WebRtcConfig {
    /// `[start, end]` for ICE UDP candidates, empty for ephemeral ports
    pub ice_port_range: Vec<u16>,
    pub ice_servers: Vec<IceServerConfig>,
}

impl WebRtcConfig {
    pub fn port_range(&self) -> Option<(u16, u16)> {
        match self.ice_port_range.as_slice() {
            [start, end] if *start != 0 || *end != 0 => Some((*start, *end)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Relay listen port, `0` disables the relay listener
    pub port: u16,
    /// Identifies this node in relay handshakes
    pub node_id: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: 0,
            node_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    pub interval_secs: u64,
    /// Routers with at least this many subscribers only report a count
    pub max_listed_subscribers: usize,
}

impl StatsConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            interval_secs: 3,
            max_listed_subscribers: 6,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "fanout_server=info,tower_http=info".to_string(),
        }
    }
}

impl FanoutConfig {
    /// Load from an optional `fanout.toml` and `FANOUT__*` environment
    /// variables, e.g. `FANOUT__RELAY__PORT=5558`.
    pub fn load() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            tracing::debug!("No .env file loaded: {}", e);
        }

        let settings = config::Config::builder()
            .add_source(config::File::with_name("fanout").required(false))
            .add_source(
                config::Environment::with_prefix("FANOUT")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_disable_relay_listener() {
        let config = FanoutConfig::default();
        assert_eq!(config.relay.port, 0);
        assert!(!config.relay.node_id.is_empty());
        assert_eq!(config.stats.max_listed_subscribers, 6);
        assert_eq!(config.stats.interval(), Duration::from_secs(3));
    }

    #[test]
    fn test_port_range_requires_two_bounds() {
        let mut webrtc = WebRtcConfig::default();
        assert_eq!(webrtc.port_range(), None);

        webrtc.ice_port_range = vec![50000];
        assert_eq!(webrtc.port_range(), None);

        webrtc.ice_port_range = vec![50000, 60000];
        assert_eq!(webrtc.port_range(), Some((50000, 60000)));
    }

    #[test]
    fn test_deserialize_partial_document() {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(
                r#"
                [relay]
                port = 5558

                [[webrtc.ice_servers]]
                urls = ["stun:stun.l.google.com:19302"]
                "#,
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap();

        let config: FanoutConfig = settings.try_deserialize().unwrap();
        assert_eq!(config.relay.port, 5558);
        assert_eq!(config.webrtc.ice_servers.len(), 1);
        assert!(config.webrtc.ice_servers[0].username.is_empty());
        assert_eq!(config.http.bind_address, "0.0.0.0:7000");
    }
}
