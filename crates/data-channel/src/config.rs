//! Negotiation settings.
//!
//! Loaded from a JSON file; every field is optional and falls back to the
//! defaults below.

use std::path::{Path, PathBuf};
use std::time::Duration;

use peerxfer_protocol::{Method, Streamhost};
use peerxfer_transfer::DEFAULT_CHUNK_SIZE;
use serde::{Deserialize, Serialize};

use crate::error::DataChannelError;
use crate::{DEFAULT_BLOCK_SIZE, IN_BAND_TIMEOUT, RELAY_LIVENESS_TIMEOUT, STREAMHOST_CONNECT_TIMEOUT};

/// Publicly reachable address of a forwarder in front of the local relay
/// listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayEndpoint {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NegotiationConfig {
    /// Transport tiers this side supports.
    pub methods: Vec<Method>,

    /// Offer a SOCKS5 streamhost listening on this machine.
    pub local_streamhost: bool,

    /// Host local listeners bind to.
    pub listen_host: String,

    /// Address advertised instead of the bound one (static port mapping).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_host: Option<String>,

    /// Proxy streamhosts offered after the local one.
    pub proxies: Vec<Streamhost>,

    /// Port the relay listener binds to; 0 picks an ephemeral port.
    pub relay_listen_port: u16,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub relay: Option<RelayEndpoint>,

    pub connect_timeout_secs: u64,
    pub relay_liveness_secs: u64,
    pub in_band_timeout_secs: u64,

    /// How long to wait for the peer's reply to a negotiation message.
    pub negotiation_timeout_secs: u64,

    pub block_size: u16,
    pub chunk_size: usize,

    /// Incoming offers are accepted into this directory without asking.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_dir: Option<PathBuf>,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            methods: Method::FALLBACK_ORDER.to_vec(),
            local_streamhost: true,
            listen_host: "0.0.0.0".into(),
            public_host: None,
            proxies: Vec::new(),
            relay_listen_port: 0,
            relay: None,
            connect_timeout_secs: STREAMHOST_CONNECT_TIMEOUT.as_secs(),
            relay_liveness_secs: RELAY_LIVENESS_TIMEOUT.as_secs(),
            in_band_timeout_secs: IN_BAND_TIMEOUT.as_secs(),
            negotiation_timeout_secs: 60,
            block_size: DEFAULT_BLOCK_SIZE,
            chunk_size: DEFAULT_CHUNK_SIZE,
            download_dir: None,
        }
    }
}

impl NegotiationConfig {
    /// Loads the configuration at `path`.
    ///
    /// A missing file yields the defaults; an unparsable one is logged and
    /// also yields the defaults.
    pub fn load(path: &Path) -> Result<Self, DataChannelError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config = match serde_json::from_str::<Self>(&content) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse negotiation config, using defaults"
                );
                return Ok(Self::default());
            }
        };
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), DataChannelError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), DataChannelError> {
        if self.block_size == 0 {
            return Err(DataChannelError::Config("blockSize must be > 0".into()));
        }
        if self.chunk_size == 0 {
            return Err(DataChannelError::Config("chunkSize must be > 0".into()));
        }
        Ok(())
    }

    pub fn supports(&self, method: Method) -> bool {
        self.methods.contains(&method)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn relay_liveness(&self) -> Duration {
        Duration::from_secs(self.relay_liveness_secs)
    }

    pub fn in_band_timeout(&self) -> Duration {
        Duration::from_secs(self.in_band_timeout_secs)
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_secs(self.negotiation_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = NegotiationConfig::default();
        assert_eq!(config.methods, Method::FALLBACK_ORDER.to_vec());
        assert_eq!(config.connect_timeout(), Duration::from_secs(15));
        assert_eq!(config.relay_liveness(), Duration::from_secs(30));
        assert_eq!(config.in_band_timeout(), Duration::from_secs(30));
        assert_eq!(config.block_size, 4096);
        assert_eq!(config.chunk_size, 8192);
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = NegotiationConfig::load(&dir.path().join("nope.json")).unwrap();
        assert_eq!(config, NegotiationConfig::default());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"methods":["in-band"],"blockSize":1024,"relay":{"host":"relay.example.com","port":443}}"#,
        )
        .unwrap();
        let config = NegotiationConfig::load(&path).unwrap();
        assert_eq!(config.methods, vec![Method::InBand]);
        assert_eq!(config.block_size, 1024);
        assert_eq!(config.relay.unwrap().port, 443);
        assert!(config.local_streamhost);
        assert_eq!(config.connect_timeout_secs, 15);
    }

    #[test]
    fn garbage_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "not json").unwrap();
        assert_eq!(
            NegotiationConfig::load(&path).unwrap(),
            NegotiationConfig::default()
        );
    }

    #[test]
    fn zero_block_size_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"blockSize":0}"#).unwrap();
        assert!(matches!(
            NegotiationConfig::load(&path),
            Err(DataChannelError::Config(_))
        ));
    }

    #[test]
    fn save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.json");
        let config = NegotiationConfig {
            proxies: vec![Streamhost::new("proxy.example.com", "10.0.0.9", 7777)],
            download_dir: Some(PathBuf::from("/tmp/downloads")),
            ..Default::default()
        };
        config.save(&path).unwrap();
        assert_eq!(NegotiationConfig::load(&path).unwrap(), config);
    }
}
