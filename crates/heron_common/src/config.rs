use serde::{Deserialize, Serialize};

/// Top-level proxy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeronConfig {
    /// Upstream monitoring backends to federate.
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Default for HeronConfig {
    fn default() -> Self {
        Self {
            peers: Vec::new(),
            query: QueryConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

/// One upstream peer entry in heron.toml.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Stable backend id used in Backends: headers and the failed map.
    pub id: String,
    /// Human readable site name.
    pub name: String,
    /// Livestatus address of the remote site (host:port or unix socket).
    pub addr: String,
    /// Skip this peer on startup.
    #[serde(default)]
    pub disabled: bool,
}

/// Query pipeline tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Per-request deadline in milliseconds (0 = no deadline).
    #[serde(default)]
    pub deadline_ms: u64,
    /// Timeout for passthrough queries to a remote site in milliseconds.
    #[serde(default = "default_passthrough_timeout_ms")]
    pub passthrough_timeout_ms: u64,
}

fn default_passthrough_timeout_ms() -> u64 {
    60_000
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            deadline_ms: 0,
            passthrough_timeout_ms: default_passthrough_timeout_ms(),
        }
    }
}

/// Logging and metrics endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Prometheus metrics listen address, empty disables the exporter.
    #[serde(default)]
    pub metrics_listen_addr: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics_listen_addr: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = HeronConfig::default();
        assert!(cfg.peers.is_empty());
        assert_eq!(cfg.query.deadline_ms, 0);
        assert_eq!(cfg.query.passthrough_timeout_ms, 60_000);
    }

    #[test]
    fn test_deserialize_minimal() {
        let cfg: HeronConfig = serde_json::from_str(
            r#"{"peers":[{"id":"site1","name":"Site One","addr":"10.0.0.1:6557"}]}"#,
        )
        .unwrap();
        assert_eq!(cfg.peers.len(), 1);
        assert_eq!(cfg.peers[0].id, "site1");
        assert!(!cfg.peers[0].disabled);
        assert_eq!(cfg.query.passthrough_timeout_ms, 60_000);
    }
}
