//! Runtime configuration for the collaboration fabric

use serde::{Deserialize, Serialize};

/// Tunables for the WebSocket fabric and persistence layer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollabConfig {
    /// Liveness probe interval in seconds
    pub probe_interval_secs: u64,
    /// Address the (external) routing layer binds the WebSocket endpoint to
    pub bind_addr: String,
    /// Database connection string
    pub database_url: String,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            probe_interval_secs: 20,
            bind_addr: "127.0.0.1:8080".to_string(),
            database_url: "sqlite::memory:".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CollabConfig::default();
        assert_eq!(config.probe_interval_secs, 20);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: CollabConfig =
            serde_json::from_str(r#"{ "probe_interval_secs": 5 }"#).unwrap();
        assert_eq!(config.probe_interval_secs, 5);
        assert_eq!(config.bind_addr, "127.0.0.1:8080");
    }
}
