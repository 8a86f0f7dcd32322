use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_URI: &str = "http://127.0.0.1:5984";

/// Default recursion limit for nested `!code` includes.
pub const DEFAULT_MAX_INCLUDE_DEPTH: usize = 16;

/// Client configuration, usually read from a `couchkit.yaml` file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_uri")]
    pub uri: String,
    /// Request timeout. `None` leaves requests unbounded, which continuous
    /// change feeds rely on.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default = "default_max_include_depth")]
    pub max_include_depth: usize,
    /// Heartbeat interval (ms) requested on long-poll and continuous feeds
    #[serde(default)]
    pub heartbeat: Option<u64>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            uri: default_uri(),
            timeout_secs: None,
            max_include_depth: default_max_include_depth(),
            heartbeat: None,
        }
    }
}

impl ClientConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

fn default_uri() -> String {
    DEFAULT_URI.to_string()
}

fn default_max_include_depth() -> usize {
    DEFAULT_MAX_INCLUDE_DEPTH
}

/// Parse a config file into a ClientConfig
pub fn parse_config(path: &Path) -> Result<ClientConfig> {
    let content = std::fs::read_to_string(path)?;
    parse_config_str(&content)
}

/// Parse a config YAML string into a ClientConfig
pub fn parse_config_str(content: &str) -> Result<ClientConfig> {
    let config: ClientConfig = serde_yaml::from_str(content)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_for_empty_mapping() {
        let config = parse_config_str("{}").unwrap();
        assert_eq!(config.uri, DEFAULT_URI);
        assert_eq!(config.max_include_depth, DEFAULT_MAX_INCLUDE_DEPTH);
        assert!(config.timeout().is_none());
    }

    #[test]
    fn test_overrides() {
        let config = parse_config_str(
            "uri: http://couch.local:5984\ntimeout_secs: 30\nmax_include_depth: 4\nheartbeat: 10000\n",
        )
        .unwrap();
        assert_eq!(config.uri, "http://couch.local:5984");
        assert_eq!(config.timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.max_include_depth, 4);
        assert_eq!(config.heartbeat, Some(10000));
    }

    #[test]
    fn test_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("couchkit.yaml");
        std::fs::write(&path, "uri: http://example.org:5984\n").unwrap();
        let config = parse_config(&path).unwrap();
        assert_eq!(config.uri, "http://example.org:5984");
    }
}
