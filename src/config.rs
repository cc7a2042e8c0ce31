//! Runtime configuration
//!
//! Loaded from an optional JSON file, then overridden from the environment.
//! Every field has a default, so an empty object (or no file) is valid.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::DocumentId;

pub const ENV_DOC_ID: &str = "DRAFTSYNC_DOC_ID";
pub const ENV_REMOTE_URL: &str = "DRAFTSYNC_REMOTE_URL";
pub const ENV_RELAY_ADDR: &str = "DRAFTSYNC_RELAY_ADDR";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

/// Where and how to reach the remote relay.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub enabled: bool,
    pub base_url: String,
    /// Per-request timeout in millis
    pub timeout_ms: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "http://localhost:5000".to_string(),
            timeout_ms: 10_000,
        }
    }
}

impl RemoteConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub doc_id: DocumentId,
    pub remote: RemoteConfig,
    /// Per-topic buffer of the local bus
    pub broadcast_capacity: usize,
    /// Commands a controller buffers before broadcast deliveries are dropped
    pub queue_capacity: usize,
    /// Pull from the remote as soon as the controller starts
    pub pull_on_start: bool,
    /// Address the development relay listens on
    pub relay_addr: SocketAddr,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            doc_id: DocumentId::default(),
            remote: RemoteConfig::default(),
            broadcast_capacity: 64,
            queue_capacity: 256,
            pull_on_start: true,
            relay_addr: SocketAddr::from(([127, 0, 0, 1], 5000)),
        }
    }
}

impl SyncConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let data = std::fs::read(path)?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Load `path` if given (defaults otherwise) and apply environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => Self::from_json_file(path)?,
            None => Self::default(),
        };
        config.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from a key lookup (the environment in practice).
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(doc_id) = lookup(ENV_DOC_ID) {
            self.doc_id = DocumentId::new(doc_id);
        }
        if let Some(url) = lookup(ENV_REMOTE_URL) {
            self.remote.base_url = url;
        }
        if let Some(addr) = lookup(ENV_RELAY_ADDR) {
            self.relay_addr = addr.parse().map_err(|_| ConfigError::InvalidValue {
                key: ENV_RELAY_ADDR.to_string(),
                value: addr.clone(),
            })?;
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.doc_id.as_str(), "student");
        assert_eq!(config.remote.base_url, "http://localhost:5000");
        assert_eq!(config.remote.timeout(), Duration::from_secs(10));
        assert!(config.pull_on_start);
        assert_eq!(config.queue_capacity, 256);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"doc_id": "draft-7", "remote": {{"timeout_ms": 250}}}}"#).unwrap();

        let config = SyncConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.doc_id.as_str(), "draft-7");
        assert_eq!(config.remote.timeout_ms, 250);
        assert!(config.remote.enabled);
        assert_eq!(config.broadcast_capacity, 64);
        assert_eq!(config.queue_capacity, 256);
    }

    #[test]
    fn test_queue_capacity_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"queue_capacity": 4}}"#).unwrap();
        let config = SyncConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.queue_capacity, 4);
    }

    #[test]
    fn test_malformed_file_is_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(matches!(
            SyncConfig::from_json_file(file.path()),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_DOC_ID, "other"),
            (ENV_REMOTE_URL, "http://relay:8080"),
            (ENV_RELAY_ADDR, "0.0.0.0:8080"),
        ]
        .into_iter()
        .collect();

        let config = SyncConfig::default()
            .with_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.doc_id.as_str(), "other");
        assert_eq!(config.remote.base_url, "http://relay:8080");
        assert_eq!(config.relay_addr.port(), 8080);
    }

    #[test]
    fn test_bad_relay_addr_override() {
        let result = SyncConfig::default().with_overrides(|k| {
            (k == ENV_RELAY_ADDR).then(|| "nowhere".to_string())
        });
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }
}
