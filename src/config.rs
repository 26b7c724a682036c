//! Application configuration.
//!
//! Loaded from a TOML file; every field has a default so a missing file or a
//! partial file is fine.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// Environment variable pointing at the configuration file.
pub const CONFIG_ENV: &str = "WEBRTC_ROOMS_CONFIG";
const DEFAULT_CONFIG_FILE: &str = "webrtc-rooms.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub store: StoreConfig,
    pub peer: PeerConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSection {
    /// Origin used to build shareable room links.
    pub origin: String,
    /// File holding values that survive across visits (the display name).
    pub storage_path: PathBuf,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            origin: "https://rooms.local".to_string(),
            storage_path: PathBuf::from("webrtc-rooms-storage.json"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Relay endpoint. `None` runs against the in-process store.
    pub url: Option<String>,
    pub rooms_collection: String,
    pub presence_collection: String,
    pub disconnect_collection: String,
    pub stop_collection: String,
    pub request_timeout_ms: u64,
    pub write_attempts: u32,
    pub retry_backoff_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: None,
            rooms_collection: "calls".to_string(),
            presence_collection: "presence".to_string(),
            disconnect_collection: "disconnects".to_string(),
            stop_collection: "stopped".to_string(),
            request_timeout_ms: 5_000,
            write_attempts: 3,
            retry_backoff_ms: 250,
        }
    }
}

impl StoreConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    /// PeerJS-compatible broker, e.g. `ws://127.0.0.1:9000/`.
    pub broker_url: String,
    pub broker_key: String,
    pub ice_servers: Vec<String>,
    pub heartbeat_interval_ms: u64,
    pub open_timeout_ms: u64,
    pub call_timeout_ms: u64,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            broker_url: "ws://127.0.0.1:9000/".to_string(),
            broker_key: "peerjs".to_string(),
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            heartbeat_interval_ms: 5_000,
            open_timeout_ms: 10_000,
            call_timeout_ms: 30_000,
        }
    }
}

impl PeerConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

impl AppConfig {
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| AppError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads `path`, falling back to defaults when the file does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::from_toml(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no config file, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Loads from `$WEBRTC_ROOMS_CONFIG` or `./webrtc-rooms.toml`.
    pub fn load() -> Result<Self> {
        let path = std::env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
        Self::load_from(&path)
    }

    fn validate(&self) -> Result<()> {
        if self.store.write_attempts == 0 {
            return Err(AppError::Config("store.write_attempts must be at least 1".to_string()));
        }
        let names = [
            &self.store.rooms_collection,
            &self.store.presence_collection,
            &self.store.disconnect_collection,
            &self.store.stop_collection,
        ];
        if let Some(bad) = names.iter().find(|n| n.is_empty() || n.contains('/')) {
            return Err(AppError::Config(format!("invalid collection name {:?}", bad)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let config = AppConfig::from_toml(
            r#"
            [store]
            url = "ws://relay:8787"
            write_attempts = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.store.url.as_deref(), Some("ws://relay:8787"));
        assert_eq!(config.store.write_attempts, 5);
        assert_eq!(config.store.rooms_collection, "calls");
        assert_eq!(config.peer, PeerConfig::default());
    }

    #[test]
    fn rejects_zero_attempts() {
        let err = AppConfig::from_toml("[store]\nwrite_attempts = 0\n").unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }

    #[test]
    fn rejects_nested_collection_names() {
        let err = AppConfig::from_toml("[store]\npresence_collection = \"a/b\"\n").unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }

    #[test]
    fn missing_file_gives_defaults() {
        let config = AppConfig::load_from(Path::new("/definitely/not/here.toml")).unwrap();
        assert_eq!(config, AppConfig::default());
    }
}
