//! Connection configuration and chain group membership.
//!
//! The tunables here were historically hardcoded: the auto-connect interval,
//! the connect timeout, the flapping threshold and the call proxy depth. They
//! are deployment-specific, so they live in a serde-loadable config with
//! defaults matching the previous constants.
//!
//! With the `persistence` feature the config can be loaded from and saved to
//! `config.json` in the platform config directory.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[cfg(feature = "persistence")]
use std::fs;
#[cfg(feature = "persistence")]
use std::path::{Path, PathBuf};

/// Configuration error type.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// JSON serialization/deserialization error.
    #[cfg(feature = "persistence")]
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    /// Other configuration error.
    #[error("{0}")]
    Other(String),
}

/// Interval between socket reconnect attempts.
pub const API_AUTO_CONNECT_MS: u64 = 3_000;
/// Upper bound on a single socket connect attempt.
pub const API_CONNECT_TIMEOUT_MS: u64 = 30_000;
/// Consecutive disconnects tolerated before a connection is declared unstable.
pub const DEFAULT_MAX_RETRIES: u32 = 9;
/// Factory invocation plus two chained accesses.
pub const DEFAULT_PROXY_DEPTH: usize = 3;
/// URL scheme prefix selecting the embedded light client.
pub const LIGHT_CLIENT_PREFIX: &str = "light://";

/// A named family of chains sharing non-default backend options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChainGroup {
    Acala,
    Turing,
    Avail,
    Goldberg,
}

impl ChainGroup {
    /// Groups in resolution order: the first group containing a slug wins.
    pub fn all() -> &'static [ChainGroup] {
        &[
            ChainGroup::Acala,
            ChainGroup::Turing,
            ChainGroup::Avail,
            ChainGroup::Goldberg,
        ]
    }

    pub fn label(&self) -> &'static str {
        match self {
            ChainGroup::Acala => "acala",
            ChainGroup::Turing => "turing",
            ChainGroup::Avail => "avail",
            ChainGroup::Goldberg => "goldberg",
        }
    }
}

impl std::fmt::Display for ChainGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Static membership table from chain group to chain slugs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainGroups {
    pub acala: Vec<String>,
    pub turing: Vec<String>,
    pub avail: Vec<String>,
    pub goldberg: Vec<String>,
}

impl Default for ChainGroups {
    fn default() -> Self {
        fn slugs(list: &[&str]) -> Vec<String> {
            list.iter().map(|s| s.to_string()).collect()
        }

        Self {
            acala: slugs(&["acala", "karura", "origintrail", "kintsugi"]),
            turing: slugs(&["turingStaging", "turing"]),
            avail: slugs(&["kate", "goldberg_testnet"]),
            goldberg: slugs(&["goldberg_testnet"]),
        }
    }
}

impl ChainGroups {
    pub fn members(&self, group: ChainGroup) -> &[String] {
        match group {
            ChainGroup::Acala => &self.acala,
            ChainGroup::Turing => &self.turing,
            ChainGroup::Avail => &self.avail,
            ChainGroup::Goldberg => &self.goldberg,
        }
    }

    /// The group a chain belongs to, if any.
    pub fn group_of(&self, chain_slug: &str) -> Option<ChainGroup> {
        ChainGroup::all()
            .iter()
            .copied()
            .find(|group| self.members(*group).iter().any(|s| s == chain_slug))
    }
}

/// Tunables for a chain connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Delay between socket reconnect attempts. Zero disables auto-reconnect.
    pub auto_connect_ms: u64,
    /// Upper bound on a single connect attempt.
    pub connect_timeout_ms: u64,
    /// Consecutive disconnects tolerated before the connection turns unstable.
    pub max_retries: u32,
    /// Depth at which a call proxy chain resolves.
    pub proxy_depth: usize,
    /// URL prefix selecting the light client transport.
    pub light_client_prefix: String,
    pub chain_groups: ChainGroups,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            auto_connect_ms: API_AUTO_CONNECT_MS,
            connect_timeout_ms: API_CONNECT_TIMEOUT_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            proxy_depth: DEFAULT_PROXY_DEPTH,
            light_client_prefix: LIGHT_CLIENT_PREFIX.to_string(),
            chain_groups: ChainGroups::default(),
        }
    }
}

impl ConnectionConfig {
    pub fn auto_connect(&self) -> Duration {
        Duration::from_millis(self.auto_connect_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn is_light_client_url(&self, url: &str) -> bool {
        url.starts_with(&self.light_client_prefix)
    }
}

// ==================== Config I/O ====================

/// Get the config directory.
#[cfg(feature = "persistence")]
pub fn get_config_dir() -> Result<PathBuf, ConfigError> {
    directories::ProjectDirs::from("io", "chainconn", "chainconn")
        .map(|dirs| dirs.config_dir().to_path_buf())
        .ok_or_else(|| ConfigError::Other("Could not determine config directory".to_string()))
}

/// Get the config file path.
#[cfg(feature = "persistence")]
pub fn get_config_path() -> Result<PathBuf, ConfigError> {
    get_config_dir().map(|dir| dir.join("config.json"))
}

/// Load configuration from the default location.
#[cfg(feature = "persistence")]
pub fn load_config() -> Result<ConnectionConfig, ConfigError> {
    load_config_from(&get_config_path()?)
}

/// Load configuration from `path`.
///
/// A missing file yields the defaults. A file that fails to parse is copied
/// aside and the defaults are returned.
#[cfg(feature = "persistence")]
pub fn load_config_from(path: &Path) -> Result<ConnectionConfig, ConfigError> {
    if !path.exists() {
        return Ok(ConnectionConfig::default());
    }

    let content = fs::read_to_string(path)?;
    match serde_json::from_str(&content) {
        Ok(config) => Ok(config),
        Err(_) => {
            backup_corrupted_config(path)?;
            Ok(ConnectionConfig::default())
        }
    }
}

/// Save configuration to the default location.
#[cfg(feature = "persistence")]
pub fn save_config(config: &ConnectionConfig) -> Result<(), ConfigError> {
    save_config_to(config, &get_config_path()?)
}

#[cfg(feature = "persistence")]
pub fn save_config_to(config: &ConnectionConfig, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let content = serde_json::to_string_pretty(config)?;
    fs::write(path, content)?;
    Ok(())
}

/// Backup a corrupted config file for debugging.
#[cfg(feature = "persistence")]
pub fn backup_corrupted_config(path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        let stamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let backup_path = parent.join(format!("config.backup.{}", stamp));
        fs::copy(path, &backup_path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_config_default() {
        let config = ConnectionConfig::default();
        assert_eq!(config.auto_connect(), Duration::from_millis(3_000));
        assert_eq!(config.connect_timeout(), Duration::from_millis(30_000));
        assert_eq!(config.max_retries, 9);
        assert_eq!(config.proxy_depth, 3);
        assert_eq!(config.light_client_prefix, "light://");
    }

    #[test]
    fn test_light_client_url_detection() {
        let config = ConnectionConfig::default();
        assert!(config.is_light_client_url("light://substrate-connect/polkadot"));
        assert!(!config.is_light_client_url("wss://rpc.polkadot.io"));
    }

    #[test]
    fn test_chain_group_lookup() {
        let groups = ChainGroups::default();
        assert_eq!(groups.group_of("karura"), Some(ChainGroup::Acala));
        assert_eq!(groups.group_of("turing"), Some(ChainGroup::Turing));
        assert_eq!(groups.group_of("kate"), Some(ChainGroup::Avail));
        assert_eq!(groups.group_of("polkadot"), None);
    }

    #[test]
    fn test_chain_group_first_match_wins() {
        // goldberg_testnet is listed under both avail and goldberg
        let groups = ChainGroups::default();
        assert_eq!(groups.group_of("goldberg_testnet"), Some(ChainGroup::Avail));
    }

    #[test]
    fn test_config_deserialize_missing_fields() {
        let json = r#"{"max_retries": 4}"#;
        let config: ConnectionConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.max_retries, 4);
        assert_eq!(config.auto_connect_ms, API_AUTO_CONNECT_MS);
        assert_eq!(config.chain_groups, ChainGroups::default());
    }

    #[test]
    fn test_config_custom_groups() {
        let json = r#"{"chain_groups": {"avail": ["my_avail"]}}"#;
        let config: ConnectionConfig = serde_json::from_str(json).unwrap();
        assert_eq!(
            config.chain_groups.group_of("my_avail"),
            Some(ChainGroup::Avail)
        );
        // Unlisted groups keep their defaults
        assert_eq!(
            config.chain_groups.group_of("acala"),
            Some(ChainGroup::Acala)
        );
    }

    #[cfg(feature = "persistence")]
    #[test]
    fn test_config_save_and_load() {
        let dir = std::env::temp_dir().join(format!("chainconn-test-{}", std::process::id()));
        let path = dir.join("config.json");

        let config = ConnectionConfig {
            max_retries: 3,
            ..Default::default()
        };
        save_config_to(&config, &path).unwrap();
        let loaded = load_config_from(&path).unwrap();
        assert_eq!(loaded, config);

        let _ = fs::remove_dir_all(&dir);
    }

    #[cfg(feature = "persistence")]
    #[test]
    fn test_corrupted_config_falls_back_to_defaults() {
        let dir = std::env::temp_dir().join(format!("chainconn-corrupt-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.json");
        fs::write(&path, "{ not json").unwrap();

        let loaded = load_config_from(&path).unwrap();
        assert_eq!(loaded, ConnectionConfig::default());

        let _ = fs::remove_dir_all(&dir);
    }

    #[cfg(feature = "persistence")]
    #[test]
    fn test_get_config_path() {
        let result = get_config_path();
        assert!(result.is_ok());
        assert!(result.unwrap().to_string_lossy().contains("config.json"));
    }
}
