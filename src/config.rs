use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub listener: ListenerConfig,
    #[serde(default)]
    pub stability: StabilityConfig,
    #[serde(default)]
    pub files: FilesConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TransportConfig {
    /// Base URL of the browser-automation sidecar.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DispatchConfig {
    #[serde(default = "default_command_prefix")]
    pub command_prefix: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ListenerConfig {
    /// How many latest messages to scrape per poll.
    #[serde(default = "default_fetch_limit")]
    pub fetch_limit: usize,
    /// Download file/image attachments automatically.
    #[serde(default = "default_true")]
    pub auto_download: bool,
    /// Store downloads under a per-day subdirectory.
    #[serde(default = "default_true")]
    pub file_date_subdir: bool,
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StabilityConfig {
    /// Seconds between liveness checks.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// Seconds to wait before a reconnect attempt.
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
    /// Cap before giving up on automatic reconnection.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FilesConfig {
    /// 0 disables the cleanup loop; >0 enables hourly sweeps removing files
    /// older than N days.
    #[serde(default)]
    pub retention_days: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub database_path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

fn default_base_url() -> String {
    "http://127.0.0.1:8000".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_command_prefix() -> String {
    "/".to_string()
}

fn default_fetch_limit() -> usize {
    12
}

fn default_true() -> bool {
    true
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("downloads")
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_reconnect_delay() -> u64 {
    5
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_db_path() -> PathBuf {
    PathBuf::from("relaybot.db")
}

fn default_bind_addr() -> String {
    "127.0.0.1:8720".to_string()
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            command_prefix: default_command_prefix(),
        }
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            fetch_limit: default_fetch_limit(),
            auto_download: true,
            file_date_subdir: true,
            download_dir: default_download_dir(),
        }
    }
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval(),
            reconnect_delay_secs: default_reconnect_delay(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
        }
    }
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self { retention_days: 0 }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_db_path(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            dispatch: DispatchConfig::default(),
            listener: ListenerConfig::default(),
            stability: StabilityConfig::default(),
            files: FilesConfig::default(),
            storage: StorageConfig::default(),
            api: ApiConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        if !config.listener.download_dir.exists() {
            std::fs::create_dir_all(&config.listener.download_dir).with_context(|| {
                format!(
                    "Failed to create download directory: {}",
                    config.listener.download_dir.display()
                )
            })?;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.transport.base_url, "http://127.0.0.1:8000");
        assert_eq!(config.dispatch.command_prefix, "/");
        assert_eq!(config.listener.fetch_limit, 12);
        assert!(config.listener.auto_download);
        assert_eq!(config.stability.heartbeat_interval_secs, 30);
        assert_eq!(config.stability.max_reconnect_attempts, 10);
        assert_eq!(config.files.retention_days, 0);
    }

    #[test]
    fn sections_override_defaults() {
        let config: Config = toml::from_str(
            r#"
            [transport]
            base_url = "http://sidecar:9000/"

            [listener]
            auto_download = false
            fetch_limit = 5

            [stability]
            max_reconnect_attempts = 3

            [files]
            retention_days = 14
            "#,
        )
        .unwrap();
        assert_eq!(config.transport.base_url, "http://sidecar:9000/");
        assert!(!config.listener.auto_download);
        assert_eq!(config.listener.fetch_limit, 5);
        assert_eq!(config.stability.max_reconnect_attempts, 3);
        assert_eq!(config.files.retention_days, 14);
        // Untouched sections keep their defaults.
        assert_eq!(config.stability.reconnect_delay_secs, 5);
    }
}
