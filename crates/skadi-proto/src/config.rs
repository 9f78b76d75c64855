use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

use super::platform;
use super::protocol::LOCK_PORT;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub player: PlayerConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub channels: ChannelsConfig,
    #[serde(default)]
    pub version: VersionConfig,
}

/// External stream player invocation.
///
/// The player is started as `executable args... <channel url> <quality>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerConfig {
    #[serde(default = "default_executable")]
    pub executable: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Base of the channel page URL; the channel name is appended.
    #[serde(default = "default_channel_url_base")]
    pub channel_url_base: String,
}

/// Remote platform endpoints used to resolve stream qualities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_usher_base")]
    pub usher_base: String,
    /// Sent as `Client-ID` when set.
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    #[serde(default = "default_lock_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_enabled")]
    pub enabled: bool,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Channels tracked at start-up.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChannelsConfig {
    #[serde(default)]
    pub tracked: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionConfig {
    #[serde(default = "default_check_enabled")]
    pub check_enabled: bool,
    /// Releases API endpoint returning the latest release as JSON.
    #[serde(default = "default_releases_url")]
    pub releases_url: String,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            executable: default_executable(),
            args: Vec::new(),
            channel_url_base: default_channel_url_base(),
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            usher_base: default_usher_base(),
            client_id: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            port: default_lock_port(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: default_http_enabled(),
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

impl Default for VersionConfig {
    fn default() -> Self {
        Self {
            check_enabled: default_check_enabled(),
            releases_url: default_releases_url(),
        }
    }
}

fn default_executable() -> String {
    "streamlink".to_string()
}

fn default_channel_url_base() -> String {
    "https://www.twitch.tv".to_string()
}

fn default_api_base() -> String {
    "https://api.twitch.tv".to_string()
}

fn default_usher_base() -> String {
    "https://usher.ttvnw.net".to_string()
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_lock_port() -> u16 {
    LOCK_PORT
}

fn default_http_enabled() -> bool {
    true
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8989
}

fn default_check_enabled() -> bool {
    true
}

fn default_releases_url() -> String {
    "https://api.github.com/repos/s1mpl3x/skadi/releases/latest".to_string()
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load from `path`, writing the defaults there first if it does not exist.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            let config = Self::default();
            info!("No config at {:?}, writing defaults", path);
            config.save_to(path)?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join(platform::CONFIG_FILE)
    }
}
