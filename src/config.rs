//! Store and mirror configuration parsed from environment variables.

use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_DATA_DIR: &str = "./truespeed-data";
pub const DEFAULT_KEY_ENV: &str = "TRUESPEED_MIRROR_KEY";
pub const DEFAULT_CHANNEL_POLL_MS: u64 = 250;
pub const DEFAULT_REFRESH_SECS: u64 = 30;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 15;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_MIRROR_BIND: &str = "127.0.0.1:4100";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A configuration value could not be parsed.
    #[error("config parse failed: {0}")]
    Parse(String),

    /// The mirror is enabled but its access key variable is not set.
    #[error("missing mirror access key: env var {var} not set")]
    MissingKey { var: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// JSON-lines log in the data directory; reaches other processes.
    File,
    /// In-process broadcast only.
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MirrorTimeouts {
    pub request_secs: u64,
    pub connect_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorConfig {
    /// Blob URL, e.g. `https://api.jsonbin.io/v3/b/<bin>`. No trailing slash.
    pub url: String,
    pub api_key: String,
    pub timeouts: MirrorTimeouts,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub data_dir: PathBuf,
    pub channel: ChannelKind,
    pub channel_poll: Duration,
    /// `None` runs the store local-only.
    pub mirror: Option<MirrorConfig>,
    pub refresh_interval: Duration,
}

impl StoreConfig {
    /// Build typed store config from environment variables.
    ///
    /// Optional:
    /// - `TRUESPEED_DATA_DIR`: default `./truespeed-data`
    /// - `TRUESPEED_CHANNEL`: `file` (default) or `memory`
    /// - `TRUESPEED_CHANNEL_POLL_MS`: default 250, at least 1
    /// - `TRUESPEED_MIRROR_URL`: enables the remote mirror
    /// - `TRUESPEED_MIRROR_KEY_ENV`: names the env var holding the access
    ///   key, default `TRUESPEED_MIRROR_KEY`
    /// - `TRUESPEED_REFRESH_SECS`: default 30, at least 1
    /// - `TRUESPEED_REQUEST_TIMEOUT_SECS`: default 15
    /// - `TRUESPEED_CONNECT_TIMEOUT_SECS`: default 5
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for an unknown channel kind or a mirror URL
    /// without an access key.
    pub fn from_env() -> Result<Self, ConfigError> {
        let data_dir = std::env::var("TRUESPEED_DATA_DIR").unwrap_or_else(|_| DEFAULT_DATA_DIR.into());
        let channel = parse_channel(std::env::var("TRUESPEED_CHANNEL").ok().as_deref())?;
        let channel_poll = Duration::from_millis(env_parse("TRUESPEED_CHANNEL_POLL_MS", DEFAULT_CHANNEL_POLL_MS).max(1));
        let refresh_interval = Duration::from_secs(env_parse("TRUESPEED_REFRESH_SECS", DEFAULT_REFRESH_SECS).max(1));

        let mirror = match std::env::var("TRUESPEED_MIRROR_URL") {
            Ok(url) if !url.trim().is_empty() => Some(MirrorConfig {
                url: url.trim().trim_end_matches('/').to_string(),
                api_key: mirror_key()?,
                timeouts: MirrorTimeouts {
                    request_secs: env_parse("TRUESPEED_REQUEST_TIMEOUT_SECS", DEFAULT_REQUEST_TIMEOUT_SECS),
                    connect_secs: env_parse("TRUESPEED_CONNECT_TIMEOUT_SECS", DEFAULT_CONNECT_TIMEOUT_SECS),
                },
            }),
            _ => None,
        };

        Ok(Self { data_dir: PathBuf::from(data_dir), channel, channel_poll, mirror, refresh_interval })
    }
}

/// Settings for the self-hosted mirror server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub bind: String,
    pub api_key: String,
    /// JSON file the bins are persisted to; in-memory only when `None`.
    pub file: Option<PathBuf>,
}

impl ServerConfig {
    /// Build mirror server config from environment variables.
    ///
    /// - `TRUESPEED_MIRROR_BIND`: default `127.0.0.1:4100`
    /// - `TRUESPEED_MIRROR_FILE`: optional persistence file
    /// - access key resolved as in [`StoreConfig::from_env`]
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingKey`] when no access key is set.
    pub fn from_env() -> Result<Self, ConfigError> {
        let bind = std::env::var("TRUESPEED_MIRROR_BIND").unwrap_or_else(|_| DEFAULT_MIRROR_BIND.into());
        let file = std::env::var("TRUESPEED_MIRROR_FILE")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);
        Ok(Self { bind, api_key: mirror_key()?, file })
    }
}

fn mirror_key() -> Result<String, ConfigError> {
    let key_var = std::env::var("TRUESPEED_MIRROR_KEY_ENV").unwrap_or_else(|_| DEFAULT_KEY_ENV.into());
    match std::env::var(&key_var) {
        Ok(key) if !key.is_empty() => Ok(key),
        _ => Err(ConfigError::MissingKey { var: key_var }),
    }
}

pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn parse_channel(raw: Option<&str>) -> Result<ChannelKind, ConfigError> {
    match raw.unwrap_or("file") {
        "file" => Ok(ChannelKind::File),
        "memory" => Ok(ChannelKind::Memory),
        other => Err(ConfigError::Parse(format!(
            "unsupported TRUESPEED_CHANNEL '{other}' (expected 'file' or 'memory')"
        ))),
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
