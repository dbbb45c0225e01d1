//! Configuration resolution for ydl-dl
//!
//! Downloader settings resolve **ENV → TOML → built-in default**; API keys
//! resolve **ENV → TOML** and are optional (missing keys degrade the
//! services that need them instead of refusing to start).

use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use ydl_common::config::TomlConfig;
use ydl_common::{Error, Result};

use crate::models::AudioQuality;

/// How batch work units are executed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Run to completion inside the submitting call
    Inline,
    /// Detached tokio tasks bounded by a worker count
    Worker,
    /// Channel-fed queue drained by a consumer task
    Queue,
}

impl std::str::FromStr for ExecutionMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "inline" | "sync" => Ok(ExecutionMode::Inline),
            "worker" | "thread" | "threads" => Ok(ExecutionMode::Worker),
            "queue" => Ok(ExecutionMode::Queue),
            other => Err(Error::Config(format!("Unknown execution mode: {}", other))),
        }
    }
}

/// Runtime settings of the downloader
#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    /// Longest accepted item, in minutes
    pub allowed_duration_minutes: u64,
    /// Items per part archive
    pub playlist_part_size: usize,
    /// Pause between batch items
    pub item_delay: Duration,
    /// How long a ready archive waits for pickup
    pub playlist_live_time_minutes: u64,
    /// Period of the timer hook
    pub main_timer_minutes: u64,
    /// Single-item tasks younger than this keep their files
    pub single_task_grace_seconds: u64,
    pub default_quality: AudioQuality,
    pub send_mails: bool,
    pub execution: ExecutionMode,
    pub workers: usize,
    /// Where task working directories live
    pub download_path: PathBuf,
    pub bind_address: String,
}

impl DownloaderConfig {
    /// Defaults rooted at `root_folder`
    pub fn with_root(root_folder: &Path) -> Self {
        Self {
            allowed_duration_minutes: 20,
            playlist_part_size: 10,
            item_delay: Duration::from_millis(2000),
            playlist_live_time_minutes: 60,
            main_timer_minutes: 5,
            single_task_grace_seconds: 300,
            default_quality: AudioQuality::Kbps192,
            send_mails: true,
            execution: ExecutionMode::Worker,
            workers: 2,
            download_path: root_folder.join("downloads"),
            bind_address: "127.0.0.1:5740".to_string(),
        }
    }

    /// Resolve every setting from environment, then TOML, then defaults
    pub fn resolve(root_folder: &Path, toml_config: &TomlConfig) -> Result<Self> {
        let mut config = Self::with_root(root_folder);
        let toml = &toml_config.downloads;

        if let Some(v) = env_or("YDL_ALLOWED_DURATION_MINUTES", toml.allowed_duration_minutes)? {
            config.allowed_duration_minutes = v;
        }
        if let Some(v) = env_or("YDL_PLAYLIST_PART_SIZE", toml.playlist_part_size)? {
            config.playlist_part_size = v;
        }
        if let Some(v) = env_or("YDL_ITEM_DELAY_MS", toml.item_delay_ms)? {
            config.item_delay = Duration::from_millis(v);
        }
        if let Some(v) = env_or("YDL_PLAYLIST_LIVE_TIME_MINUTES", toml.playlist_live_time_minutes)? {
            config.playlist_live_time_minutes = v;
        }
        if let Some(v) = env_or("YDL_MAIN_TIMER_MINUTES", toml.main_timer_minutes)? {
            config.main_timer_minutes = v;
        }
        if let Some(v) = env_or("YDL_SINGLE_TASK_GRACE_SECONDS", toml.single_task_grace_seconds)? {
            config.single_task_grace_seconds = v;
        }
        if let Some(v) = env_or::<u32>("YDL_DEFAULT_QUALITY", toml.default_quality)? {
            config.default_quality = AudioQuality::try_from(v)
                .map_err(|e| Error::Config(e.to_string()))?;
        }
        if let Some(v) = env_or("YDL_SEND_MAILS", toml.send_mails)? {
            config.send_mails = v;
        }
        if let Some(v) = env_or::<String>("YDL_EXECUTION", toml.execution.clone())? {
            config.execution = v.parse()?;
        }
        if let Some(v) = env_or("YDL_WORKERS", toml.workers)? {
            config.workers = v;
        }
        if let Some(v) = env_or::<PathBuf>("YDL_DOWNLOAD_PATH", toml.download_path.clone())? {
            config.download_path = v;
        }
        if let Some(v) = env_or::<String>("YDL_BIND_ADDRESS", toml.bind_address.clone())? {
            config.bind_address = v;
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.playlist_part_size == 0 {
            return Err(Error::Config("playlist_part_size must be at least 1".to_string()));
        }
        if self.workers == 0 {
            return Err(Error::Config("workers must be at least 1".to_string()));
        }
        if self.main_timer_minutes == 0 {
            return Err(Error::Config("main_timer_minutes must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Parse `name` from the environment, falling back to the TOML value
fn env_or<T>(name: &str, toml_value: Option<T>) -> Result<Option<T>>
where
    T: std::str::FromStr,
{
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| Error::Config(format!("{} has an invalid value: {}", name, raw))),
        _ => Ok(toml_value),
    }
}

/// Credentials for the remote services
#[derive(Debug, Clone, Default)]
pub struct ApiKeys {
    pub youtube_api_key: Option<String>,
    pub spotify_client_id: Option<String>,
    pub spotify_client_secret: Option<String>,
}

impl ApiKeys {
    /// Resolve every key ENV → TOML
    pub fn resolve(toml_config: &TomlConfig) -> Self {
        let keys = Self {
            youtube_api_key: resolve_key(
                "YouTube API key",
                "YDL_YOUTUBE_API_KEY",
                toml_config.youtube_api_key.as_deref(),
            ),
            spotify_client_id: resolve_key(
                "Spotify client id",
                "YDL_SPOTIFY_CLIENT_ID",
                toml_config.spotify_client_id.as_deref(),
            ),
            spotify_client_secret: resolve_key(
                "Spotify client secret",
                "YDL_SPOTIFY_CLIENT_SECRET",
                toml_config.spotify_client_secret.as_deref(),
            ),
        };

        if keys.youtube_api_key.is_none() {
            warn!("YouTube API key not configured; video lookups will fail");
        }
        if keys.spotify_credentials().is_none() {
            warn!("Spotify credentials not configured; tag repair skips that catalog");
        }

        keys
    }

    /// Both halves of the Spotify client credentials, when present
    pub fn spotify_credentials(&self) -> Option<(String, String)> {
        match (&self.spotify_client_id, &self.spotify_client_secret) {
            (Some(id), Some(secret)) => Some((id.clone(), secret.clone())),
            _ => None,
        }
    }
}

fn resolve_key(label: &str, env_name: &str, toml_value: Option<&str>) -> Option<String> {
    if let Ok(key) = std::env::var(env_name) {
        if is_valid_key(&key) {
            info!("{} loaded from environment variable", label);
            return Some(key);
        }
    }

    if let Some(key) = toml_value {
        if is_valid_key(key) {
            info!("{} loaded from TOML config", label);
            return Some(key.to_string());
        }
    }

    None
}

/// Validate API key (non-empty, non-whitespace)
pub fn is_valid_key(key: &str) -> bool {
    !key.trim().is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for name in [
            "YDL_PLAYLIST_PART_SIZE",
            "YDL_EXECUTION",
            "YDL_ITEM_DELAY_MS",
            "YDL_DEFAULT_QUALITY",
            "YDL_YOUTUBE_API_KEY",
            "YDL_SPOTIFY_CLIENT_ID",
            "YDL_SPOTIFY_CLIENT_SECRET",
        ] {
            std::env::remove_var(name);
        }
    }

    #[test]
    #[serial]
    fn test_defaults_without_overrides() {
        clear_env();
        let config = DownloaderConfig::resolve(Path::new("/srv/ydl"), &TomlConfig::default()).unwrap();
        assert_eq!(config.allowed_duration_minutes, 20);
        assert_eq!(config.playlist_part_size, 10);
        assert_eq!(config.item_delay, Duration::from_millis(2000));
        assert_eq!(config.default_quality, AudioQuality::Kbps192);
        // Batches never run inside the submitting request by default
        assert_eq!(config.execution, ExecutionMode::Worker);
        assert_eq!(config.download_path, PathBuf::from("/srv/ydl/downloads"));
    }

    #[test]
    #[serial]
    fn test_env_beats_toml() {
        clear_env();
        let mut toml = TomlConfig::default();
        toml.downloads.playlist_part_size = Some(4);
        toml.downloads.execution = Some("queue".to_string());
        std::env::set_var("YDL_PLAYLIST_PART_SIZE", "7");

        let config = DownloaderConfig::resolve(Path::new("/srv/ydl"), &toml).unwrap();
        clear_env();

        assert_eq!(config.playlist_part_size, 7);
        assert_eq!(config.execution, ExecutionMode::Queue);
    }

    #[test]
    #[serial]
    fn test_invalid_values_are_config_errors() {
        clear_env();
        std::env::set_var("YDL_DEFAULT_QUALITY", "100");
        let result = DownloaderConfig::resolve(Path::new("/srv/ydl"), &TomlConfig::default());
        clear_env();
        assert!(matches!(result, Err(Error::Config(_))));

        let mut toml = TomlConfig::default();
        toml.downloads.playlist_part_size = Some(0);
        assert!(DownloaderConfig::resolve(Path::new("/srv/ydl"), &toml).is_err());
    }

    #[test]
    #[serial]
    fn test_api_keys_env_then_toml() {
        clear_env();
        let toml = TomlConfig {
            youtube_api_key: Some("toml-key".to_string()),
            spotify_client_id: Some("id".to_string()),
            ..Default::default()
        };
        std::env::set_var("YDL_YOUTUBE_API_KEY", "env-key");

        let keys = ApiKeys::resolve(&toml);
        clear_env();

        assert_eq!(keys.youtube_api_key.as_deref(), Some("env-key"));
        assert!(keys.spotify_credentials().is_none());
    }

    #[test]
    fn test_execution_mode_parse() {
        assert_eq!("inline".parse::<ExecutionMode>().unwrap(), ExecutionMode::Inline);
        assert_eq!("Threads".parse::<ExecutionMode>().unwrap(), ExecutionMode::Worker);
        assert!("celery".parse::<ExecutionMode>().is_err());
    }

    #[test]
    fn test_is_valid_key() {
        assert!(is_valid_key("abc"));
        assert!(!is_valid_key("   "));
    }
}
