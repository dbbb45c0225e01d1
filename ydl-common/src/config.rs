//! Configuration loading and root folder resolution
//!
//! Root folder priority order:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable
//! 3. TOML config file
//! 4. OS-dependent compiled default (fallback)

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable naming the root folder
pub const ROOT_FOLDER_ENV: &str = "YDL_ROOT_FOLDER";

/// Bootstrap configuration loaded from TOML file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TomlConfig {
    /// Root folder for the database and downloaded files
    #[serde(default)]
    pub root_folder: Option<PathBuf>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Video platform metadata API key
    #[serde(default)]
    pub youtube_api_key: Option<String>,

    /// Primary music catalog client credentials
    #[serde(default)]
    pub spotify_client_id: Option<String>,
    #[serde(default)]
    pub spotify_client_secret: Option<String>,

    /// Downloader tuning (every field optional, built-in defaults apply)
    #[serde(default)]
    pub downloads: DownloadsToml,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log file path (optional, logs to stderr if not specified)
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// `[downloads]` table of the TOML file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DownloadsToml {
    pub allowed_duration_minutes: Option<u64>,
    pub playlist_part_size: Option<usize>,
    pub item_delay_ms: Option<u64>,
    pub playlist_live_time_minutes: Option<u64>,
    pub main_timer_minutes: Option<u64>,
    pub single_task_grace_seconds: Option<u64>,
    pub default_quality: Option<u32>,
    pub send_mails: Option<bool>,
    pub execution: Option<String>,
    pub workers: Option<usize>,
    pub download_path: Option<PathBuf>,
    pub bind_address: Option<String>,
}

/// Resolve the root folder: CLI, then environment, then TOML, then OS default
pub fn resolve_root_folder(
    cli_arg: Option<&str>,
    env_var_name: &str,
    toml_config: Option<&TomlConfig>,
) -> PathBuf {
    if let Some(path) = cli_arg {
        return PathBuf::from(path);
    }

    if let Ok(path) = std::env::var(env_var_name) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }

    if let Some(root) = toml_config.and_then(|c| c.root_folder.clone()) {
        return root;
    }

    default_root_folder()
}

/// Locate the configuration file for the platform
///
/// Linux tries `~/.config/ydl/config.toml` first, then `/etc/ydl/config.toml`.
pub fn config_file_path() -> Result<PathBuf> {
    let user_config = dirs::config_dir().map(|d| d.join("ydl").join("config.toml"));

    if let Some(path) = user_config {
        if path.exists() {
            return Ok(path);
        }
    }

    if cfg!(target_os = "linux") {
        let system_config = PathBuf::from("/etc/ydl/config.toml");
        if system_config.exists() {
            return Ok(system_config);
        }
    }

    Err(Error::Config("No config file found".to_string()))
}

/// Parse a TOML configuration file
pub fn load_toml_config(path: &Path) -> Result<TomlConfig> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Read {} failed: {}", path.display(), e)))?;
    toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Parse {} failed: {}", path.display(), e)))
}

/// Load the platform config file, or defaults when none exists
pub fn load_default_toml_config() -> Result<TomlConfig> {
    match config_file_path() {
        Ok(path) => load_toml_config(&path),
        Err(_) => Ok(TomlConfig::default()),
    }
}

/// Get OS-dependent default root folder path
fn default_root_folder() -> PathBuf {
    if cfg!(target_os = "linux") {
        dirs::data_local_dir()
            .map(|d| d.join("ydl"))
            .unwrap_or_else(|| PathBuf::from("/var/lib/ydl"))
    } else if cfg!(target_os = "macos") {
        dirs::data_dir()
            .map(|d| d.join("ydl"))
            .unwrap_or_else(|| PathBuf::from("/Library/Application Support/ydl"))
    } else if cfg!(target_os = "windows") {
        dirs::data_local_dir()
            .map(|d| d.join("ydl"))
            .unwrap_or_else(|| PathBuf::from("C:\\ProgramData\\ydl"))
    } else {
        PathBuf::from("./ydl_data")
    }
}

/// Build an `EnvFilter` from the configured level; `RUST_LOG` wins when set
pub fn env_filter(logging: &LoggingConfig) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(logging.level.clone()))
}
