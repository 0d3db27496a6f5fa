//! `config.toml` settings for the healer.
//!
//! The file lives in the OS config directory unless `--config` points
//! elsewhere:
//! - Windows: %APPDATA%\music-monitor\config.toml
//! - macOS: ~/Library/Application Support/music-monitor/config.toml
//! - Linux: ~/.config/music-monitor/config.toml
//!
//! The config file is human-readable and editable. Every section is
//! optional; missing keys fall back to defaults.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The only ID3 version tags are written with.
pub const ID3_VERSION: &str = "2.3";

/// Default upstream picture API used to resolve cover proxy URLs.
pub const DEFAULT_PICTURE_ENDPOINT: &str = "https://music-api.gdstudio.xyz/api.php";

/// Everything the healer reads from `config.toml`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where covers and the database live
    pub storage: StorageConfig,

    /// Library settings
    pub library: LibraryConfig,

    /// Heal batch settings
    pub heal: HealConfig,

    /// Provider aggregator service
    pub aggregator: AggregatorConfig,
}

/// Storage locations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root of the cover cache (`covers/` and `avatars/` live below it)
    pub upload_root: PathBuf,

    /// SQLite database file
    pub database: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            upload_root: default_upload_root(),
            database: PathBuf::from(crate::db::DEFAULT_DB_NAME),
        }
    }
}

/// `/config/uploads` in containers (when `/config` exists), `<cwd>/uploads` otherwise.
fn default_upload_root() -> PathBuf {
    let container = Path::new("/config");
    if container.is_dir() {
        return container.join("uploads");
    }
    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join("uploads")
}

/// Audio library layout
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LibraryConfig {
    /// Library roots; `local_path` must lie under one of them (empty = any)
    pub roots: Vec<PathBuf>,
}

impl LibraryConfig {
    /// Whether `path` lies under a configured root.
    pub fn contains(&self, path: &Path) -> bool {
        self.roots.is_empty() || self.roots.iter().any(|root| path.starts_with(root))
    }
}

/// Heal settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealConfig {
    /// Songs healed per batch when no limit is given
    pub default_limit: u32,

    /// ID3 version for MP3 writes; only "2.3" is supported
    pub id3_version: String,

    /// Cover download timeout
    pub cover_timeout_secs: u64,

    /// Upstream picture API for `/api/discovery/cover` proxy URLs
    pub picture_endpoint: String,
}

impl Default for HealConfig {
    fn default() -> Self {
        Self {
            default_limit: 50,
            id3_version: ID3_VERSION.to_string(),
            cover_timeout_secs: 15,
            picture_endpoint: DEFAULT_PICTURE_ENDPOINT.to_string(),
        }
    }
}

/// Provider aggregator service settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// Base URL of the aggregator (`{base_url}/best-match`)
    pub base_url: Option<String>,

    pub timeout_secs: u64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_secs: 20,
        }
    }
}

impl Config {
    /// Clamp values the core does not support back to their defaults.
    pub fn normalized(mut self) -> Self {
        if self.heal.id3_version != ID3_VERSION {
            tracing::warn!(
                "Unsupported id3_version {:?}, tags are written as ID3v{}",
                self.heal.id3_version,
                ID3_VERSION
            );
            self.heal.id3_version = ID3_VERSION.to_string();
        }
        if self.heal.default_limit == 0 {
            tracing::warn!("heal.default_limit must be positive, using 50");
            self.heal.default_limit = HealConfig::default().default_limit;
        }
        self
    }
}

// ============================================================================
// Config File Operations
// ============================================================================

/// `<os config dir>/music-monitor`
pub fn config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("music-monitor"))
}

/// Default location of `config.toml`
pub fn config_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join("config.toml"))
}

/// Load `config.toml` from the default location.
///
/// Never fails: a missing or unreadable file yields the defaults.
pub fn load() -> Config {
    let Some(path) = config_path() else {
        tracing::warn!("No OS config directory, running with default settings");
        return Config::default();
    };
    load_from(&path)
}

/// Load configuration from a specific file, with the same fallback rules as [`load`].
pub fn load_from(path: &Path) -> Config {
    if !path.exists() {
        tracing::info!(path = %path.display(), "No config file, running with default settings");
        return Config::default();
    }

    match std::fs::read_to_string(path) {
        Ok(contents) => match toml::from_str::<Config>(&contents) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "Config loaded");
                config.normalized()
            }
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "Config file is not valid TOML, ignoring it");
                Config::default()
            }
        },
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "Could not read config file, ignoring it");
            Config::default()
        }
    }
}

/// Write `config` to `path` through a temp file and a rename, creating
/// parent directories as needed.
pub fn save_to(config: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| ConfigError::CreateDir(dir.to_path_buf(), e))?;
    }

    let contents = toml::to_string_pretty(config).map_err(ConfigError::Serialize)?;

    let temp_path = path.with_extension("toml.tmp");
    std::fs::write(&temp_path, &contents).map_err(|e| ConfigError::Write(temp_path.clone(), e))?;
    std::fs::rename(&temp_path, path)
        .map_err(|e| ConfigError::Rename(temp_path, path.to_path_buf(), e))?;

    tracing::info!(path = %path.display(), "Config saved");
    Ok(())
}

// ============================================================================
// Error Types
// ============================================================================

/// Errors from [`save_to`]
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot create {path}: {err}", path = .0.display(), err = .1)]
    CreateDir(PathBuf, std::io::Error),

    #[error("cannot encode config: {0}")]
    Serialize(toml::ser::Error),

    #[error("cannot write {path}: {err}", path = .0.display(), err = .1)]
    Write(PathBuf, std::io::Error),

    #[error("cannot move {from} into place at {to}: {err}", from = .0.display(), to = .1.display(), err = .2)]
    Rename(PathBuf, PathBuf, std::io::Error),
}

// ============================================================================
// Tests
// ============================================================================
