//! Application configuration.
//!
//! Configuration is loaded from a TOML file at:
//! 1. `$IMAPVAULT_CONFIG` (environment variable)
//! 2. `~/.config/imapvault/config.toml` (Linux)
//!    `~/Library/Application Support/imapvault/config.toml` (macOS)
//!    `%APPDATA%\imapvault\config.toml` (Windows)
//! 3. Built-in defaults

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::archive::store::DEFAULT_CHECKPOINT_THRESHOLD;
use crate::archive::StoreOptions;
use crate::sync::{SyncOptions, DEFAULT_CONCURRENCY, DEFAULT_QUEUE_CAPACITY};

/// File extension of archive logs created by `fetch`.
pub const ARCHIVE_EXTENSION: &str = "imapvault";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General behavior settings.
    pub general: GeneralConfig,
    /// Sync pipeline tuning.
    pub sync: SyncConfig,
    /// Archive store tuning.
    pub store: StoreConfig,
}

/// General behavior settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log level: "error", "warn", "info", "debug", "trace".
    pub log_level: String,
    /// Override cache directory for logs.
    pub cache_dir: Option<PathBuf>,
    /// Directory where `fetch` creates archives.
    pub archive_dir: PathBuf,
}

/// Sync pipeline tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Number of fetch workers, each with its own connection.
    pub concurrency: usize,
    /// Capacity of the queue between the scanner and the workers.
    pub queue_capacity: usize,
    /// Seconds between two progress reports.
    pub progress_interval_secs: u64,
}

/// Archive store tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Appended records between two checkpoint index writes.
    pub checkpoint_threshold: usize,
    /// Flush every append to disk before returning.
    pub sync_writes: bool,
}

// ── Default implementations ─────────────────────────────────────

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            cache_dir: None,
            archive_dir: PathBuf::from("."),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            progress_interval_secs: 10,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            checkpoint_threshold: DEFAULT_CHECKPOINT_THRESHOLD,
            sync_writes: true,
        }
    }
}

// ── Conversions ─────────────────────────────────────────────────

impl SyncConfig {
    pub fn options(&self) -> SyncOptions {
        SyncOptions {
            concurrency: self.concurrency.max(1),
            queue_capacity: self.queue_capacity.max(1),
        }
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_secs(self.progress_interval_secs.max(1))
    }
}

impl StoreConfig {
    pub fn options(&self) -> StoreOptions {
        StoreOptions {
            checkpoint_threshold: self.checkpoint_threshold.max(1),
            sync_writes: self.sync_writes,
        }
    }
}

// ── Load / save ─────────────────────────────────────────────────

/// Load configuration, searching standard locations.
///
/// Returns the default configuration if no file is found or on parse error.
pub fn load_config() -> Config {
    match config_file_path() {
        Some(path) if path.exists() => load_config_from(&path),
        _ => Config::default(),
    }
}

/// Load configuration from `path`, falling back to defaults on error.
pub fn load_config_from(path: &Path) -> Config {
    match std::fs::read_to_string(path) {
        Ok(contents) => match toml::from_str::<Config>(&contents) {
            Ok(cfg) => {
                tracing::debug!(path = %path.display(), "Loaded config");
                cfg
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Failed to parse config, using defaults"
                );
                Config::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "Failed to read config file, using defaults"
            );
            Config::default()
        }
    }
}

/// Determine the config file path (checking env var first, then standard dirs).
pub fn config_file_path() -> Option<PathBuf> {
    if let Ok(env_path) = std::env::var("IMAPVAULT_CONFIG") {
        return Some(PathBuf::from(env_path));
    }
    dirs::config_dir().map(|d| d.join("imapvault").join("config.toml"))
}

/// Return the cache directory for logs.
pub fn cache_dir(config: &Config) -> PathBuf {
    if let Some(ref dir) = config.general.cache_dir {
        return dir.clone();
    }
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("imapvault")
}

/// Return the log file path.
pub fn log_file_path(config: &Config) -> PathBuf {
    cache_dir(config).join("imapvault.log")
}

/// Archive path for `mailbox` under the configured archive directory.
///
/// Hierarchy separators are flattened so nested mailboxes stay in one
/// directory: `[Gmail]/All Mail` becomes `[Gmail]_All Mail.imapvault`.
pub fn archive_path(config: &Config, mailbox: &str) -> PathBuf {
    let name = mailbox.replace('/', "_");
    config
        .general
        .archive_dir
        .join(format!("{name}.{ARCHIVE_EXTENSION}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.general.log_level, "info");
        assert_eq!(cfg.general.archive_dir, PathBuf::from("."));
        assert_eq!(cfg.sync.concurrency, 4);
        assert_eq!(cfg.sync.queue_capacity, 1000);
        assert_eq!(cfg.store.checkpoint_threshold, 1000);
        assert!(cfg.store.sync_writes);
    }

    #[test]
    fn test_serialize_deserialize_roundtrip() {
        let cfg = Config::default();
        let toml_str = toml::to_string_pretty(&cfg).expect("serialize");
        let parsed: Config = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.general.log_level, cfg.general.log_level);
        assert_eq!(parsed.sync.concurrency, cfg.sync.concurrency);
        assert_eq!(
            parsed.store.checkpoint_threshold,
            cfg.store.checkpoint_threshold
        );
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let partial = r#"
[sync]
concurrency = 8

[store]
sync_writes = false
"#;
        let cfg: Config = toml::from_str(partial).expect("parse partial");
        assert_eq!(cfg.sync.concurrency, 8);
        assert!(!cfg.store.sync_writes);
        // Other fields use defaults
        assert_eq!(cfg.sync.queue_capacity, 1000);
        assert_eq!(cfg.general.log_level, "info");
    }

    #[test]
    fn test_invalid_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[sync\nconcurrency = ").unwrap();
        let cfg = load_config_from(&path);
        assert_eq!(cfg.sync.concurrency, DEFAULT_CONCURRENCY);
    }

    #[test]
    fn test_zero_values_are_clamped() {
        let mut cfg = Config::default();
        cfg.sync.concurrency = 0;
        cfg.store.checkpoint_threshold = 0;
        assert_eq!(cfg.sync.options().concurrency, 1);
        assert_eq!(cfg.store.options().checkpoint_threshold, 1);
    }

    #[test]
    fn test_archive_path_flattens_hierarchy() {
        let mut cfg = Config::default();
        cfg.general.archive_dir = PathBuf::from("/data");
        assert_eq!(
            archive_path(&cfg, "[Gmail]/All Mail"),
            PathBuf::from("/data/[Gmail]_All Mail.imapvault")
        );
        assert_eq!(archive_path(&cfg, "INBOX"), PathBuf::from("/data/INBOX.imapvault"));
    }

    #[test]
    fn test_log_file_lives_in_cache_dir() {
        let mut cfg = Config::default();
        cfg.general.cache_dir = Some(PathBuf::from("/var/cache/vault"));
        let log = log_file_path(&cfg);
        assert_eq!(log, PathBuf::from("/var/cache/vault/imapvault.log"));
        assert_eq!(log.parent(), Some(cache_dir(&cfg).as_path()));
    }
}
