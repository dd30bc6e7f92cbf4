//! Configuration structures for the update system.
//!
//! Every field has a serde default so a partial TOML file is a valid
//! configuration. Concurrency ceilings for downloads, verification,
//! extraction and resolver requests are independent of one another.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::channel::Channel;
use crate::error::UpdateError;
use crate::hash::HashAlgorithm;

/// Main update configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateConfig {
    /// Release channel to follow
    #[serde(default)]
    pub channel: Channel,

    /// Base URL of the deployment CDN
    #[serde(default = "default_cdn_base_url")]
    pub cdn_base_url: String,

    /// Whether periodic checks install updates without asking
    #[serde(default)]
    pub auto_update: bool,

    /// Interval between periodic update checks in minutes
    #[serde(default = "default_check_interval")]
    pub check_interval_minutes: u64,

    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(default)]
    pub download: DownloadConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub verify: VerifyConfig,

    #[serde(default)]
    pub extract: ExtractConfig,

    #[serde(default)]
    pub versions: VersionConfig,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            channel: Channel::default(),
            cdn_base_url: default_cdn_base_url(),
            auto_update: false,
            check_interval_minutes: default_check_interval(),
            paths: PathsConfig::default(),
            network: NetworkConfig::default(),
            download: DownloadConfig::default(),
            cache: CacheConfig::default(),
            verify: VerifyConfig::default(),
            extract: ExtractConfig::default(),
            versions: VersionConfig::default(),
        }
    }
}

impl UpdateConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self, UpdateError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self =
            toml::from_str(&content).map_err(|e| UpdateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), UpdateError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| UpdateError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject settings that would stall or misroute the updater.
    pub fn validate(&self) -> Result<(), UpdateError> {
        if self.cdn_base_url.trim().is_empty() {
            return Err(UpdateError::Config("cdn_base_url must not be empty".into()));
        }
        let ceilings = [
            ("network.resolver_concurrency", self.network.resolver_concurrency),
            ("download.max_concurrent", self.download.max_concurrent),
            ("verify.max_concurrent", self.verify.max_concurrent),
            ("extract.max_concurrent", self.extract.max_concurrent),
        ];
        for (name, value) in ceilings {
            if value == 0 {
                return Err(UpdateError::Config(format!("{name} must be at least 1")));
            }
        }
        if self.download.chunk_size_bytes == 0 {
            return Err(UpdateError::Config(
                "download.chunk_size_bytes must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_minutes.max(1) * 60)
    }
}

/// Filesystem layout of one installation root.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Root directory (empty = platform data directory)
    #[serde(default)]
    pub base_dir: Option<PathBuf>,
}

impl PathsConfig {
    pub fn base_dir(&self) -> PathBuf {
        match &self.base_dir {
            Some(dir) => dir.clone(),
            None => default_base_dir(),
        }
    }

    /// Per-version install directories and the installed-version pointer.
    pub fn install_dir(&self) -> PathBuf {
        self.base_dir().join("install")
    }

    /// Downloaded packages awaiting verification and extraction.
    pub fn temp_dir(&self) -> PathBuf {
        self.base_dir().join("temp")
    }

    /// Content cache root.
    pub fn cache_dir(&self) -> PathBuf {
        self.base_dir().join("cache")
    }
}

/// Network configuration shared by the resolver and the downloader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,

    /// Read timeout in seconds (per read, not per transfer)
    #[serde(default = "default_read_timeout")]
    pub read_timeout_seconds: u64,

    /// Maximum outstanding manifest/resolver requests
    #[serde(default = "default_resolver_concurrency")]
    pub resolver_concurrency: usize,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout_seconds: default_connect_timeout(),
            read_timeout_seconds: default_read_timeout(),
            resolver_concurrency: default_resolver_concurrency(),
            user_agent: default_user_agent(),
        }
    }
}

impl NetworkConfig {
    /// Build the HTTP client used by the resolver and the downloader.
    pub fn build_client(&self) -> Result<reqwest::Client, UpdateError> {
        reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(self.connect_timeout_seconds))
            .read_timeout(Duration::from_secs(self.read_timeout_seconds))
            .user_agent(self.user_agent.clone())
            .build()
            .map_err(|e| UpdateError::Config(format!("failed to build HTTP client: {e}")))
    }
}

/// Download scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Simultaneous transfers
    #[serde(default = "default_download_concurrency")]
    pub max_concurrent: usize,

    /// Size of buffered writes to disk
    #[serde(default = "default_chunk_size")]
    pub chunk_size_bytes: usize,

    /// Attempts per task before it fails for good
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before a failed task is queued again
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,

    /// Minimum spacing of progress events per task
    #[serde(default = "default_progress_interval")]
    pub progress_interval_ms: u64,

    /// Idle poll interval of the dispatch loop
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Verification algorithm for requests that do not name one
    #[serde(default)]
    pub algorithm: HashAlgorithm,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_download_concurrency(),
            chunk_size_bytes: default_chunk_size(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay(),
            progress_interval_ms: default_progress_interval(),
            poll_interval_ms: default_poll_interval(),
            algorithm: HashAlgorithm::default(),
        }
    }
}

/// Content cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Byte ceiling of the on-disk layer
    #[serde(default = "default_cache_size")]
    pub max_size_bytes: u64,

    /// Time-to-live applied when a write does not give one
    #[serde(default = "default_cache_ttl")]
    pub default_ttl_seconds: u64,

    /// Entries loaded into memory at startup
    #[serde(default = "default_warm_load")]
    pub warm_load_limit: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: default_cache_size(),
            default_ttl_seconds: default_cache_ttl(),
            warm_load_limit: default_warm_load(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyConfig {
    #[serde(default = "default_verify_concurrency")]
    pub max_concurrent: usize,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_verify_concurrency(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractConfig {
    #[serde(default = "default_extract_concurrency")]
    pub max_concurrent: usize,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_extract_concurrency(),
        }
    }
}

/// Version history and installed-version housekeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionConfig {
    /// Freshness window of the per-channel history cache
    #[serde(default = "default_history_ttl")]
    pub history_ttl_minutes: u64,

    /// History entries walked when looking for intermediates
    #[serde(default = "default_history_depth")]
    pub history_depth: usize,

    /// Lifetime of the memoized latest version per channel
    #[serde(default = "default_latest_ttl")]
    pub latest_ttl_minutes: u64,

    /// Installed version directories kept by cleanup
    #[serde(default = "default_keep_installed")]
    pub keep_installed: usize,
}

impl Default for VersionConfig {
    fn default() -> Self {
        Self {
            history_ttl_minutes: default_history_ttl(),
            history_depth: default_history_depth(),
            latest_ttl_minutes: default_latest_ttl(),
            keep_installed: default_keep_installed(),
        }
    }
}

// Default value functions for serde
fn default_cdn_base_url() -> String {
    "https://setup.rbxcdn.com".to_string()
}

fn default_check_interval() -> u64 {
    60
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_read_timeout() -> u64 {
    60
}

fn default_resolver_concurrency() -> usize {
    10
}

fn default_user_agent() -> String {
    concat!("strata-updater/", env!("CARGO_PKG_VERSION")).to_string()
}

fn default_download_concurrency() -> usize {
    4
}

fn default_chunk_size() -> usize {
    8 * 1024 * 1024
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_delay() -> u64 {
    500
}

fn default_progress_interval() -> u64 {
    500
}

fn default_poll_interval() -> u64 {
    100
}

fn default_cache_size() -> u64 {
    2 * 1024 * 1024 * 1024
}

fn default_cache_ttl() -> u64 {
    24 * 60 * 60
}

fn default_warm_load() -> usize {
    100
}

fn default_verify_concurrency() -> usize {
    4
}

fn default_extract_concurrency() -> usize {
    2
}

fn default_history_ttl() -> u64 {
    30
}

fn default_history_depth() -> usize {
    100
}

fn default_latest_ttl() -> u64 {
    30
}

fn default_keep_installed() -> usize {
    3
}

/// Platform data directory for the installation root.
fn default_base_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("LOCALAPPDATA") {
            return PathBuf::from(appdata).join("Strata");
        }
    }

    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("Strata");
        }
    }

    #[cfg(target_os = "linux")]
    {
        if let Ok(data_home) = std::env::var("XDG_DATA_HOME") {
            return PathBuf::from(data_home).join("strata");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join(".local")
                .join("share")
                .join("strata");
        }
    }

    PathBuf::from(".").join("strata")
}
