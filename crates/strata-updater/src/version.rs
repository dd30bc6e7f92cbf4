//! Version records, history and update strategy selection.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::cache::ContentCache;
use crate::channel::Channel;
use crate::config::VersionConfig;
use crate::error::UpdateError;
use crate::hash::{self, HashAlgorithm};
use crate::manifest::Deployment;
use crate::resolver::ManifestResolver;

/// Format version written into generated manifests.
pub const MANIFEST_FORMAT_VERSION: &str = "1.0";

/// A published version, keyed by its content hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub version_hash: String,
    pub channel: Channel,
    pub is_studio: bool,
    pub resolved_at: DateTime<Utc>,
    /// Sum of package sizes in bytes
    pub total_size: u64,
    /// Package name to published checksum
    pub file_hashes: BTreeMap<String, String>,
    /// Packages that make up the version
    pub required_files: Vec<String>,
    /// Next older entry of the deploy history, when known
    pub previous_version: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Version {
    pub fn from_deployment(deployment: &Deployment, channel: Channel) -> Self {
        let file_hashes = deployment
            .packages
            .values()
            .map(|p| (p.name.clone(), p.checksum.clone()))
            .collect();

        let mut metadata = BTreeMap::new();
        metadata.insert(
            "package_count".to_string(),
            deployment.packages.len().to_string(),
        );

        Self {
            version_hash: deployment.version_hash.clone(),
            channel,
            is_studio: channel.is_studio(),
            resolved_at: deployment.retrieved_at,
            total_size: deployment.total_size(),
            file_hashes,
            required_files: deployment.package_names(),
            previous_version: None,
            metadata,
        }
    }

    /// Record for a version known only by its hash.
    pub fn unresolved(version_hash: &str, channel: Channel) -> Self {
        Self {
            version_hash: version_hash.to_string(),
            channel,
            is_studio: channel.is_studio(),
            resolved_at: Utc::now(),
            total_size: 0,
            file_hashes: BTreeMap::new(),
            required_files: Vec::new(),
            previous_version: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Every required file has a recorded hash.
    pub fn is_consistent(&self) -> bool {
        self.required_files
            .iter()
            .all(|f| self.file_hashes.contains_key(f))
    }
}

/// Advisory classification of how costly an update is expected to be.
///
/// Every strategy is installed the same way; the label is informational.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateStrategy {
    FullDownload,
    IncrementalPatch,
    DeltaPatch,
    FastForward,
}

/// Outcome of comparing the installed version with the latest one.
#[derive(Debug, Clone, Serialize)]
pub struct UpdateCheckResult {
    pub update_available: bool,
    pub current_version: Option<Version>,
    pub latest_version: Version,
    pub strategy: UpdateStrategy,
    /// Versions strictly between current and latest, oldest first
    pub intermediate_versions: Vec<Version>,
    pub download_size: u64,
    pub checked_at: DateTime<Utc>,
}

/// Snapshot of the latest version of every reachable channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionManifest {
    pub manifest_version: String,
    pub generated_at: DateTime<Utc>,
    pub available_versions: BTreeMap<Channel, Version>,
    pub channel_latest_versions: BTreeMap<Channel, String>,
}

/// Pick a strategy. Cheaper strategies are tried first.
pub fn determine_update_strategy(
    current: Option<&Version>,
    latest: &Version,
    intermediates: &[Version],
) -> UpdateStrategy {
    let Some(current) = current else {
        return UpdateStrategy::FullDownload;
    };
    if intermediates.is_empty() {
        return UpdateStrategy::FullDownload;
    }

    if intermediates.len() <= 3 {
        let summed: u128 = intermediates.iter().map(|v| v.total_size as u128).sum();
        if summed * 10 < latest.total_size as u128 * 7 {
            return UpdateStrategy::IncrementalPatch;
        }
    }

    // Only files the current version does not have at all count as changed.
    let total = latest.file_hashes.len();
    if total > 0 {
        let changed = latest
            .file_hashes
            .keys()
            .filter(|name| !current.file_hashes.contains_key(*name))
            .count();
        if changed * 10 < total * 3 {
            return UpdateStrategy::DeltaPatch;
        }
    }

    if intermediates.len() > 10 {
        return UpdateStrategy::FastForward;
    }
    UpdateStrategy::FullDownload
}

/// Versions strictly between `current` and `latest` in a most-recent-first
/// history, returned oldest first.
///
/// Empty when either hash is absent from the history or `current` is not
/// older than `latest`.
pub fn intermediate_versions(history: &[Version], current: &str, latest: &str) -> Vec<Version> {
    let position = |hash: &str| history.iter().position(|v| v.version_hash == hash);
    match (position(latest), position(current)) {
        (Some(newer), Some(older)) if newer < older => {
            history[newer + 1..older].iter().rev().cloned().collect()
        }
        _ => Vec::new(),
    }
}

struct CachedHistory {
    versions: Vec<Version>,
    depth: usize,
    built_at: DateTime<Utc>,
}

/// Builds, caches and compares versions.
pub struct VersionManager {
    resolver: Arc<ManifestResolver>,
    cache: Arc<ContentCache>,
    history: Mutex<HashMap<Channel, CachedHistory>>,
    history_ttl: Duration,
    history_depth: usize,
    latest_ttl: Duration,
    resolve_concurrency: usize,
}

impl VersionManager {
    pub fn new(
        resolver: Arc<ManifestResolver>,
        cache: Arc<ContentCache>,
        config: &VersionConfig,
        resolve_concurrency: usize,
    ) -> Self {
        Self {
            resolver,
            cache,
            history: Mutex::new(HashMap::new()),
            history_ttl: Duration::from_secs(config.history_ttl_minutes * 60),
            history_depth: config.history_depth,
            latest_ttl: Duration::from_secs(config.latest_ttl_minutes * 60),
            resolve_concurrency: resolve_concurrency.max(1),
        }
    }

    pub fn history_depth(&self) -> usize {
        self.history_depth
    }

    /// Resolve, build and persist the latest version of `channel`.
    pub async fn latest_version(&self, channel: Channel) -> Result<Version, UpdateError> {
        let hash = self.resolver.latest_version_hash(channel).await?;
        let deployment = self.resolver.deployment_manifest(&hash, channel).await?;
        let version = Version::from_deployment(&deployment, channel);
        self.cache.set(&version_key(&hash), &version, None).await?;
        Ok(version)
    }

    /// Latest version, memoized in the content cache.
    pub async fn latest_version_cached(&self, channel: Channel) -> Result<Version, UpdateError> {
        let key = format!("latest_version_{channel}");
        match self.cache.get::<Version>(&key).await {
            Ok(Some(version)) => return Ok(version),
            Ok(None) => {}
            Err(e) => warn!(%key, error = %e, "Ignoring unreadable cached latest version"),
        }
        let version = self.latest_version(channel).await?;
        self.cache.set(&key, &version, Some(self.latest_ttl)).await?;
        Ok(version)
    }

    /// Version record for `hash`, from the cache or the resolver.
    pub async fn version_by_hash(&self, hash: &str, channel: Channel) -> Option<Version> {
        match self.resolve_version(hash, channel).await {
            Ok(version) => Some(version),
            Err(e) => {
                warn!(version = %hash, error = %e, "Could not resolve version");
                None
            }
        }
    }

    async fn resolve_version(&self, hash: &str, channel: Channel) -> Result<Version, UpdateError> {
        let key = version_key(hash);
        match self.cache.get::<Version>(&key).await {
            Ok(Some(version)) => return Ok(version),
            Ok(None) => {}
            Err(e) => warn!(%key, error = %e, "Ignoring unreadable cached version"),
        }

        let deployment = self.resolver.deployment_manifest(hash, channel).await?;
        let version = Version::from_deployment(&deployment, channel);
        if let Err(e) = self.cache.set(&key, &version, None).await {
            warn!(%key, error = %e, "Failed to cache version");
        }
        Ok(version)
    }

    /// Up to `max_count` versions of the deploy history, most recent first.
    ///
    /// Entries that fail to resolve are skipped, so the result may be shorter.
    pub async fn version_history(
        &self,
        channel: Channel,
        max_count: usize,
    ) -> Result<Vec<Version>, UpdateError> {
        let mut history = self.history.lock().await;
        if let Some(cached) = history.get(&channel) {
            if self.is_fresh(cached.built_at) && cached.depth >= max_count {
                debug!(%channel, "Serving version history from cache");
                return Ok(cached.versions.iter().take(max_count).cloned().collect());
            }
        }

        let hashes: Vec<String> = self
            .resolver
            .deploy_history()
            .await?
            .into_iter()
            .take(max_count)
            .collect();
        let resolved: Vec<Option<Version>> = stream::iter(hashes)
            .map(|hash| async move { self.version_by_hash(&hash, channel).await })
            .buffered(self.resolve_concurrency)
            .collect()
            .await;

        let mut versions: Vec<Version> = resolved.into_iter().flatten().collect();
        for i in 1..versions.len() {
            let older = versions[i].version_hash.clone();
            versions[i - 1].previous_version = Some(older);
        }
        info!(%channel, versions = versions.len(), "Rebuilt version history");

        history.insert(
            channel,
            CachedHistory {
                versions: versions.clone(),
                depth: max_count,
                built_at: Utc::now(),
            },
        );
        Ok(versions)
    }

    /// Compare `current_hash` with the latest version of `channel`.
    pub async fn check_for_updates(
        &self,
        current_hash: Option<&str>,
        channel: Channel,
    ) -> Result<UpdateCheckResult, UpdateError> {
        let latest = self.latest_version(channel).await?;
        let checked_at = Utc::now();

        if current_hash == Some(latest.version_hash.as_str()) {
            return Ok(UpdateCheckResult {
                update_available: false,
                current_version: Some(latest.clone()),
                download_size: 0,
                latest_version: latest,
                strategy: UpdateStrategy::FullDownload,
                intermediate_versions: Vec::new(),
                checked_at,
            });
        }

        let (current, intermediates) = match current_hash {
            Some(hash) => {
                let current = self.version_by_hash(hash, channel).await;
                let history = self.version_history(channel, self.history_depth).await?;
                let between = intermediate_versions(&history, hash, &latest.version_hash);
                (current, between)
            }
            None => (None, Vec::new()),
        };
        let strategy = determine_update_strategy(current.as_ref(), &latest, &intermediates);
        info!(
            %channel,
            current = ?current_hash,
            latest = %latest.version_hash,
            intermediates = intermediates.len(),
            ?strategy,
            "Update available"
        );

        Ok(UpdateCheckResult {
            update_available: true,
            current_version: current,
            download_size: latest.total_size,
            latest_version: latest,
            strategy,
            intermediate_versions: intermediates,
            checked_at,
        })
    }

    /// Latest version of every channel. Unreachable channels are left out.
    pub async fn generate_manifest(&self) -> VersionManifest {
        let mut available_versions = BTreeMap::new();
        let mut channel_latest_versions = BTreeMap::new();
        for channel in Channel::ALL {
            match self.latest_version(channel).await {
                Ok(version) => {
                    channel_latest_versions.insert(channel, version.version_hash.clone());
                    available_versions.insert(channel, version);
                }
                Err(e) => warn!(%channel, error = %e, "Skipping channel in version manifest"),
            }
        }
        VersionManifest {
            manifest_version: MANIFEST_FORMAT_VERSION.to_string(),
            generated_at: Utc::now(),
            available_versions,
            channel_latest_versions,
        }
    }

    /// Re-hash every file `hash` declares under `dir`. Stops at the first failure.
    pub async fn validate_version_integrity(&self, hash: &str, channel: Channel, dir: &Path) -> bool {
        let Some(version) = self.version_by_hash(hash, channel).await else {
            return false;
        };
        for (name, expected) in &version.file_hashes {
            let path = dir.join(name);
            match hash::hash_file(&path, HashAlgorithm::Md5).await {
                Ok(actual) if hash::hashes_match(expected, &actual) => {}
                Ok(actual) => {
                    debug!(path = %path.display(), %expected, %actual, "Version file hash mismatch");
                    return false;
                }
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "Version file unreadable");
                    return false;
                }
            }
        }
        true
    }

    /// Drop history entries older than the freshness window.
    pub async fn evict_stale_history(&self) -> usize {
        let mut history = self.history.lock().await;
        let before = history.len();
        history.retain(|_, cached| self.is_fresh(cached.built_at));
        before - history.len()
    }

    pub async fn clear_history(&self) {
        self.history.lock().await.clear();
    }

    /// Evict stale history and expired cache entries.
    pub async fn cleanup_cache(&self) -> Result<usize, UpdateError> {
        let history = self.evict_stale_history().await;
        let entries = self.cache.evict_expired().await?;
        debug!(history, entries, "Version cache cleanup");
        Ok(history + entries)
    }

    fn is_fresh(&self, built_at: DateTime<Utc>) -> bool {
        let age = Utc::now().signed_duration_since(built_at);
        age.to_std().map_or(true, |age| age < self.history_ttl)
    }
}

fn version_key(hash: &str) -> String {
    format!("version_{hash}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::CdnEndpoints;
    use tempfile::TempDir;

    fn version(hash: &str, total_size: u64, files: &[(&str, &str)]) -> Version {
        Version {
            version_hash: hash.to_string(),
            channel: Channel::Live,
            is_studio: false,
            resolved_at: Utc::now(),
            total_size,
            file_hashes: files
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            required_files: files.iter().map(|(k, _)| k.to_string()).collect(),
            previous_version: None,
            metadata: BTreeMap::new(),
        }
    }

    /// `total` files, the first `changed` of them under names no older
    /// version carries.
    fn files(changed: usize, total: usize) -> Vec<(String, String)> {
        (0..total)
            .map(|i| {
                let prefix = if i < changed { "added" } else { "file" };
                (format!("{prefix}{i}"), format!("{prefix}{i}"))
            })
            .collect()
    }

    fn version_with(hash: &str, total_size: u64, files: &[(String, String)]) -> Version {
        let borrowed: Vec<(&str, &str)> =
            files.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        version(hash, total_size, &borrowed)
    }

    async fn manager_for(
        server: &mockito::ServerGuard,
        dir: &TempDir,
        config: VersionConfig,
    ) -> VersionManager {
        let resolver = Arc::new(ManifestResolver::new(
            reqwest::Client::new(),
            CdnEndpoints::new(server.url()),
            4,
        ));
        let cache = Arc::new(
            ContentCache::open(dir.path(), 1024 * 1024, Duration::from_secs(3600), 10)
                .await
                .unwrap(),
        );
        VersionManager::new(resolver, cache, &config, 4)
    }

    #[test]
    fn test_strategy_without_current_is_full() {
        let latest = version("l", 100, &[("a", "1")]);
        let between = vec![version("i", 10, &[])];
        assert_eq!(
            determine_update_strategy(None, &latest, &between),
            UpdateStrategy::FullDownload
        );
        let current = version("c", 100, &[("a", "0")]);
        assert_eq!(
            determine_update_strategy(Some(&current), &latest, &[]),
            UpdateStrategy::FullDownload
        );
    }

    #[test]
    fn test_strategy_incremental_patch() {
        let current_files = files(0, 10);
        let latest_files = files(10, 10);
        let current = version_with("c", 1000, &current_files);
        let latest = version_with("l", 1000, &latest_files);
        let between = vec![version("i1", 300, &[]), version("i2", 300, &[])];
        assert_eq!(
            determine_update_strategy(Some(&current), &latest, &between),
            UpdateStrategy::IncrementalPatch
        );

        // 70% exactly is not under the threshold
        let between = vec![version("i1", 400, &[]), version("i2", 300, &[])];
        assert_eq!(
            determine_update_strategy(Some(&current), &latest, &between),
            UpdateStrategy::FullDownload
        );
    }

    #[test]
    fn test_strategy_delta_patch() {
        let current = version_with("c", 1000, &files(0, 5));
        let latest = version_with("l", 1000, &files(1, 5));
        let between: Vec<Version> = (0..4).map(|i| version(&format!("i{i}"), 1000, &[])).collect();
        assert_eq!(
            determine_update_strategy(Some(&current), &latest, &between),
            UpdateStrategy::DeltaPatch
        );
    }

    #[test]
    fn test_strategy_ignores_rehashed_files() {
        let current = version("c", 1000, &[("a.zip", "1"), ("b.dll", "2"), ("c.exe", "3")]);
        let latest = version("l", 1000, &[("a.zip", "1"), ("b.dll", "9"), ("c.exe", "3")]);
        let between: Vec<Version> = (0..4).map(|i| version(&format!("i{i}"), 1000, &[])).collect();
        assert_eq!(
            determine_update_strategy(Some(&current), &latest, &between),
            UpdateStrategy::DeltaPatch
        );

        // A renamed package is missing from the current set
        let latest = version("l", 1000, &[("a.zip", "1"), ("b2.dll", "2"), ("c.exe", "3")]);
        assert_eq!(
            determine_update_strategy(Some(&current), &latest, &between),
            UpdateStrategy::FullDownload
        );
    }

    #[test]
    fn test_strategy_fast_forward() {
        let current = version_with("c", 1000, &files(0, 10));
        let latest = version_with("l", 1000, &files(10, 10));
        let between: Vec<Version> = (0..11).map(|i| version(&format!("i{i}"), 1000, &[])).collect();
        assert_eq!(
            determine_update_strategy(Some(&current), &latest, &between),
            UpdateStrategy::FastForward
        );

        let between: Vec<Version> = (0..10).map(|i| version(&format!("i{i}"), 1000, &[])).collect();
        assert_eq!(
            determine_update_strategy(Some(&current), &latest, &between),
            UpdateStrategy::FullDownload
        );
    }

    #[test]
    fn test_intermediate_versions() {
        let history: Vec<Version> = ["l", "b", "a", "c", "old"]
            .iter()
            .map(|h| version(h, 0, &[]))
            .collect();

        let between = intermediate_versions(&history, "c", "l");
        let hashes: Vec<&str> = between.iter().map(|v| v.version_hash.as_str()).collect();
        assert_eq!(hashes, vec!["a", "b"]);

        assert!(intermediate_versions(&history, "missing", "l").is_empty());
        assert!(intermediate_versions(&history, "l", "c").is_empty());
        assert!(intermediate_versions(&history, "b", "l").is_empty());
    }

    #[test]
    fn test_version_from_deployment() {
        let endpoints = CdnEndpoints::new("https://cdn.test");
        let deployment = crate::manifest::parse_package_manifest(
            "app.zip aa 10\nlauncher.exe bb 5\n",
            "v1",
            &endpoints,
        );
        let version = Version::from_deployment(&deployment, Channel::Studio);
        assert_eq!(version.total_size, 15);
        assert!(version.is_studio);
        assert!(version.is_consistent());
        assert_eq!(version.file_hashes["launcher.exe"], "bb");
    }

    #[tokio::test]
    async fn test_latest_version_is_persisted() {
        let mut server = mockito::Server::new_async().await;
        let _pointer = server
            .mock("GET", "/version-")
            .with_body("abc")
            .create_async()
            .await;
        let _manifest = server
            .mock("GET", "/version-abc-rbxPkgManifest.txt")
            .with_body("app.zip 11 10\n")
            .create_async()
            .await;

        let dir = TempDir::new().unwrap();
        let manager = manager_for(&server, &dir, VersionConfig::default()).await;
        let latest = manager.latest_version(Channel::Live).await.unwrap();
        assert_eq!(latest.version_hash, "abc");

        let cached: Option<Version> = manager.cache.get("version_abc").await.unwrap();
        assert_eq!(cached, Some(latest.clone()));

        let memo = manager.latest_version_cached(Channel::Live).await.unwrap();
        assert_eq!(memo.version_hash, "abc");
        assert!(manager.cache.exists("latest_version_live").await);
    }

    #[tokio::test]
    async fn test_version_history_skips_and_links() {
        let mut server = mockito::Server::new_async().await;
        let history = server
            .mock("GET", "/DeployHistory.txt")
            .with_body("v3\nv2\nv1\n")
            .expect(1)
            .create_async()
            .await;
        let mut manifests = Vec::new();
        for hash in ["v3", "v1"] {
            let path = format!("/version-{hash}-rbxPkgManifest.txt");
            manifests.push(
                server
                    .mock("GET", path.as_str())
                    .with_body("app.zip 11 10\n")
                    .create_async()
                    .await,
            );
        }
        let _gone = server
            .mock("GET", "/version-v2-rbxPkgManifest.txt")
            .with_status(404)
            .create_async()
            .await;

        let dir = TempDir::new().unwrap();
        let manager = manager_for(&server, &dir, VersionConfig::default()).await;
        let versions = manager.version_history(Channel::Live, 10).await.unwrap();
        let hashes: Vec<&str> = versions.iter().map(|v| v.version_hash.as_str()).collect();
        assert_eq!(hashes, vec!["v3", "v1"]);
        assert_eq!(versions[0].previous_version.as_deref(), Some("v1"));
        assert_eq!(versions[1].previous_version, None);

        let again = manager.version_history(Channel::Live, 1).await.unwrap();
        assert_eq!(again.len(), 1);
        history.assert_async().await;
    }

    #[tokio::test]
    async fn test_check_for_updates_same_hash() {
        let mut server = mockito::Server::new_async().await;
        let _pointer = server
            .mock("GET", "/version-")
            .with_body("abc")
            .create_async()
            .await;
        let _manifest = server
            .mock("GET", "/version-abc-rbxPkgManifest.txt")
            .with_body("app.zip 11 10\n")
            .create_async()
            .await;

        let dir = TempDir::new().unwrap();
        let manager = manager_for(&server, &dir, VersionConfig::default()).await;
        let result = manager
            .check_for_updates(Some("abc"), Channel::Live)
            .await
            .unwrap();
        assert!(!result.update_available);

        let fresh = manager.check_for_updates(None, Channel::Live).await.unwrap();
        assert!(fresh.update_available);
        assert_eq!(fresh.strategy, UpdateStrategy::FullDownload);
        assert_eq!(fresh.download_size, 10);
    }

    #[tokio::test]
    async fn test_generate_manifest_skips_unreachable_channels() {
        let mut server = mockito::Server::new_async().await;
        let _pointer = server
            .mock("GET", "/version-")
            .with_body("abc")
            .create_async()
            .await;
        let _manifest = server
            .mock("GET", "/version-abc-rbxPkgManifest.txt")
            .with_body("app.zip 11 10\n")
            .create_async()
            .await;
        let _studio = server
            .mock("GET", "/versionQTStudio-")
            .with_status(500)
            .create_async()
            .await;

        let dir = TempDir::new().unwrap();
        let manager = manager_for(&server, &dir, VersionConfig::default()).await;
        let manifest = manager.generate_manifest().await;
        assert_eq!(manifest.manifest_version, "1.0");
        assert_eq!(manifest.channel_latest_versions[&Channel::Live], "abc");
        assert!(!manifest.channel_latest_versions.contains_key(&Channel::Studio));
        assert!(!manifest.available_versions.contains_key(&Channel::StudioCanary));
    }

    #[tokio::test]
    async fn test_validate_version_integrity() {
        let body = b"launcher bytes";
        let checksum = hash::hash_bytes(body, HashAlgorithm::Md5);
        let mut server = mockito::Server::new_async().await;
        let _manifest = server
            .mock("GET", "/version-v1-rbxPkgManifest.txt")
            .with_body(format!("launcher.exe {checksum} {}\n", body.len()))
            .create_async()
            .await;

        let dir = TempDir::new().unwrap();
        let install = TempDir::new().unwrap();
        let manager = manager_for(&server, &dir, VersionConfig::default()).await;

        assert!(!manager.validate_version_integrity("v1", Channel::Live, install.path()).await);
        std::fs::write(install.path().join("launcher.exe"), body).unwrap();
        assert!(manager.validate_version_integrity("v1", Channel::Live, install.path()).await);
        std::fs::write(install.path().join("launcher.exe"), b"launcher bytez").unwrap();
        assert!(!manager.validate_version_integrity("v1", Channel::Live, install.path()).await);
    }

    #[tokio::test]
    async fn test_evict_stale_history() {
        let mut server = mockito::Server::new_async().await;
        let _history = server
            .mock("GET", "/DeployHistory.txt")
            .with_body("")
            .create_async()
            .await;

        let dir = TempDir::new().unwrap();
        let stale = VersionConfig {
            history_ttl_minutes: 0,
            ..VersionConfig::default()
        };
        let manager = manager_for(&server, &dir, stale).await;
        manager.version_history(Channel::Live, 5).await.unwrap();
        manager.version_history(Channel::Studio, 5).await.unwrap();
        assert_eq!(manager.evict_stale_history().await, 2);
        assert_eq!(manager.evict_stale_history().await, 0);

        let fresh = manager_for(&server, &dir, VersionConfig::default()).await;
        fresh.version_history(Channel::Live, 5).await.unwrap();
        assert_eq!(fresh.evict_stale_history().await, 0);
        fresh.clear_history().await;
        assert_eq!(fresh.cleanup_cache().await.unwrap(), 0);
    }
}
