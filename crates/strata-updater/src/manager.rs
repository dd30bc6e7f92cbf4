//! Update orchestration from check to committed installation.
//!
//! One update runs at a time, serialized by a process-wide lock. The
//! pipeline walks five steps:
//!
//! | step        | overall progress |
//! |-------------|------------------|
//! | preparing   | 0 - 20           |
//! | downloading | 20 - 70          |
//! | verifying   | 70               |
//! | installing  | 70 - 95          |
//! | finalizing  | 95 - 100         |
//!
//! Packages are installed into a staging directory next to the installed
//! versions and only promoted once every package is in place. The
//! installed-version pointer is written last, so a failure at any step
//! leaves the previous installation authoritative.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::ContentCache;
use crate::channel::CdnEndpoints;
use crate::config::UpdateConfig;
use crate::download::{DownloadRequest, DownloadScheduler};
use crate::error::{PipelineStep, UpdateError};
use crate::extract::PackageExtractor;
use crate::hash::HashAlgorithm;
use crate::install::{InstallStore, InstalledVersion, InstalledVersionInfo};
use crate::manifest::{Deployment, FileEntry};
use crate::resolver::ManifestResolver;
use crate::verify::IntegrityVerifier;
use crate::version::{UpdateCheckResult, UpdateStrategy, Version, VersionManager};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Current state of the update manager.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub enum UpdateState {
    /// Idle, no update in progress
    #[default]
    Idle,
    Checking,
    UpdateAvailable,
    Preparing,
    Downloading,
    Verifying,
    Installing,
    Finalizing,
    /// Last operation failed
    Error(String),
}

impl UpdateState {
    fn for_step(step: PipelineStep) -> Self {
        match step {
            PipelineStep::Preparing => UpdateState::Preparing,
            PipelineStep::Downloading => UpdateState::Downloading,
            PipelineStep::Verifying => UpdateState::Verifying,
            PipelineStep::Installing => UpdateState::Installing,
            PipelineStep::Finalizing => UpdateState::Finalizing,
        }
    }
}

/// Progress of a pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct UpdateProgress {
    pub step: PipelineStep,
    pub current_step: u8,
    pub total_steps: u8,
    pub description: String,
    pub overall_progress: f64,
    /// Byte progress of the download step
    pub download_progress: Option<f64>,
}

impl UpdateProgress {
    fn new(step: PipelineStep, overall: f64, description: impl Into<String>) -> Self {
        Self {
            step,
            current_step: step.index(),
            total_steps: PipelineStep::COUNT,
            description: description.into(),
            overall_progress: overall.clamp(0.0, 100.0),
            download_progress: None,
        }
    }
}

/// Notifications published to subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum UpdateEvent {
    UpdateAvailable {
        version: String,
        strategy: UpdateStrategy,
        download_size: u64,
    },
    Progress(UpdateProgress),
    Completed {
        old_version: Option<String>,
        new_version: String,
    },
    Failed {
        error: String,
        step: Option<PipelineStep>,
        version: String,
    },
}

/// Result of an update request.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UpdateOutcome {
    UpToDate { version: String },
    Installed(InstalledVersionInfo),
}

/// Result of one periodic check cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ScheduledCheckOutcome {
    /// Another update held the lock; nothing was done this cycle
    Busy,
    UpToDate,
    /// An update exists but auto-update is off
    UpdateAvailable { version: String },
    Installed { version: String },
    Failed { error: String },
}

/// Main update manager that drives every component through the pipeline.
pub struct UpdateManager {
    config: UpdateConfig,
    resolver: Arc<ManifestResolver>,
    cache: Arc<ContentCache>,
    versions: VersionManager,
    scheduler: DownloadScheduler,
    verifier: IntegrityVerifier,
    extractor: PackageExtractor,
    store: InstallStore,
    state: Arc<RwLock<UpdateState>>,
    update_lock: Mutex<()>,
    auto_update: AtomicBool,
    events: broadcast::Sender<UpdateEvent>,
    shutdown: CancellationToken,
}

impl UpdateManager {
    /// Build every component from `config` and start the download queue.
    pub async fn new(config: UpdateConfig) -> Result<Self, UpdateError> {
        config.validate()?;
        let client = config.network.build_client()?;

        let resolver = Arc::new(ManifestResolver::new(
            client.clone(),
            CdnEndpoints::new(config.cdn_base_url.clone()),
            config.network.resolver_concurrency,
        ));
        let cache = Arc::new(
            ContentCache::open(
                config.paths.cache_dir(),
                config.cache.max_size_bytes,
                Duration::from_secs(config.cache.default_ttl_seconds),
                config.cache.warm_load_limit,
            )
            .await?,
        );
        let versions = VersionManager::new(
            resolver.clone(),
            cache.clone(),
            &config.versions,
            config.network.resolver_concurrency,
        );
        let scheduler = DownloadScheduler::new(client, config.download.clone());
        scheduler.start();

        let install_dir = config.paths.install_dir();
        std::fs::create_dir_all(&install_dir)?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        info!(
            channel = %config.channel,
            install_dir = %install_dir.display(),
            "Update manager ready"
        );
        Ok(Self {
            auto_update: AtomicBool::new(config.auto_update),
            verifier: IntegrityVerifier::new(config.verify.max_concurrent),
            extractor: PackageExtractor::new(config.extract.max_concurrent),
            store: InstallStore::new(install_dir),
            config,
            resolver,
            cache,
            versions,
            scheduler,
            state: Arc::new(RwLock::new(UpdateState::Idle)),
            update_lock: Mutex::new(()),
            events,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &UpdateConfig {
        &self.config
    }

    pub fn versions(&self) -> &VersionManager {
        &self.versions
    }

    pub fn cache(&self) -> &ContentCache {
        &self.cache
    }

    pub fn store(&self) -> &InstallStore {
        &self.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UpdateEvent> {
        self.events.subscribe()
    }

    pub async fn state(&self) -> UpdateState {
        self.state.read().await.clone()
    }

    async fn set_state(&self, state: UpdateState) {
        *self.state.write().await = state;
    }

    pub fn set_auto_update(&self, enabled: bool) {
        self.auto_update.store(enabled, Ordering::SeqCst);
    }

    pub fn auto_update_enabled(&self) -> bool {
        self.auto_update.load(Ordering::SeqCst)
    }

    /// Abort any running pipeline and stop the download queue.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.scheduler.stop();
    }

    fn emit(&self, event: UpdateEvent) {
        let _ = self.events.send(event);
    }

    /// Compare the installed version with the latest one on the configured channel.
    ///
    /// With nothing installed, an update is always available.
    pub async fn check_for_updates(&self) -> Result<UpdateCheckResult, UpdateError> {
        self.set_state(UpdateState::Checking).await;
        let current = self.store.current_hash();
        debug!(current = ?current, channel = %self.config.channel, "Checking for updates");

        match self
            .versions
            .check_for_updates(current.as_deref(), self.config.channel)
            .await
        {
            Ok(check) if check.update_available => {
                self.set_state(UpdateState::UpdateAvailable).await;
                self.emit(UpdateEvent::UpdateAvailable {
                    version: check.latest_version.version_hash.clone(),
                    strategy: check.strategy,
                    download_size: check.download_size,
                });
                Ok(check)
            }
            Ok(check) => {
                info!(version = %check.latest_version.version_hash, "Already up to date");
                self.set_state(UpdateState::Idle).await;
                Ok(check)
            }
            Err(e) => {
                error!(error = %e, "Update check failed");
                self.set_state(UpdateState::Error(e.to_string())).await;
                Err(e)
            }
        }
    }

    /// Check and install the latest version, waiting for a running update first.
    pub async fn perform_update(&self) -> Result<UpdateOutcome, UpdateError> {
        let _guard = self.update_lock.lock().await;
        self.update_locked().await
    }

    /// Like [`UpdateManager::perform_update`], but fails with
    /// [`UpdateError::UpdateInProgress`] instead of waiting.
    pub async fn try_perform_update(&self) -> Result<UpdateOutcome, UpdateError> {
        let _guard = self
            .update_lock
            .try_lock()
            .map_err(|_| UpdateError::UpdateInProgress)?;
        self.update_locked().await
    }

    async fn update_locked(&self) -> Result<UpdateOutcome, UpdateError> {
        let check = self.check_for_updates().await?;
        if !check.update_available {
            return Ok(UpdateOutcome::UpToDate {
                version: check.latest_version.version_hash,
            });
        }
        let info = self.install(&check.latest_version).await?;
        Ok(UpdateOutcome::Installed(info))
    }

    /// One periodic cycle. Does nothing while another update holds the lock.
    pub async fn run_scheduled_check(&self) -> ScheduledCheckOutcome {
        let Ok(_guard) = self.update_lock.try_lock() else {
            debug!("Update in progress, skipping scheduled check");
            return ScheduledCheckOutcome::Busy;
        };

        let check = match self.check_for_updates().await {
            Ok(check) => check,
            Err(e) => {
                warn!(error = %e, "Scheduled update check failed");
                return ScheduledCheckOutcome::Failed {
                    error: e.to_string(),
                };
            }
        };
        let version = check.latest_version.version_hash.clone();
        if !check.update_available {
            return ScheduledCheckOutcome::UpToDate;
        }
        if !self.auto_update_enabled() {
            info!(%version, "Update available, auto-update disabled");
            return ScheduledCheckOutcome::UpdateAvailable { version };
        }
        match self.install(&check.latest_version).await {
            Ok(_) => ScheduledCheckOutcome::Installed { version },
            Err(e) => ScheduledCheckOutcome::Failed {
                error: e.to_string(),
            },
        }
    }

    /// Run scheduled checks every configured interval until `shutdown` fires.
    pub async fn run_periodic(&self, shutdown: &CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.check_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval = ?self.config.check_interval(), "Periodic update checks started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let outcome = self.run_scheduled_check().await;
                    debug!(?outcome, "Scheduled check finished");
                }
            }
        }
        info!("Periodic update checks stopped");
    }

    async fn install(&self, target: &Version) -> Result<InstalledVersionInfo, UpdateError> {
        let hash = target.version_hash.as_str();
        let previous = self.store.current_hash();
        let download_dir = self.config.paths.temp_dir().join(hash);
        let cancel = self.shutdown.child_token();
        info!(version = %hash, previous = ?previous, "Starting update pipeline");

        let result = self.run_pipeline(target, &download_dir, &cancel).await;
        remove_dir_quietly(&download_dir).await;

        match result {
            Ok(info) => {
                self.set_state(UpdateState::Idle).await;
                self.emit(UpdateEvent::Completed {
                    old_version: previous,
                    new_version: hash.to_string(),
                });
                info!(version = %hash, "Update installed");
                Ok(info)
            }
            Err(e) => {
                self.store.discard_staging(hash);
                let step = match &e {
                    UpdateError::Pipeline { step, .. } => Some(*step),
                    _ => None,
                };
                error!(version = %hash, error = %e, "Update failed");
                self.set_state(UpdateState::Error(e.to_string())).await;
                self.emit(UpdateEvent::Failed {
                    error: e.to_string(),
                    step,
                    version: hash.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn run_pipeline(
        &self,
        target: &Version,
        download_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<InstalledVersionInfo, UpdateError> {
        use PipelineStep::*;

        self.enter(Preparing, 0.0, "Resolving deployment").await;
        let (deployment, staging) = self
            .prepare(target, download_dir)
            .await
            .map_err(|e| e.at_step(Preparing))?;

        self.enter(
            Downloading,
            20.0,
            format!("Downloading {} packages", deployment.packages.len()),
        )
        .await;
        self.download_packages(&deployment, download_dir, cancel)
            .await
            .map_err(|e| e.at_step(Downloading))?;

        self.enter(Verifying, 70.0, "Verifying packages").await;
        self.verify_packages(&deployment, download_dir)
            .await
            .map_err(|e| e.at_step(Verifying))?;

        self.enter(Installing, 70.0, "Installing packages").await;
        self.install_packages(&deployment, download_dir, &staging, cancel)
            .await
            .map_err(|e| e.at_step(Installing))?;

        self.enter(Finalizing, 95.0, "Activating version").await;
        self.store
            .commit_staging(&target.version_hash)
            .map_err(|e| e.at_step(Finalizing))?;
        let info = self
            .store
            .write_pointer(target)
            .map_err(|e| e.at_step(Finalizing))?;
        self.emit(UpdateEvent::Progress(UpdateProgress::new(
            Finalizing,
            100.0,
            "Update complete",
        )));
        Ok(info)
    }

    async fn enter(&self, step: PipelineStep, overall: f64, description: impl Into<String>) {
        self.set_state(UpdateState::for_step(step)).await;
        self.emit(UpdateEvent::Progress(UpdateProgress::new(step, overall, description)));
    }

    async fn prepare(
        &self,
        target: &Version,
        download_dir: &Path,
    ) -> Result<(Deployment, PathBuf), UpdateError> {
        self.store.clean_stale_staging();
        remove_dir_quietly(download_dir).await;
        tokio::fs::create_dir_all(download_dir).await?;

        let mut deployment = self
            .resolver
            .deployment_manifest(&target.version_hash, target.channel)
            .await?;
        self.resolver.attach_file_lists(&mut deployment).await;
        let staging = self.store.begin_staging(&target.version_hash)?;
        Ok((deployment, staging))
    }

    async fn download_packages(
        &self,
        deployment: &Deployment,
        download_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), UpdateError> {
        let requests = deployment
            .packages
            .values()
            .map(|package| {
                let mut request =
                    DownloadRequest::new(&package.download_url, download_dir.join(&package.name))
                        .with_algorithm(HashAlgorithm::Md5);
                if !package.checksum.is_empty() {
                    request = request.with_hash(&package.checksum);
                }
                if package.size > 0 {
                    request = request.with_size(package.size);
                }
                request
            })
            .collect();

        let events = &self.events;
        let batch = self
            .scheduler
            .download_batch(
                requests,
                |progress| {
                    let mut record = UpdateProgress::new(
                        PipelineStep::Downloading,
                        20.0 + progress.percentage * 0.5,
                        "Downloading packages",
                    );
                    record.download_progress = Some(progress.percentage);
                    let _ = events.send(UpdateEvent::Progress(record));
                },
                cancel,
            )
            .await;

        if cancel.is_cancelled() {
            return Err(UpdateError::Cancelled);
        }
        let failed = batch.failed_tasks().next().cloned();
        match failed {
            Some(task) => Err(UpdateError::DownloadFailed {
                reason: task
                    .error
                    .unwrap_or_else(|| format!("{:?}", task.status)),
                url: task.url,
            }),
            None => Ok(()),
        }
    }

    async fn verify_packages(
        &self,
        deployment: &Deployment,
        download_dir: &Path,
    ) -> Result<(), UpdateError> {
        let files = deployment
            .packages
            .values()
            .filter(|p| !p.checksum.is_empty())
            .map(|p| (download_dir.join(&p.name), p.checksum.clone()))
            .collect();
        let results = self.verifier.verify_many(files, HashAlgorithm::Md5).await;

        match results.into_iter().find(|r| !r.is_valid) {
            None => Ok(()),
            Some(failed) => match failed.actual_hash {
                Some(actual) => Err(UpdateError::HashMismatch {
                    path: failed.path,
                    expected: failed.expected_hash,
                    actual,
                }),
                None => Err(UpdateError::NotFound(format!(
                    "{}: {}",
                    failed.path.display(),
                    failed.error.unwrap_or_default()
                ))),
            },
        }
    }

    async fn install_packages(
        &self,
        deployment: &Deployment,
        download_dir: &Path,
        staging: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), UpdateError> {
        let total = deployment.packages.len().max(1) as f64;
        for (index, package) in deployment.packages.values().enumerate() {
            if cancel.is_cancelled() {
                return Err(UpdateError::Cancelled);
            }
            let source = download_dir.join(&package.name);
            let archive_root = zip_root(&package.name);
            let dest = match archive_root {
                Some(root) => staging.join(root),
                None => staging.to_path_buf(),
            };
            self.extractor.extract_package(&source, &dest, cancel).await?;

            if archive_root.is_some() && !package.files.is_empty() {
                let expected: Vec<FileEntry> = package.files.values().cloned().collect();
                if !self.extractor.validate_extracted_files(&dest, &expected).await? {
                    return Err(UpdateError::Extraction(format!(
                        "extracted files of {} do not match its file list",
                        package.name
                    )));
                }
            }

            self.emit(UpdateEvent::Progress(UpdateProgress::new(
                PipelineStep::Installing,
                70.0 + 25.0 * (index + 1) as f64 / total,
                format!("Installed {}", package.name),
            )));
        }
        Ok(())
    }

    /// Repoint the installation at an already installed version.
    pub async fn rollback_to_version(&self, hash: &str) -> Result<InstalledVersionInfo, UpdateError> {
        let _guard = self.update_lock.lock().await;
        if !self.store.is_installed(hash) {
            return Err(UpdateError::NotFound(format!("installed version {hash}")));
        }
        let channel = self.config.channel;
        let version = match self.versions.version_by_hash(hash, channel).await {
            Some(version) => version,
            None => Version::unresolved(hash, channel),
        };
        let previous = self.store.current_hash();
        let info = self.store.write_pointer(&version)?;
        info!(from = ?previous, to = %hash, "Rolled back installed version");
        Ok(info)
    }

    pub fn installed_versions(&self) -> Result<Vec<InstalledVersion>, UpdateError> {
        self.store.installed_versions()
    }

    /// Remove old version directories, keeping `keep` (or the configured count).
    pub async fn cleanup_old_versions(&self, keep: Option<usize>) -> Result<Vec<String>, UpdateError> {
        let _guard = self.update_lock.lock().await;
        self.store
            .cleanup_old_versions(keep.unwrap_or(self.config.versions.keep_installed))
    }

    /// Check an installed version against its published manifest.
    ///
    /// Falls back to a directory check when the manifest is unreachable.
    pub async fn validate_installation(&self, hash: &str) -> bool {
        if !self.store.validate_installation(hash) {
            return false;
        }
        let mut deployment = match self
            .resolver
            .deployment_manifest(hash, self.config.channel)
            .await
        {
            Ok(deployment) => deployment,
            Err(e) => {
                warn!(version = %hash, error = %e, "Manifest unavailable, checked directory only");
                return true;
            }
        };
        self.resolver.attach_file_lists(&mut deployment).await;
        let expected = installed_file_entries(&deployment);
        self.verifier
            .verify_directory(&self.store.version_dir(hash), &expected)
            .await
    }

    /// Empty the content cache and the version history.
    pub async fn clear_all_caches(&self) -> Result<(), UpdateError> {
        self.cache.clear().await?;
        self.versions.clear_history().await;
        info!("Cleared all caches");
        Ok(())
    }
}

/// Directory a zip package is unpacked into, named after its stem.
fn zip_root(package_name: &str) -> Option<&str> {
    let path = Path::new(package_name);
    let is_zip = path
        .extension()
        .map_or(false, |ext| ext.eq_ignore_ascii_case("zip"));
    if is_zip {
        path.file_stem().and_then(|stem| stem.to_str())
    } else {
        None
    }
}

/// Files an installed deployment should contain, relative to its version directory.
fn installed_file_entries(deployment: &Deployment) -> Vec<FileEntry> {
    let mut entries = Vec::new();
    for package in deployment.packages.values() {
        if let Some(root) = zip_root(&package.name) {
            entries.extend(package.files.values().map(|file| FileEntry {
                relative_path: format!("{root}/{}", file.relative_path),
                ..file.clone()
            }));
        } else if !package.is_archive() {
            entries.push(FileEntry {
                relative_path: package.name.clone(),
                hash: package.checksum.clone(),
                size: package.size,
                is_compressed: false,
            });
        }
    }
    entries
}

async fn remove_dir_quietly(dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(dir).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %dir.display(), error = %e, "Failed to remove temporary directory");
        }
    }
}
