//! Versioned installation directories and the installed-version pointer.
//!
//! Layout under the installation root:
//!
//! ```text
//! <root>/current_version.json   pointer to the active version
//! <root>/<hash>/                one directory per installed version
//! <root>/<hash>.partial/        staging area while a version installs
//! ```
//!
//! The pointer is only ever replaced by a rename, and it may only name a
//! version directory that exists.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::UpdateError;
use crate::version::Version;

/// Name of the installed-version pointer file.
pub const POINTER_FILE: &str = "current_version.json";
const STAGING_SUFFIX: &str = ".partial";
const RETIRED_SUFFIX: &str = ".old";

/// Durable record of the active installation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledVersionInfo {
    pub version: Version,
    pub installed_at: DateTime<Utc>,
    pub install_path: PathBuf,
}

/// A version directory found on disk.
#[derive(Debug, Clone, Serialize)]
pub struct InstalledVersion {
    pub version_hash: String,
    pub path: PathBuf,
    pub modified_at: DateTime<Utc>,
    pub is_current: bool,
}

/// Installation root.
#[derive(Debug, Clone)]
pub struct InstallStore {
    root: PathBuf,
}

impl InstallStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn pointer_path(&self) -> PathBuf {
        self.root.join(POINTER_FILE)
    }

    pub fn version_dir(&self, hash: &str) -> PathBuf {
        self.root.join(hash)
    }

    fn staging_dir(&self, hash: &str) -> PathBuf {
        self.root.join(format!("{hash}{STAGING_SUFFIX}"))
    }

    /// Read the pointer. `None` when nothing is installed yet.
    pub fn read_pointer(&self) -> Result<Option<InstalledVersionInfo>, UpdateError> {
        let content = match fs::read_to_string(self.pointer_path()) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str(&content)?))
    }

    /// Hash of the installed version. An unreadable pointer counts as none.
    pub fn current_hash(&self) -> Option<String> {
        match self.read_pointer() {
            Ok(info) => info.map(|i| i.version.version_hash),
            Err(e) => {
                warn!(path = %self.pointer_path().display(), error = %e, "Unreadable version pointer");
                None
            }
        }
    }

    /// Point the installation at `version`, whose directory must exist.
    pub fn write_pointer(&self, version: &Version) -> Result<InstalledVersionInfo, UpdateError> {
        let install_path = self.version_dir(&version.version_hash);
        if !install_path.is_dir() {
            return Err(UpdateError::NotFound(format!(
                "install directory {}",
                install_path.display()
            )));
        }

        let info = InstalledVersionInfo {
            version: version.clone(),
            installed_at: Utc::now(),
            install_path,
        };
        let pointer = self.pointer_path();
        let tmp = pointer.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&info)?)?;
        fs::rename(&tmp, &pointer)?;

        info!(version = %version.version_hash, "Installed version pointer updated");
        Ok(info)
    }

    /// Create an empty staging directory for `hash`, replacing any leftover.
    pub fn begin_staging(&self, hash: &str) -> Result<PathBuf, UpdateError> {
        let staging = self.staging_dir(hash);
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        fs::create_dir_all(&staging)?;
        Ok(staging)
    }

    /// Promote the staging directory of `hash` to its version directory.
    pub fn commit_staging(&self, hash: &str) -> Result<PathBuf, UpdateError> {
        let staging = self.staging_dir(hash);
        let target = self.version_dir(hash);
        let retired = self.root.join(format!("{hash}{RETIRED_SUFFIX}"));

        if target.exists() {
            if retired.exists() {
                fs::remove_dir_all(&retired)?;
            }
            fs::rename(&target, &retired)?;
        }
        fs::rename(&staging, &target)?;
        if retired.exists() {
            if let Err(e) = fs::remove_dir_all(&retired) {
                warn!(path = %retired.display(), error = %e, "Failed to remove replaced version");
            }
        }
        Ok(target)
    }

    pub fn discard_staging(&self, hash: &str) {
        let staging = self.staging_dir(hash);
        if let Err(e) = fs::remove_dir_all(&staging) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %staging.display(), error = %e, "Failed to discard staging directory");
            }
        }
    }

    /// Remove staging leftovers of interrupted installs.
    pub fn clean_stale_staging(&self) -> usize {
        let Ok(entries) = fs::read_dir(&self.root) else {
            return 0;
        };
        let mut removed = 0;
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !(name.ends_with(STAGING_SUFFIX) || name.ends_with(RETIRED_SUFFIX)) {
                continue;
            }
            match fs::remove_dir_all(entry.path()) {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %entry.path().display(), error = %e, "Failed to remove stale staging"),
            }
        }
        if removed > 0 {
            debug!(removed, "Removed stale staging directories");
        }
        removed
    }

    /// Installed version directories, newest first.
    pub fn installed_versions(&self) -> Result<Vec<InstalledVersion>, UpdateError> {
        let mut versions = Vec::new();
        if !self.root.exists() {
            return Ok(versions);
        }

        let current = self.current_hash();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || name.ends_with(STAGING_SUFFIX) || name.ends_with(RETIRED_SUFFIX) {
                continue;
            }
            let modified_at = entry
                .metadata()?
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            versions.push(InstalledVersion {
                is_current: current.as_deref() == Some(name.as_str()),
                version_hash: name,
                path,
                modified_at,
            });
        }

        versions.sort_by(|a, b| {
            b.modified_at
                .cmp(&a.modified_at)
                .then_with(|| a.version_hash.cmp(&b.version_hash))
        });
        Ok(versions)
    }

    pub fn is_installed(&self, hash: &str) -> bool {
        self.version_dir(hash).is_dir()
    }

    /// Delete all but the newest `keep` versions. The current one always stays.
    ///
    /// Returns the hashes that were removed.
    pub fn cleanup_old_versions(&self, keep: usize) -> Result<Vec<String>, UpdateError> {
        let mut removed = Vec::new();
        for (index, version) in self.installed_versions()?.into_iter().enumerate() {
            if index < keep || version.is_current {
                continue;
            }
            info!(version = %version.version_hash, "Removing old version");
            match fs::remove_dir_all(&version.path) {
                Ok(()) => removed.push(version.version_hash),
                Err(e) => warn!(version = %version.version_hash, error = %e, "Failed to remove old version"),
            }
        }
        Ok(removed)
    }

    /// The version directory exists and is not empty.
    pub fn validate_installation(&self, hash: &str) -> bool {
        fs::read_dir(self.version_dir(hash))
            .map(|mut entries| entries.next().is_some())
            .unwrap_or(false)
    }
}
