//! Package extraction.
//!
//! Packages are dispatched on their extension:
//!
//! - `.zip`: every entry is written under the destination, keeping its
//!   relative path and overwriting existing files
//! - `.gz`: decompressed to a single file named without the extension
//! - anything else: copied verbatim into the destination
//!
//! Extraction runs on the blocking pool and checks the cancellation token
//! between archive entries and between decompression chunks. A cancelled
//! extraction leaves whatever it already wrote in place.

use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use flate2::read::GzDecoder;
use futures_util::future::try_join_all;
use serde::Serialize;
use tokio::sync::{broadcast, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::UpdateError;
use crate::hash::{self, HashAlgorithm};
use crate::manifest::FileEntry;

const PROGRESS_CHANNEL_CAPACITY: usize = 256;
const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Progress of one package extraction.
#[derive(Debug, Clone, Serialize)]
pub struct ExtractionProgress {
    pub package: PathBuf,
    pub processed: u64,
    pub total: u64,
    pub percentage: f64,
    pub current_file: String,
}

impl ExtractionProgress {
    fn new(package: &Path, processed: u64, total: u64, current_file: impl Into<String>) -> Self {
        let percentage = if total == 0 {
            100.0
        } else {
            (processed as f64 * 100.0 / total as f64).min(100.0)
        };
        Self {
            package: package.to_path_buf(),
            processed,
            total,
            percentage,
            current_file: current_file.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PackageKind {
    Zip,
    Gzip,
    Raw,
}

impl PackageKind {
    fn of(path: &Path) -> Self {
        match path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref()
        {
            Some("zip") => PackageKind::Zip,
            Some("gz") => PackageKind::Gzip,
            _ => PackageKind::Raw,
        }
    }
}

/// Unpacks downloaded packages into install trees.
pub struct PackageExtractor {
    semaphore: Arc<Semaphore>,
    progress: broadcast::Sender<ExtractionProgress>,
}

impl PackageExtractor {
    /// Create an extractor running at most `max_concurrent` extractions.
    pub fn new(max_concurrent: usize) -> Self {
        let (progress, _) = broadcast::channel(PROGRESS_CHANNEL_CAPACITY);
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            progress,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExtractionProgress> {
        self.progress.subscribe()
    }

    /// Extract `package` into `dest_dir`, creating the directory if needed.
    pub async fn extract_package(
        &self,
        package: &Path,
        dest_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), UpdateError> {
        if !tokio::fs::try_exists(package).await? {
            return Err(UpdateError::NotFound(package.display().to_string()));
        }
        tokio::fs::create_dir_all(dest_dir).await?;

        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| UpdateError::ConcurrencyTimeout("extraction slot".into()))?;

        let kind = PackageKind::of(package);
        let package = package.to_path_buf();
        let dest_dir = dest_dir.to_path_buf();
        let progress = self.progress.clone();
        let cancel = cancel.clone();

        debug!(package = %package.display(), ?kind, "Extracting package");
        let package_for_log = package.clone();
        tokio::task::spawn_blocking(move || match kind {
            PackageKind::Zip => extract_zip(&package, &dest_dir, &progress, &cancel),
            PackageKind::Gzip => extract_gzip(&package, &dest_dir, &progress, &cancel),
            PackageKind::Raw => copy_raw(&package, &dest_dir, &progress),
        })
        .await??;

        info!(package = %package_for_log.display(), "Package extracted");
        Ok(())
    }

    /// Extract several packages into the same destination.
    pub async fn extract_multiple(
        &self,
        packages: &[PathBuf],
        dest_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), UpdateError> {
        try_join_all(
            packages
                .iter()
                .map(|package| self.extract_package(package, dest_dir, cancel)),
        )
        .await?;
        Ok(())
    }

    /// Re-hash and size-check extracted files. Any mismatch fails the whole set.
    pub async fn validate_extracted_files(
        &self,
        dir: &Path,
        expected: &[FileEntry],
    ) -> Result<bool, UpdateError> {
        for entry in expected {
            let path = dir.join(&entry.relative_path);
            let metadata = match tokio::fs::metadata(&path).await {
                Ok(metadata) => metadata,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!(path = %path.display(), "Extracted file missing");
                    return Ok(false);
                }
                Err(e) => return Err(e.into()),
            };
            if entry.size > 0 && metadata.len() != entry.size {
                debug!(
                    path = %path.display(),
                    expected = entry.size,
                    actual = metadata.len(),
                    "Extracted file size mismatch"
                );
                return Ok(false);
            }
            if !entry.hash.is_empty() {
                let actual = hash::hash_file(&path, HashAlgorithm::Md5).await?;
                if !hash::hashes_match(&entry.hash, &actual) {
                    debug!(path = %path.display(), "Extracted file hash mismatch");
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }
}

fn extract_zip(
    package: &Path,
    dest_dir: &Path,
    progress: &broadcast::Sender<ExtractionProgress>,
    cancel: &CancellationToken,
) -> Result<(), UpdateError> {
    let mut archive = zip::ZipArchive::new(BufReader::new(File::open(package)?))?;
    let total = archive.len() as u64;

    for index in 0..archive.len() {
        if cancel.is_cancelled() {
            info!(package = %package.display(), extracted = index, "Extraction cancelled");
            return Err(UpdateError::Cancelled);
        }

        let mut entry = archive.by_index(index)?;
        let Some(relative) = entry.enclosed_name() else {
            warn!(entry = entry.name(), "Skipping archive entry outside destination");
            continue;
        };
        let target = dest_dir.join(&relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut out = File::create(&target)?;
            std::io::copy(&mut entry, &mut out)?;
        }

        let _ = progress.send(ExtractionProgress::new(
            package,
            index as u64 + 1,
            total,
            relative.to_string_lossy(),
        ));
    }
    Ok(())
}

fn extract_gzip(
    package: &Path,
    dest_dir: &Path,
    progress: &broadcast::Sender<ExtractionProgress>,
    cancel: &CancellationToken,
) -> Result<(), UpdateError> {
    let output_name = package
        .file_stem()
        .ok_or_else(|| UpdateError::Extraction(format!("bad package name {}", package.display())))?;
    let input_size = std::fs::metadata(package)?.len();
    let target = dest_dir.join(output_name);
    let name = output_name.to_string_lossy().into_owned();

    let mut decoder = GzDecoder::new(BufReader::new(File::open(package)?));
    let mut out = File::create(&target)?;
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    let mut written: u64 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(UpdateError::Cancelled);
        }
        let n = decoder.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        out.write_all(&buffer[..n])?;
        written += n as u64;
        let _ = progress.send(ExtractionProgress::new(package, written, input_size, name.clone()));
    }
    out.flush()?;

    let _ = progress.send(ExtractionProgress::new(package, input_size, input_size, name));
    Ok(())
}

fn copy_raw(
    package: &Path,
    dest_dir: &Path,
    progress: &broadcast::Sender<ExtractionProgress>,
) -> Result<(), UpdateError> {
    let file_name = package
        .file_name()
        .ok_or_else(|| UpdateError::Extraction(format!("bad package name {}", package.display())))?;
    let target = dest_dir.join(file_name);
    let copied = std::fs::copy(package, &target)?;
    let _ = progress.send(ExtractionProgress::new(
        package,
        copied,
        copied,
        file_name.to_string_lossy(),
    ));
    Ok(())
}
