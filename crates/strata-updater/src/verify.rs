//! Integrity verification of downloaded and installed files.
//!
//! Hash computations run on the blocking pool, at most a fixed number at
//! a time regardless of how many callers fan out. Verification never
//! fails with an error: a missing or unreadable file is reported as an
//! invalid [`VerificationResult`] with the reason attached.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::{broadcast, Semaphore};
use tracing::{debug, warn};

use crate::error::UpdateError;
use crate::hash::{self, HashAlgorithm};
use crate::manifest::{Deployment, FileEntry};

const PROGRESS_CHANNEL_CAPACITY: usize = 256;

/// Outcome of verifying one file.
#[derive(Debug, Clone, Serialize)]
pub struct VerificationResult {
    pub path: PathBuf,
    pub expected_hash: String,
    pub actual_hash: Option<String>,
    pub algorithm: HashAlgorithm,
    pub is_valid: bool,
    pub file_size: u64,
    pub error: Option<String>,
}

/// Progress of a multi-file verification.
#[derive(Debug, Clone, Serialize)]
pub struct VerificationProgress {
    pub total_files: usize,
    pub verified_files: usize,
    pub percentage: f64,
    pub current_file: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum QuarantineSeverity {
    None,
    Low,
    Medium,
    High,
    Critical,
}

/// Quarantine classification of a single file.
#[derive(Debug, Clone, Serialize)]
pub struct QuarantineDecision {
    pub path: PathBuf,
    pub should_quarantine: bool,
    pub severity: QuarantineSeverity,
    pub reason: String,
    pub file_size: u64,
    pub file_hash: Option<String>,
}

/// Computes and compares content hashes under bounded concurrency.
pub struct IntegrityVerifier {
    semaphore: Arc<Semaphore>,
    progress: broadcast::Sender<VerificationProgress>,
}

impl IntegrityVerifier {
    /// Create a verifier running at most `max_concurrent` hash computations.
    pub fn new(max_concurrent: usize) -> Self {
        let (progress, _) = broadcast::channel(PROGRESS_CHANNEL_CAPACITY);
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            progress,
        }
    }

    /// Subscribe to progress of [`IntegrityVerifier::verify_many`] calls.
    pub fn subscribe(&self) -> broadcast::Receiver<VerificationProgress> {
        self.progress.subscribe()
    }

    /// Verify one file against `expected_hash`.
    pub async fn verify_file(
        &self,
        path: &Path,
        expected_hash: &str,
        algorithm: HashAlgorithm,
    ) -> VerificationResult {
        let mut result = VerificationResult {
            path: path.to_path_buf(),
            expected_hash: expected_hash.to_string(),
            actual_hash: None,
            algorithm,
            is_valid: false,
            file_size: 0,
            error: None,
        };

        let metadata = match tokio::fs::metadata(path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                result.error = Some("File not found".to_string());
                return result;
            }
            Err(e) => {
                result.error = Some(e.to_string());
                return result;
            }
        };
        result.file_size = metadata.len();

        let _permit = match self.semaphore.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                result.error = Some("verifier is shutting down".to_string());
                return result;
            }
        };
        match hash::hash_file(path, algorithm).await {
            Ok(actual) => {
                result.is_valid = hash::hashes_match(expected_hash, &actual);
                if !result.is_valid {
                    debug!(
                        path = %path.display(),
                        expected = %expected_hash,
                        actual = %actual,
                        "Hash mismatch"
                    );
                    result.error = Some("Hash mismatch".to_string());
                }
                result.actual_hash = Some(actual);
            }
            Err(e) => result.error = Some(e.to_string()),
        }
        result
    }

    /// Verify many files concurrently, publishing progress after each one.
    pub async fn verify_many(
        &self,
        files: Vec<(PathBuf, String)>,
        algorithm: HashAlgorithm,
    ) -> Vec<VerificationResult> {
        let total = files.len();
        let verified = AtomicUsize::new(0);

        let checks = files.into_iter().map(|(path, expected)| {
            let verified = &verified;
            async move {
                let result = self.verify_file(&path, &expected, algorithm).await;
                let done = verified.fetch_add(1, Ordering::SeqCst) + 1;
                let _ = self.progress.send(VerificationProgress {
                    total_files: total,
                    verified_files: done,
                    percentage: done as f64 * 100.0 / total as f64,
                    current_file: path,
                });
                result
            }
        });
        join_all(checks).await
    }

    /// Verify every package of `deployment` under `install_dir` with MD5.
    pub async fn verify_deployment(&self, deployment: &Deployment, install_dir: &Path) -> bool {
        let files = deployment
            .packages
            .values()
            .map(|p| (install_dir.join(&p.name), p.checksum.clone()))
            .collect();
        let results = self.verify_many(files, HashAlgorithm::Md5).await;
        log_failures(&results);
        results.iter().all(|r| r.is_valid)
    }

    /// Verify the listed files under `dir`. Entries without a hash are skipped.
    pub async fn verify_directory(&self, dir: &Path, expected: &[FileEntry]) -> bool {
        let files = expected
            .iter()
            .filter(|f| !f.hash.is_empty())
            .map(|f| (dir.join(&f.relative_path), f.hash.clone()))
            .collect();
        let results = self.verify_many(files, HashAlgorithm::Md5).await;
        log_failures(&results);
        results.iter().all(|r| r.is_valid)
    }

    /// Classify a file for quarantine. This is a size heuristic, not a scanner.
    pub async fn analyze_for_quarantine(&self, path: &Path) -> QuarantineDecision {
        let mut decision = QuarantineDecision {
            path: path.to_path_buf(),
            should_quarantine: false,
            severity: QuarantineSeverity::None,
            reason: String::new(),
            file_size: 0,
            file_hash: None,
        };

        let metadata = match tokio::fs::metadata(path).await {
            Ok(metadata) => metadata,
            Err(_) => {
                decision.should_quarantine = true;
                decision.severity = QuarantineSeverity::High;
                decision.reason = "File not found".to_string();
                return decision;
            }
        };
        decision.file_size = metadata.len();

        if metadata.len() == 0 {
            decision.should_quarantine = true;
            decision.severity = QuarantineSeverity::Medium;
            decision.reason = "File is empty".to_string();
            return decision;
        }

        let hashed = match self.semaphore.acquire().await {
            Ok(_permit) => hash::hash_file(path, HashAlgorithm::Sha256).await,
            Err(_) => Err(UpdateError::Cancelled),
        };
        match hashed {
            Ok(digest) => {
                decision.file_hash = Some(digest);
                decision.reason = "File appears valid".to_string();
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Quarantine hash failed");
                decision.reason = format!("File could not be hashed: {e}");
            }
        }
        decision
    }
}

fn log_failures(results: &[VerificationResult]) {
    for result in results.iter().filter(|r| !r.is_valid) {
        warn!(
            path = %result.path.display(),
            reason = result.error.as_deref().unwrap_or("unknown"),
            "Verification failed"
        );
    }
}
