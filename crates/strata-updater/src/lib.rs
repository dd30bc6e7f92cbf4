//! # strata-updater
//!
//! Self-update client for software shipped as versioned, checksummed
//! packages over HTTP.
//!
//! This crate handles:
//! - Channel resolution and deployment manifest parsing
//! - Concurrent package downloads with retry and progress reporting
//! - MD5/SHA-1/SHA-256/SHA-512 integrity verification
//! - Zip, gzip and raw package installation into per-version directories
//! - An expiring, size-bounded content cache
//! - Version history and advisory update strategies
//!
//! ## Consistency
//!
//! The installed-version pointer is only rewritten after a version has been
//! downloaded, verified and fully extracted. A failed update leaves the
//! previous installation in place.

pub mod cache;
pub mod channel;
pub mod config;
pub mod config_service;
pub mod download;
pub mod error;
pub mod extract;
pub mod hash;
pub mod install;
pub mod manager;
pub mod manifest;
#[cfg(test)]
mod proptests;
pub mod resolver;
pub mod verify;
pub mod version;

// Re-export main types for convenience
pub use cache::{CacheEntry, CacheStats, ContentCache};
pub use channel::{CdnEndpoints, Channel};
pub use config::UpdateConfig;
pub use config_service::{ApiResponse, ConfigServiceClient};
pub use download::{
    BatchStatus, DownloadBatch, DownloadEvent, DownloadProgress, DownloadRequest,
    DownloadScheduler, DownloadStatus, DownloadTask, TaskHandle,
};
pub use error::{PipelineStep, UpdateError};
pub use extract::{ExtractionProgress, PackageExtractor};
pub use hash::HashAlgorithm;
pub use install::{InstallStore, InstalledVersion, InstalledVersionInfo};
pub use manager::{
    ScheduledCheckOutcome, UpdateEvent, UpdateManager, UpdateOutcome, UpdateProgress, UpdateState,
};
pub use manifest::{Deployment, FileEntry, PackageManifest};
pub use resolver::ManifestResolver;
pub use verify::{IntegrityVerifier, QuarantineDecision, QuarantineSeverity, VerificationResult};
pub use version::{UpdateCheckResult, UpdateStrategy, Version, VersionManager, VersionManifest};
