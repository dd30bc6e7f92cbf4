//! Property-based tests for strata-updater.
//!
//! # Properties Tested
//!
//! - Property 1: Manifest parsing keeps every well-formed line and skips the rest
//! - Property 2: Batch status aggregation
//! - Property 3: Hash corruption detection
//! - Property 4: Update strategy ordering
//! - Property 5: Cache key sanitization

#![cfg(test)]

use std::collections::{BTreeMap, HashMap};

use chrono::Utc;
use proptest::prelude::*;
use tempfile::TempDir;

use crate::cache::sanitize_key;
use crate::channel::{CdnEndpoints, Channel};
use crate::download::{BatchStatus, DownloadStatus};
use crate::hash::{hash_bytes, hash_file_blocking, hashes_match, HashAlgorithm};
use crate::manifest::{is_compressed_name, parse_file_list, parse_package_manifest};
use crate::version::{determine_update_strategy, UpdateStrategy, Version};

// =============================================================================
// Generators
// =============================================================================

fn arb_package_name() -> impl Strategy<Value = String> {
    "[a-z]{1,8}\\.(zip|dll|exe|gz)"
}

fn arb_checksum() -> impl Strategy<Value = String> {
    "[0-9a-f]{32}"
}

/// A manifest line and whether it is well formed.
fn arb_manifest_line() -> impl Strategy<Value = (String, Option<(String, String, u64)>)> {
    prop_oneof![
        (arb_package_name(), arb_checksum(), any::<u32>()).prop_map(|(name, sum, size)| {
            let line = format!("{name} {sum} {size}");
            (line, Some((name, sum, size as u64)))
        }),
        (arb_package_name(), arb_checksum()).prop_map(|(name, sum)| {
            let line = format!("{name}\t{sum}");
            (line, Some((name, sum, 0)))
        }),
        "[a-z]{1,12}".prop_map(|token| (token, None)),
        Just((String::new(), None)),
    ]
}

fn arb_terminal_status() -> impl Strategy<Value = DownloadStatus> {
    prop_oneof![
        Just(DownloadStatus::Completed),
        Just(DownloadStatus::Failed),
        Just(DownloadStatus::Cancelled),
    ]
}

fn arb_algorithm() -> impl Strategy<Value = HashAlgorithm> {
    prop_oneof![
        Just(HashAlgorithm::Md5),
        Just(HashAlgorithm::Sha1),
        Just(HashAlgorithm::Sha256),
        Just(HashAlgorithm::Sha512),
    ]
}

// =============================================================================
// Helper Functions
// =============================================================================

fn version_with_files(hash: &str, total_size: u64, files: BTreeMap<String, String>) -> Version {
    Version {
        version_hash: hash.to_string(),
        channel: Channel::Live,
        is_studio: false,
        resolved_at: Utc::now(),
        total_size,
        required_files: files.keys().cloned().collect(),
        file_hashes: files,
        previous_version: None,
        metadata: BTreeMap::new(),
    }
}

/// `total` files of which the first `changed` are new in latest and every
/// other one carries a different hash.
fn file_sets(total: usize, changed: usize) -> (BTreeMap<String, String>, BTreeMap<String, String>) {
    let current = (0..total)
        .map(|i| (format!("pkg{i}"), format!("{i:032x}")))
        .collect();
    let latest = (0..total)
        .map(|i| {
            let name = if i < changed { format!("added{i}") } else { format!("pkg{i}") };
            (name, format!("f{i:031x}"))
        })
        .collect();
    (current, latest)
}

// =============================================================================
// Property 1: Manifest parsing
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Every line with at least two fields becomes a package (the last one
    /// wins on duplicate names); every other line is skipped.
    #[test]
    fn prop_manifest_keeps_well_formed_lines(
        lines in prop::collection::vec(arb_manifest_line(), 0..30),
    ) {
        let content: String = lines.iter().map(|(l, _)| format!("{l}\n")).collect();
        let endpoints = CdnEndpoints::new("https://cdn.test");
        let deployment = parse_package_manifest(&content, "v1", &endpoints);

        let mut expected: HashMap<String, (String, u64)> = HashMap::new();
        for (_, parsed) in &lines {
            if let Some((name, sum, size)) = parsed {
                expected.insert(name.clone(), (sum.clone(), *size));
            }
        }

        prop_assert_eq!(deployment.packages.len(), expected.len());
        for (name, (sum, size)) in &expected {
            let package = &deployment.packages[name];
            prop_assert_eq!(&package.checksum, sum);
            prop_assert_eq!(package.size, *size);
            prop_assert_eq!(package.download_url.clone(), format!("https://cdn.test/v1-{name}"));
        }
    }

    /// Compression is decided by the file name alone.
    #[test]
    fn prop_file_list_compression_flag(
        entries in prop::collection::vec((arb_package_name(), arb_checksum(), any::<u32>()), 0..20),
    ) {
        let content: String = entries
            .iter()
            .map(|(path, hash, size)| format!("{path}\t{hash}\t{size}\n"))
            .collect();
        let files = parse_file_list(&content);
        for entry in files.values() {
            prop_assert_eq!(entry.is_compressed, is_compressed_name(&entry.relative_path));
        }
    }
}

// =============================================================================
// Property 2: Batch status aggregation
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_batch_status_aggregation(
        statuses in prop::collection::vec(arb_terminal_status(), 0..20),
    ) {
        let completed = statuses.iter().filter(|s| **s == DownloadStatus::Completed).count();
        let status = BatchStatus::aggregate(statuses.iter().copied());

        if completed == statuses.len() {
            prop_assert_eq!(status, BatchStatus::Completed);
        } else if completed == 0 {
            prop_assert_eq!(status, BatchStatus::Failed);
        } else {
            prop_assert_eq!(status, BatchStatus::PartiallyCompleted);
        }
    }
}

// =============================================================================
// Property 3: Hash corruption detection
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    /// Flipping any bit of a file changes its digest.
    #[test]
    fn prop_corrupted_byte_detected(
        content in prop::collection::vec(any::<u8>(), 1..4096),
        index in any::<prop::sample::Index>(),
        flip in 1u8..=255,
        algorithm in arb_algorithm(),
    ) {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("package.bin");
        std::fs::write(&path, &content).unwrap();

        let expected = hash_bytes(&content, algorithm);
        let actual = hash_file_blocking(&path, algorithm).unwrap();
        prop_assert!(hashes_match(&expected, &actual));
        prop_assert!(hashes_match(&expected.to_uppercase(), &actual));

        let mut corrupted = content.clone();
        let i = index.index(corrupted.len());
        corrupted[i] ^= flip;
        std::fs::write(&path, &corrupted).unwrap();

        let actual = hash_file_blocking(&path, algorithm).unwrap();
        prop_assert!(!hashes_match(&expected, &actual));
    }
}

// =============================================================================
// Property 4: Update strategy ordering
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Cheaper strategies win whenever their condition holds.
    #[test]
    fn prop_strategy_ordering(
        intermediates in 0usize..20,
        intermediate_size in 0u64..1000,
        latest_size in 1u64..5000,
        total_files in 1usize..20,
        changed_ratio in 0.0f64..=1.0,
    ) {
        let changed = ((total_files as f64) * changed_ratio).floor() as usize;
        let (current_files, latest_files) = file_sets(total_files, changed);
        let current = version_with_files("current", latest_size, current_files);
        let latest = version_with_files("latest", latest_size, latest_files);
        let between: Vec<Version> = (0..intermediates)
            .map(|i| version_with_files(&format!("i{i}"), intermediate_size, BTreeMap::new()))
            .collect();

        let strategy = determine_update_strategy(Some(&current), &latest, &between);
        let summed = intermediate_size * intermediates as u64;

        let expected = if intermediates == 0 {
            UpdateStrategy::FullDownload
        } else if intermediates <= 3 && summed * 10 < latest_size * 7 {
            UpdateStrategy::IncrementalPatch
        } else if changed * 10 < total_files * 3 {
            UpdateStrategy::DeltaPatch
        } else if intermediates > 10 {
            UpdateStrategy::FastForward
        } else {
            UpdateStrategy::FullDownload
        };
        prop_assert_eq!(strategy, expected);

        prop_assert_eq!(
            determine_update_strategy(None, &latest, &between),
            UpdateStrategy::FullDownload
        );
    }
}

// =============================================================================
// Property 5: Cache key sanitization
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_sanitized_keys_are_file_names(key in "\\PC{0,40}") {
        let sanitized = sanitize_key(&key);
        prop_assert!(!sanitized.is_empty());
        prop_assert!(!sanitized
            .chars()
            .any(|c| c.is_control() || "<>:\"/\\|?*".contains(c)));
        prop_assert_eq!(sanitize_key(&sanitized), sanitized.clone());
    }

    #[test]
    fn prop_valid_keys_unchanged(key in "[a-zA-Z0-9_.-]{1,40}") {
        prop_assert_eq!(sanitize_key(&key), key);
    }
}
