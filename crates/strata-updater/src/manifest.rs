//! Deployment manifests and their text formats.
//!
//! Three plain-text documents are published per deployment:
//!
//! - the package manifest, one `name checksum [size]` line per package
//! - an optional per-package file list, one `path\thash\tsize` line per file
//! - the deploy history, one version hash per line, most recent first
//!
//! Malformed lines are skipped rather than failing the whole document.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::channel::CdnEndpoints;

/// One package of a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageManifest {
    pub name: String,
    /// Hex checksum as published (MD5 for current deployments)
    pub checksum: String,
    /// Size in bytes, 0 when the manifest omits it
    pub size: u64,
    pub download_url: String,
    /// Files shipped inside the package, when a file list was fetched
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub files: BTreeMap<String, FileEntry>,
}

impl PackageManifest {
    /// Whether the package is an archive that gets unpacked on install.
    pub fn is_archive(&self) -> bool {
        is_compressed_name(&self.name)
    }
}

/// One file listed in a package file list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub relative_path: String,
    pub hash: String,
    pub size: u64,
    pub is_compressed: bool,
}

/// Resolved manifest of one version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub version_hash: String,
    pub packages: BTreeMap<String, PackageManifest>,
    pub retrieved_at: DateTime<Utc>,
}

impl Deployment {
    /// Sum of all package sizes.
    pub fn total_size(&self) -> u64 {
        self.packages.values().map(|p| p.size).sum()
    }

    pub fn package_names(&self) -> Vec<String> {
        self.packages.keys().cloned().collect()
    }
}

/// Parse a package manifest.
///
/// Later lines win when a package name repeats.
pub fn parse_package_manifest(
    content: &str,
    version_hash: &str,
    endpoints: &CdnEndpoints,
) -> Deployment {
    let mut packages = BTreeMap::new();

    for (line_no, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 2 {
            debug!(line = line_no + 1, "Skipping malformed manifest line");
            continue;
        }

        let name = fields[0].to_string();
        let size = fields.get(2).and_then(|s| s.parse().ok()).unwrap_or(0);
        let package = PackageManifest {
            download_url: endpoints.package_url(version_hash, &name),
            name: name.clone(),
            checksum: fields[1].to_string(),
            size,
            files: BTreeMap::new(),
        };
        packages.insert(name, package);
    }

    Deployment {
        version_hash: version_hash.to_string(),
        packages,
        retrieved_at: Utc::now(),
    }
}

/// Parse a tab-delimited package file list.
pub fn parse_file_list(content: &str) -> BTreeMap<String, FileEntry> {
    let mut files = BTreeMap::new();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 3 {
            continue;
        }

        let relative_path = fields[0].to_string();
        let entry = FileEntry {
            is_compressed: is_compressed_name(&relative_path),
            hash: fields[1].to_string(),
            size: fields[2].trim().parse().unwrap_or(0),
            relative_path: relative_path.clone(),
        };
        files.insert(relative_path, entry);
    }

    files
}

/// Parse the deploy history ledger into version hashes, most recent first.
pub fn parse_deploy_history(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Compression is inferred from the extension alone.
pub fn is_compressed_name(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.ends_with(".zip") || lower.ends_with(".gz")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints() -> CdnEndpoints {
        CdnEndpoints::new("https://cdn.example.com")
    }

    #[test]
    fn test_parse_manifest_lines() {
        let content = "\
RobloxApp.zip 9f0c1e2d3b4a59687766554433221100 4096
shaders.zip 00112233445566778899aabbccddeeff

content-fonts.zip abcdef0123456789abcdef0123456789 notanumber
";
        let deployment = parse_package_manifest(content, "abc123", &endpoints());
        assert_eq!(deployment.version_hash, "abc123");
        assert_eq!(deployment.packages.len(), 3);

        let app = &deployment.packages["RobloxApp.zip"];
        assert_eq!(app.size, 4096);
        assert_eq!(app.download_url, "https://cdn.example.com/abc123-RobloxApp.zip");
        assert!(app.is_archive());

        assert_eq!(deployment.packages["shaders.zip"].size, 0);
        assert_eq!(deployment.packages["content-fonts.zip"].size, 0);
        assert_eq!(deployment.total_size(), 4096);
    }

    #[test]
    fn test_parse_manifest_skips_malformed() {
        let content = "v0\nonlyname\n  \nlauncher.exe ffee 10\n";
        let deployment = parse_package_manifest(content, "h", &endpoints());
        assert_eq!(deployment.package_names(), vec!["launcher.exe".to_string()]);
    }

    #[test]
    fn test_parse_manifest_duplicate_last_wins() {
        let content = "a.zip 11 1\na.zip 22 2\n";
        let deployment = parse_package_manifest(content, "h", &endpoints());
        assert_eq!(deployment.packages.len(), 1);
        assert_eq!(deployment.packages["a.zip"].checksum, "22");
    }

    #[test]
    fn test_parse_file_list() {
        let content = "fonts/arial.ttf\taa11\t1024\nfonts/pack.zip\tbb22\tx\nbroken\tline\n";
        let files = parse_file_list(content);
        assert_eq!(files.len(), 2);

        let font = &files["fonts/arial.ttf"];
        assert_eq!(font.hash, "aa11");
        assert_eq!(font.size, 1024);
        assert!(!font.is_compressed);

        let pack = &files["fonts/pack.zip"];
        assert_eq!(pack.size, 0);
        assert!(pack.is_compressed);
    }

    #[test]
    fn test_parse_deploy_history() {
        let history = parse_deploy_history("  newest\n\nolder\r\noldest  \n");
        assert_eq!(history, vec!["newest", "older", "oldest"]);
    }

    #[test]
    fn test_is_compressed_name() {
        assert!(is_compressed_name("a.ZIP"));
        assert!(is_compressed_name("b.tar.gz"));
        assert!(!is_compressed_name("c.exe"));
    }
}
