//! Content hashing.
//!
//! Digests are rendered as lowercase hex and compared case-insensitively
//! in constant time. MD5 is the default because deployment manifests
//! publish MD5 checksums.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::Digest;
use subtle::ConstantTimeEq;

use crate::error::UpdateError;

/// Buffer size for reading files during hash computation.
const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Supported digest algorithms.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    #[default]
    Md5,
    Sha1,
    Sha256,
    Sha512,
}

impl HashAlgorithm {
    /// Length of the hex digest.
    pub fn hex_len(self) -> usize {
        match self {
            HashAlgorithm::Md5 => 32,
            HashAlgorithm::Sha1 => 40,
            HashAlgorithm::Sha256 => 64,
            HashAlgorithm::Sha512 => 128,
        }
    }
}

impl std::fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            HashAlgorithm::Md5 => "md5",
            HashAlgorithm::Sha1 => "sha1",
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha512 => "sha512",
        };
        f.write_str(name)
    }
}

/// Hash everything `reader` yields.
pub fn hash_reader(reader: impl Read, algorithm: HashAlgorithm) -> std::io::Result<String> {
    match algorithm {
        HashAlgorithm::Md5 => digest_reader::<md5::Md5>(reader),
        HashAlgorithm::Sha1 => digest_reader::<sha1::Sha1>(reader),
        HashAlgorithm::Sha256 => digest_reader::<sha2::Sha256>(reader),
        HashAlgorithm::Sha512 => digest_reader::<sha2::Sha512>(reader),
    }
}

fn digest_reader<D: Digest>(mut reader: impl Read) -> std::io::Result<String> {
    let mut hasher = D::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Hash an in-memory buffer.
pub fn hash_bytes(data: &[u8], algorithm: HashAlgorithm) -> String {
    // Reading from a slice cannot fail.
    hash_reader(data, algorithm).unwrap_or_default()
}

/// Hash a file synchronously. Prefer [`hash_file`] from async code.
pub fn hash_file_blocking(path: &Path, algorithm: HashAlgorithm) -> Result<String, UpdateError> {
    let file = File::open(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => UpdateError::NotFound(path.display().to_string()),
        _ => UpdateError::Io(e),
    })?;
    Ok(hash_reader(file, algorithm)?)
}

/// Hash a file on the blocking thread pool.
pub async fn hash_file(path: &Path, algorithm: HashAlgorithm) -> Result<String, UpdateError> {
    let path: PathBuf = path.to_path_buf();
    tokio::task::spawn_blocking(move || hash_file_blocking(&path, algorithm)).await?
}

/// Compare two hex digests, ignoring case, in constant time.
pub fn hashes_match(expected: &str, actual: &str) -> bool {
    let expected = expected.trim().to_ascii_lowercase();
    let actual = actual.trim().to_ascii_lowercase();
    expected.len() == actual.len() && bool::from(expected.as_bytes().ct_eq(actual.as_bytes()))
}
