//! Release channels and CDN endpoint layout.
//!
//! # Channels
//!
//! Each channel publishes its own latest-version pointer under a fixed
//! URL prefix on the CDN:
//! - **Live**, **ZIntegration**, **ZNext**: `version-`
//! - **ZCanary**, **Studio**, **StudioCanary**: `versionQTStudio-`
//!
//! Packages, file lists and the deploy history are shared across channels
//! and addressed by version hash only.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::UpdateError;

/// Release track with its own latest version and URL prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// Production releases
    Live,
    /// Early builds of the studio client
    ZCanary,
    /// Integration test track
    ZIntegration,
    /// Next release candidate
    ZNext,
    /// Studio production releases
    Studio,
    /// Studio early builds
    StudioCanary,
}

impl Channel {
    /// Every known channel, in declaration order.
    pub const ALL: [Channel; 6] = [
        Channel::Live,
        Channel::ZCanary,
        Channel::ZIntegration,
        Channel::ZNext,
        Channel::Studio,
        Channel::StudioCanary,
    ];

    /// URL prefix of the latest-version pointer for this channel.
    pub fn url_prefix(self) -> &'static str {
        match self {
            Channel::Live | Channel::ZIntegration | Channel::ZNext => "version-",
            Channel::ZCanary | Channel::Studio | Channel::StudioCanary => "versionQTStudio-",
        }
    }

    /// Whether versions on this channel are studio builds.
    pub fn is_studio(self) -> bool {
        matches!(self, Channel::Studio | Channel::StudioCanary)
    }

    /// Canonical lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            Channel::Live => "live",
            Channel::ZCanary => "zcanary",
            Channel::ZIntegration => "zintegration",
            Channel::ZNext => "znext",
            Channel::Studio => "studio",
            Channel::StudioCanary => "studiocanary",
        }
    }

    /// Guess the channel a CDN URL belongs to.
    ///
    /// Falls back to [`Channel::Live`] when nothing in the URL identifies
    /// another track.
    pub fn from_url(url: &str) -> Channel {
        let lower = url.to_ascii_lowercase();
        if lower.contains("versionqtstudio") {
            if lower.contains("canary") {
                Channel::StudioCanary
            } else {
                Channel::Studio
            }
        } else if lower.contains("zcanary") {
            Channel::ZCanary
        } else if lower.contains("zintegration") {
            Channel::ZIntegration
        } else if lower.contains("znext") {
            Channel::ZNext
        } else {
            Channel::Live
        }
    }
}

impl Default for Channel {
    fn default() -> Self {
        Channel::Live
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = UpdateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Channel::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| UpdateError::InvalidChannel(s.to_string()))
    }
}

/// Extract the hex version hash that follows `version-` in a URL.
pub fn extract_version_from_url(url: &str) -> Option<String> {
    let start = url.find("version-")? + "version-".len();
    let hash: String = url[start..]
        .chars()
        .take_while(|c| matches!(c, '0'..='9' | 'a'..='f'))
        .collect();
    if hash.is_empty() {
        None
    } else {
        Some(hash)
    }
}

/// URL layout of a deployment CDN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CdnEndpoints {
    base_url: String,
}

impl CdnEndpoints {
    /// Create endpoints rooted at `base_url` (a trailing slash is ignored).
    pub fn new(base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self { base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `{cdn}/{prefix}`: plain-text latest version hash.
    pub fn latest_version_url(&self, channel: Channel) -> String {
        format!("{}/{}", self.base_url, channel.url_prefix())
    }

    /// `{cdn}/{prefix}{hash}-rbxPkgManifest.txt`
    pub fn manifest_url(&self, version_hash: &str, channel: Channel) -> String {
        format!(
            "{}/{}{}-rbxPkgManifest.txt",
            self.base_url,
            channel.url_prefix(),
            version_hash
        )
    }

    /// `{cdn}/{hash}-{package}`
    pub fn package_url(&self, version_hash: &str, package_name: &str) -> String {
        format!("{}/{}-{}", self.base_url, version_hash, package_name)
    }

    /// `{cdn}/{hash}-{package}.txt`
    pub fn file_list_url(&self, version_hash: &str, package_name: &str) -> String {
        format!("{}/{}-{}.txt", self.base_url, version_hash, package_name)
    }

    /// `{cdn}/DeployHistory.txt`
    pub fn deploy_history_url(&self) -> String {
        format!("{}/DeployHistory.txt", self.base_url)
    }
}
