//! Manifest resolution against the deployment CDN.
//!
//! Every request goes through one shared semaphore so the resolver never
//! has more than a fixed number of requests outstanding upstream.

use std::collections::BTreeMap;
use std::future::Future;

use futures_util::stream::{self, StreamExt};
use reqwest::Client;
use tokio::sync::Semaphore;
use tracing::{debug, instrument, warn};

use crate::channel::{CdnEndpoints, Channel};
use crate::error::UpdateError;
use crate::manifest::{self, Deployment, FileEntry};

/// Fetches and parses deployment metadata.
#[derive(Debug)]
pub struct ManifestResolver {
    client: Client,
    endpoints: CdnEndpoints,
    limiter: Semaphore,
    max_concurrent: usize,
}

impl ManifestResolver {
    /// Create a resolver allowing at most `max_concurrent` outstanding requests.
    pub fn new(client: Client, endpoints: CdnEndpoints, max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            client,
            endpoints,
            limiter: Semaphore::new(max_concurrent),
            max_concurrent,
        }
    }

    pub fn endpoints(&self) -> &CdnEndpoints {
        &self.endpoints
    }

    /// Acquire a permit and run `request` with a handle to the shared client.
    async fn run_with_permit<F, Fut, T>(&self, request: F) -> Result<T, UpdateError>
    where
        F: FnOnce(Client) -> Fut,
        Fut: Future<Output = Result<T, UpdateError>>,
    {
        let _permit = self
            .limiter
            .acquire()
            .await
            .map_err(|_| UpdateError::ConcurrencyTimeout("resolver request slot".into()))?;
        request(self.client.clone()).await
    }

    /// GET `url` and return the body, failing on a non-success status.
    async fn fetch_text(&self, url: &str) -> Result<String, UpdateError> {
        self.run_with_permit(|client| async move {
            let response = client.get(url).send().await?;
            let status = response.status();
            if !status.is_success() {
                return Err(UpdateError::Network {
                    url: url.to_string(),
                    status: status.as_u16(),
                });
            }
            Ok(response.text().await?)
        })
        .await
    }

    /// Hash of the latest version published on `channel`.
    #[instrument(skip(self))]
    pub async fn latest_version_hash(&self, channel: Channel) -> Result<String, UpdateError> {
        let url = self.endpoints.latest_version_url(channel);
        let body = self.fetch_text(&url).await?;
        let hash = body.trim().to_string();
        if hash.is_empty() {
            return Err(UpdateError::Parse(format!("empty version pointer at {url}")));
        }
        debug!(%channel, version = %hash, "Resolved latest version");
        Ok(hash)
    }

    /// Package manifest of `version_hash`.
    #[instrument(skip(self))]
    pub async fn deployment_manifest(
        &self,
        version_hash: &str,
        channel: Channel,
    ) -> Result<Deployment, UpdateError> {
        let url = self.endpoints.manifest_url(version_hash, channel);
        let body = self.fetch_text(&url).await?;
        let deployment = manifest::parse_package_manifest(&body, version_hash, &self.endpoints);
        debug!(
            version = %version_hash,
            packages = deployment.packages.len(),
            "Parsed deployment manifest"
        );
        Ok(deployment)
    }

    /// File list of one package. Best effort: any failure yields an empty list.
    pub async fn package_file_list(
        &self,
        version_hash: &str,
        package_name: &str,
    ) -> BTreeMap<String, FileEntry> {
        let url = self.endpoints.file_list_url(version_hash, package_name);
        match self.fetch_text(&url).await {
            Ok(body) => manifest::parse_file_list(&body),
            Err(UpdateError::Network { status, .. }) => {
                debug!(%url, status, "No file list published");
                BTreeMap::new()
            }
            Err(e) => {
                warn!(%url, error = %e, "Failed to fetch file list");
                BTreeMap::new()
            }
        }
    }

    /// Fill in the file list of every package of `deployment`.
    pub async fn attach_file_lists(&self, deployment: &mut Deployment) {
        let version_hash = deployment.version_hash.clone();
        let names = deployment.package_names();
        let lists: Vec<(String, BTreeMap<String, FileEntry>)> = stream::iter(names)
            .map(|name| {
                let version_hash = version_hash.as_str();
                async move {
                    let files = self.package_file_list(version_hash, &name).await;
                    (name, files)
                }
            })
            .buffer_unordered(self.max_concurrent)
            .collect()
            .await;

        for (name, files) in lists {
            if let Some(package) = deployment.packages.get_mut(&name) {
                package.files = files;
            }
        }
    }

    /// Deploy history, most recent first.
    #[instrument(skip(self))]
    pub async fn deploy_history(&self) -> Result<Vec<String>, UpdateError> {
        let url = self.endpoints.deploy_history_url();
        let body = self.fetch_text(&url).await?;
        Ok(manifest::parse_deploy_history(&body))
    }

    /// Whether a manifest for `version_hash` is published. Never fails.
    pub async fn validate_version_exists(&self, version_hash: &str, channel: Channel) -> bool {
        let url = self.endpoints.manifest_url(version_hash, channel);
        let result = self
            .run_with_permit(|client| async move { Ok(client.head(&url).send().await?) })
            .await;
        match result {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(version = %version_hash, error = %e, "Version existence check failed");
                false
            }
        }
    }

    pub fn package_url(&self, version_hash: &str, package_name: &str) -> String {
        self.endpoints.package_url(version_hash, package_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver_for(server: &mockito::ServerGuard) -> ManifestResolver {
        ManifestResolver::new(Client::new(), CdnEndpoints::new(server.url()), 2)
    }

    #[tokio::test]
    async fn test_latest_version_hash_trims() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/versionQTStudio-")
            .with_status(200)
            .with_body("  abc123\r\n")
            .create_async()
            .await;

        let resolver = resolver_for(&server);
        let hash = resolver.latest_version_hash(Channel::Studio).await.unwrap();
        assert_eq!(hash, "abc123");
    }

    #[tokio::test]
    async fn test_latest_version_hash_non_success_is_network_error() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/version-")
            .with_status(503)
            .create_async()
            .await;

        let resolver = resolver_for(&server);
        let result = resolver.latest_version_hash(Channel::Live).await;
        assert!(matches!(result, Err(UpdateError::Network { status: 503, .. })));
    }

    #[tokio::test]
    async fn test_deployment_manifest() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/version-abc-rbxPkgManifest.txt")
            .with_status(200)
            .with_body("app.zip 0123 10\nbad\nlauncher.exe 4567 20\n")
            .create_async()
            .await;

        let resolver = resolver_for(&server);
        let deployment = resolver.deployment_manifest("abc", Channel::Live).await.unwrap();
        assert_eq!(deployment.packages.len(), 2);
        assert_eq!(deployment.total_size(), 30);
        assert_eq!(
            deployment.packages["app.zip"].download_url,
            format!("{}/abc-app.zip", server.url())
        );
    }

    #[tokio::test]
    async fn test_file_list_missing_is_empty() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/abc-app.zip.txt")
            .with_status(404)
            .create_async()
            .await;

        let resolver = resolver_for(&server);
        assert!(resolver.package_file_list("abc", "app.zip").await.is_empty());
    }

    #[tokio::test]
    async fn test_attach_file_lists() {
        let mut server = mockito::Server::new_async().await;
        let _manifest = server
            .mock("GET", "/version-abc-rbxPkgManifest.txt")
            .with_status(200)
            .with_body("app.zip 0123 10\nextra.zip 4567 20\n")
            .create_async()
            .await;
        let _list = server
            .mock("GET", "/abc-app.zip.txt")
            .with_status(200)
            .with_body("bin/app.exe\tfeed\t7\n")
            .create_async()
            .await;
        let _missing = server
            .mock("GET", "/abc-extra.zip.txt")
            .with_status(404)
            .create_async()
            .await;

        let resolver = resolver_for(&server);
        let mut deployment = resolver.deployment_manifest("abc", Channel::Live).await.unwrap();
        resolver.attach_file_lists(&mut deployment).await;

        assert_eq!(deployment.packages["app.zip"].files.len(), 1);
        assert!(deployment.packages["extra.zip"].files.is_empty());
    }

    #[tokio::test]
    async fn test_deploy_history() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/DeployHistory.txt")
            .with_status(200)
            .with_body("c3\nb2\n\na1\n")
            .create_async()
            .await;

        let resolver = resolver_for(&server);
        assert_eq!(resolver.deploy_history().await.unwrap(), vec!["c3", "b2", "a1"]);
    }

    #[tokio::test]
    async fn test_validate_version_exists() {
        let mut server = mockito::Server::new_async().await;
        let _ok = server
            .mock("HEAD", "/version-good-rbxPkgManifest.txt")
            .with_status(200)
            .create_async()
            .await;
        let _missing = server
            .mock("HEAD", "/version-gone-rbxPkgManifest.txt")
            .with_status(404)
            .create_async()
            .await;

        let resolver = resolver_for(&server);
        assert!(resolver.validate_version_exists("good", Channel::Live).await);
        assert!(!resolver.validate_version_exists("gone", Channel::Live).await);

        let unreachable = ManifestResolver::new(
            Client::new(),
            CdnEndpoints::new("http://127.0.0.1:9"),
            1,
        );
        assert!(!unreachable.validate_version_exists("any", Channel::Live).await);
    }
}
