//! Client for the local configuration service.
//!
//! Payloads are opaque JSON. Every response is wrapped in the same
//! `{ success, data, error }` envelope.

use reqwest::{Client, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::UpdateError;

pub const DEFAULT_CONFIG_SERVICE_URL: &str = "http://127.0.0.1:8080/api";

/// Response envelope of the config service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    #[serde(default)]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn into_result(self) -> Result<Option<T>, UpdateError> {
        if self.success {
            Ok(self.data)
        } else {
            Err(UpdateError::ConfigService(
                self.error.unwrap_or_else(|| "request was not successful".into()),
            ))
        }
    }
}

pub struct ConfigServiceClient {
    client: Client,
    base_url: String,
}

impl ConfigServiceClient {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, UpdateError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| UpdateError::Config(format!("invalid config service url: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| UpdateError::Config("config service url cannot have a path".into()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn decode<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<Option<T>, UpdateError> {
        let status = response.status();
        let url = response.url().to_string();
        let body = response.text().await?;
        match serde_json::from_str::<ApiResponse<T>>(&body) {
            Ok(envelope) => envelope.into_result(),
            Err(_) if !status.is_success() => Err(UpdateError::Network {
                url,
                status: status.as_u16(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn get<T: DeserializeOwned>(&self, segments: &[&str]) -> Result<Option<T>, UpdateError> {
        let url = self.endpoint(segments)?;
        debug!(%url, "Config service GET");
        let response = self.client.get(url).send().await?;
        Self::decode(response).await
    }

    async fn post<B: Serialize + ?Sized>(
        &self,
        segments: &[&str],
        body: &B,
    ) -> Result<(), UpdateError> {
        let url = self.endpoint(segments)?;
        debug!(%url, "Config service POST");
        let response = self.client.post(url).json(body).send().await?;
        Self::decode::<Value>(response).await.map(|_| ())
    }

    pub async fn get_installations(&self) -> Result<Value, UpdateError> {
        Ok(self.get(&["installations"]).await?.unwrap_or(Value::Null))
    }

    pub async fn get_config(&self, profile: &str) -> Result<Value, UpdateError> {
        Ok(self.get(&["config", profile]).await?.unwrap_or(Value::Null))
    }

    pub async fn save_config(&self, profile: &str, config: &Value) -> Result<(), UpdateError> {
        self.post(&["config", profile], config).await
    }

    pub async fn apply_config(&self, config: &Value) -> Result<(), UpdateError> {
        self.post(&["apply"], config).await
    }

    pub async fn list_profiles(&self) -> Result<Vec<String>, UpdateError> {
        Ok(self.get(&["profiles"]).await?.unwrap_or_default())
    }

    pub async fn get_flags(&self) -> Result<Value, UpdateError> {
        Ok(self.get(&["flags"]).await?.unwrap_or(Value::Null))
    }

    pub async fn set_flags(&self, flags: &Value) -> Result<(), UpdateError> {
        self.post(&["flags"], flags).await
    }
}

impl Default for ConfigServiceClient {
    fn default() -> Self {
        Self::new(Client::new(), DEFAULT_CONFIG_SERVICE_URL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use serde_json::json;

    fn client_for(server: &mockito::ServerGuard) -> ConfigServiceClient {
        ConfigServiceClient::new(Client::new(), format!("{}/api", server.url()))
    }

    #[test]
    fn test_default_base_url() {
        assert_eq!(ConfigServiceClient::default().base_url(), DEFAULT_CONFIG_SERVICE_URL);
    }

    #[test]
    fn test_envelope_failure_maps_to_error() {
        let envelope: ApiResponse<Value> = ApiResponse {
            success: false,
            data: None,
            error: Some("profile locked".into()),
        };
        match envelope.into_result() {
            Err(UpdateError::ConfigService(message)) => assert_eq!(message, "profile locked"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_get_config_by_profile() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/api/config/low%20end")
            .with_status(200)
            .with_body(r#"{"success":true,"data":{"graphics":3}}"#)
            .create_async()
            .await;

        let client = client_for(&server);
        let config = client.get_config("low end").await.unwrap();
        assert_eq!(config, json!({"graphics": 3}));
    }

    #[tokio::test]
    async fn test_save_config_posts_json() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/config/default")
            .match_body(Matcher::Json(json!({"volume": 7})))
            .with_status(200)
            .with_body(r#"{"success":true}"#)
            .create_async()
            .await;

        let client = client_for(&server);
        client.save_config("default", &json!({"volume": 7})).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_service_error_is_reported() {
        let mut server = mockito::Server::new_async().await;
        let _flags = server
            .mock("POST", "/api/flags")
            .with_status(400)
            .with_body(r#"{"success":false,"error":"unknown flag"}"#)
            .create_async()
            .await;
        let _apply = server
            .mock("POST", "/api/apply")
            .with_status(502)
            .with_body("bad gateway")
            .create_async()
            .await;

        let client = client_for(&server);
        let err = client.set_flags(&json!({"x": true})).await.unwrap_err();
        assert!(matches!(err, UpdateError::ConfigService(ref m) if m == "unknown flag"));

        let err = client.apply_config(&json!({})).await.unwrap_err();
        assert!(matches!(err, UpdateError::Network { status: 502, .. }));
    }

    #[tokio::test]
    async fn test_list_profiles_and_installations() {
        let mut server = mockito::Server::new_async().await;
        let _profiles = server
            .mock("GET", "/api/profiles")
            .with_body(r#"{"success":true,"data":["default","low"]}"#)
            .create_async()
            .await;
        let _installs = server
            .mock("GET", "/api/installations")
            .with_body(r#"{"success":true,"data":null}"#)
            .create_async()
            .await;

        let client = client_for(&server);
        assert_eq!(client.list_profiles().await.unwrap(), vec!["default", "low"]);
        assert_eq!(client.get_installations().await.unwrap(), Value::Null);
    }
}
