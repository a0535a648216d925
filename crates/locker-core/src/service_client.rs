//! HTTP client for the locker API.
//!
//! [`ApiClient`] implements the HTTP-backed collaborators a session needs:
//! [`LockerDirectory`] for metadata, [`NetworkClient`] for the network
//! unlock path and [`KeyService`] for key issuing. Every request is a JSON
//! `POST` authenticated with a bearer token.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use locker_core::service_client::{ApiClient, ApiConfig};
//!
//! # async fn example() -> locker_core::Result<()> {
//! let api = Arc::new(ApiClient::new(
//!     ApiConfig::new("https://lockers.example.com/api").token("secret"),
//! )?);
//!
//! use locker_core::LockerDirectory;
//! let info = api.get_locker("secret", "locker-001").await?;
//! println!("network capable: {}", info.network_capable);
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use tracing::debug;

use locker_types::{Coordinates, LockerDevice, LockerInfo};

use crate::error::{Error, Result};
use crate::traits::{KeyService, LockerDirectory, NetworkClient};

/// Configuration for [`ApiClient`].
#[derive(Clone, PartialEq, Eq)]
pub struct ApiConfig {
    /// Base URL, e.g. `https://lockers.example.com/api`.
    pub base_url: String,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Token used for key requests, which carry no session token.
    pub token: Option<String>,
}

impl std::fmt::Debug for ApiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiConfig")
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl ApiConfig {
    /// Create a config for `base_url` with a 10 second timeout.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: Duration::from_secs(10),
            token: None,
        }
    }

    /// Set the request timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the token used for key requests.
    #[must_use]
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        let url = self.base_url.trim_end_matches('/');
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(Error::invalid_config(format!(
                "base_url must start with http:// or https://, got: {}",
                self.base_url
            )));
        }
        if self.timeout.is_zero() {
            return Err(Error::invalid_config("timeout must be greater than zero"));
        }
        Ok(())
    }
}

// ==========================================================================
// Request and response bodies
// ==========================================================================

#[derive(Debug, Serialize)]
struct LockerRequest<'a> {
    locker_id: &'a str,
}

#[derive(Debug, Serialize)]
struct UnlockRequest<'a> {
    locker_id: &'a str,
    lat: f64,
    lng: f64,
}

#[derive(Debug, Serialize)]
struct KeyRequest<'a> {
    locker_id: &'a str,
    read_data: &'a str,
}

#[derive(Debug, Deserialize)]
struct KeyResponse {
    key: String,
}

#[derive(Debug, Deserialize)]
struct Empty {}

/// Which error kind a failed request maps to.
#[derive(Debug, Clone, Copy)]
enum Domain {
    Network,
    Key,
}

impl Domain {
    fn error(self, message: String) -> Error {
        match self {
            Domain::Network => Error::NetworkFailed(message),
            Domain::Key => Error::KeyCapabilityFailed(message),
        }
    }
}

/// HTTP client for the locker API.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl ApiClient {
    /// Create a client from a config.
    pub fn new(config: ApiConfig) -> Result<Self> {
        config.validate()?;
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::invalid_config(format!("HTTP client: {}", e)))?;
        Self::with_client(config, client)
    }

    /// Create a client with a custom reqwest Client.
    pub fn with_client(config: ApiConfig, client: Client) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token,
        })
    }

    /// Get the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn post<B, T>(&self, domain: Domain, path: &str, token: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.url(path);
        debug!(%url, "POST");

        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(body)
            .send()
            .await
            .map_err(|e| domain.error(format!("{} not reachable: {}", url, e)))?;

        let status = response.status();
        if status.is_success() {
            response
                .json()
                .await
                .map_err(|e| domain.error(format!("invalid response from {}: {}", url, e)))
        } else {
            let message = response
                .json::<serde_json::Value>()
                .await
                .ok()
                .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(String::from))
                .unwrap_or_else(|| status.to_string());
            Err(domain.error(format!("{} ({})", message, status.as_u16())))
        }
    }

    fn key_token(&self) -> Result<&str> {
        self.token
            .as_deref()
            .ok_or_else(|| Error::key_failed("no API token configured for key requests"))
    }

    async fn unlock(
        &self,
        path: &str,
        token: &str,
        locker_id: &str,
        location: Coordinates,
    ) -> Result<()> {
        let body = UnlockRequest {
            locker_id,
            lat: location.lat,
            lng: location.lng,
        };
        let _: Empty = self.post(Domain::Network, path, token, &body).await?;
        Ok(())
    }
}

#[async_trait]
impl LockerDirectory for ApiClient {
    async fn get_locker(&self, token: &str, locker_id: &str) -> Result<LockerInfo> {
        self.post(Domain::Network, "locker/get", token, &LockerRequest { locker_id })
            .await
    }
}

#[async_trait]
impl NetworkClient for ApiClient {
    async fn put(&self, token: &str, locker_id: &str, location: Coordinates) -> Result<()> {
        self.unlock("locker/put", token, locker_id, location).await
    }

    async fn take(&self, token: &str, locker_id: &str, location: Coordinates) -> Result<()> {
        self.unlock("locker/take", token, locker_id, location).await
    }

    async fn open_for_maintenance(
        &self,
        token: &str,
        locker_id: &str,
        location: Coordinates,
    ) -> Result<()> {
        self.unlock("locker/maintenance", token, locker_id, location)
            .await
    }
}

#[async_trait]
impl KeyService for ApiClient {
    async fn get_key(&self, locker: &LockerDevice) -> Result<Vec<u8>> {
        let body = KeyRequest {
            locker_id: &locker.id,
            read_data: locker.read_data(),
        };
        let response: KeyResponse = self
            .post(Domain::Key, "locker/key/get", self.key_token()?, &body)
            .await?;
        Ok(response.key.into_bytes())
    }

    async fn save_key(&self, locker: &LockerDevice) -> Result<()> {
        let body = KeyRequest {
            locker_id: &locker.id,
            read_data: locker.read_data(),
        };
        let _: Empty = self
            .post(Domain::Key, "locker/key/save", self.key_token()?, &body)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let client = ApiClient::new(ApiConfig::new("http://localhost:8080")).unwrap();
        assert_eq!(client.base_url(), "http://localhost:8080");
        assert_eq!(client.url("locker/get"), "http://localhost:8080/locker/get");
    }

    #[test]
    fn test_client_normalizes_url() {
        let client = ApiClient::new(ApiConfig::new("https://example.com/api/")).unwrap();
        assert_eq!(client.base_url(), "https://example.com/api");
    }

    #[test]
    fn test_client_invalid_url() {
        let result = ApiClient::new(ApiConfig::new("localhost:8080"));
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let config = ApiConfig::new("http://localhost").timeout(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_debug_redacts_token() {
        let config = ApiConfig::new("http://localhost").token("hunter2");
        let debug = format!("{:?}", config);
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("redacted"));
    }

    #[tokio::test]
    async fn test_key_request_without_token() {
        let client = ApiClient::new(ApiConfig::new("http://localhost:8080")).unwrap();
        let locker = LockerDevice::new("locker-1", None);
        let err = client.get_key(&locker).await.unwrap_err();
        assert!(matches!(err, Error::KeyCapabilityFailed(_)));
    }

    #[test]
    fn test_unlock_body() {
        let body = UnlockRequest {
            locker_id: "locker-1",
            lat: 35.0,
            lng: 139.5,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["locker_id"], "locker-1");
        assert_eq!(json["lng"], 139.5);
    }

    #[test]
    fn test_empty_response_accepts_any_object() {
        let _: Empty = serde_json::from_str(r#"{"ok":true}"#).unwrap();
    }
}
