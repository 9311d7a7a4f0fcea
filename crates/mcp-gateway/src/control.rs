//! Client for the management REST API.
//!
//! The gateway core consumes a handful of endpoints to reconcile tenant
//! configs: list/create/update/delete, `sync`, `activate`, and the OpenAPI
//! import (which answers with the `McpConfig` created from the document).
//! The management service itself, including the OpenAPI-to-tool conversion,
//! lives outside this crate.

use std::time::Duration;

use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{RetryTransientMiddleware, policies::ExponentialBackoff};

use crate::model::McpConfig;

/// Errors from the management API client.
#[derive(thiserror::Error, Debug)]
pub enum ControlError {
    /// HTTP transport error (connection, DNS, TLS, etc.)
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Middleware error
    #[error("Middleware error: {0}")]
    Middleware(#[from] reqwest_middleware::Error),

    /// Non-success status from the API
    #[error("API returned {status}: {message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body or message.
        message: String,
    },

    /// Response body failed to parse
    #[error("Failed to parse response: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Result type alias for control-plane operations.
pub type ControlResult<T> = Result<T, ControlError>;

/// Management API client with retry middleware.
#[derive(Clone)]
pub struct ControlClient {
    client: ClientWithMiddleware,
    base_url: String,
}

impl ControlClient {
    /// Create a client for the management API at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns error if HTTP client initialization fails.
    pub fn new(base_url: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        let retry_policy = ExponentialBackoff::builder()
            .retry_bounds(Duration::from_secs(1), Duration::from_secs(10))
            .build_with_max_retries(3);

        let client = ClientBuilder::new(client)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Ok(Self { client, base_url: base_url.into().trim_end_matches('/').to_string() })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn check(response: reqwest::Response) -> ControlResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(ControlError::Status { status: status.as_u16(), message })
    }

    /// All configs of one tenant.
    pub async fn list_configs(&self, tenant_name: &str) -> ControlResult<Vec<McpConfig>> {
        let response = self
            .client
            .get(self.url("/api/v1/mcp/configs"))
            .query(&[("tenant_name", tenant_name)])
            .send()
            .await?;
        let response = Self::check(response).await?;
        Ok(response.json().await?)
    }

    /// One config by composite identity, if it exists and is not deleted.
    pub async fn get_config(
        &self,
        tenant_name: &str,
        name: &str,
    ) -> ControlResult<Option<McpConfig>> {
        let configs = self.list_configs(tenant_name).await?;
        Ok(configs.into_iter().find(|c| c.name == name && !c.is_deleted()))
    }

    /// Persist a new config.
    pub async fn create_config(&self, config: &McpConfig) -> ControlResult<McpConfig> {
        let response = self
            .client
            .post(self.url("/api/v1/mcp/configs"))
            .json(config)
            .send()
            .await?;
        let response = Self::check(response).await?;
        Ok(response.json().await?)
    }

    /// Update an existing config.
    pub async fn update_config(&self, config: &McpConfig) -> ControlResult<McpConfig> {
        let response = self
            .client
            .put(self.url("/api/v1/mcp/configs"))
            .json(config)
            .send()
            .await?;
        let response = Self::check(response).await?;
        Ok(response.json().await?)
    }

    /// Soft-delete a config.
    pub async fn delete_config(&self, tenant_name: &str, name: &str) -> ControlResult<()> {
        let response = self
            .client
            .delete(self.url(&format!("/api/v1/mcp/configs/{tenant_name}/{name}")))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    /// Force a reload notification for a config.
    pub async fn sync_config(&self, config_id: &str) -> ControlResult<()> {
        let response = self
            .client
            .post(self.url(&format!("/api/v1/mcp/configs/{config_id}/sync")))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    /// Activate a config on the gateway fleet.
    pub async fn activate(&self, tenant_name: &str, name: &str) -> ControlResult<()> {
        let response = self
            .client
            .post(self.url(&format!("/api/v1/mcp/{tenant_name}/{name}/active")))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    /// Upload an OpenAPI document; the API answers with the `McpConfig`
    /// synthesized from it (one config per document).
    pub async fn import_openapi(
        &self,
        file_name: &str,
        document: Vec<u8>,
    ) -> ControlResult<McpConfig> {
        let part = reqwest::multipart::Part::bytes(document).file_name(file_name.to_string());
        let form = reqwest::multipart::Form::new().part("file", part);

        let response = self
            .client
            .post(self.url("/api/v1/openapi/openapi/import"))
            .multipart(form)
            .send()
            .await?;
        let response = Self::check(response).await?;
        Ok(response.json().await?)
    }
}

impl std::fmt::Debug for ControlClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlClient").field("base_url", &self.base_url).finish()
    }
}
