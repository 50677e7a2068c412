//! Platform HTTP client.
//!
//! Async client using `reqwest` with Bearer token authentication.

use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::de::DeserializeOwned;
use shipyard_content_hash::ContentHash;
use shipyard_deploy::{AssetStore, BoxFuture, DeployError, DeployService, UploadReceipt};
use shipyard_protocol::constants::{ASSET_CONTENT_TYPE, HTTP_REQUEST_TIMEOUT, HTTP_UPLOAD_TIMEOUT};
use shipyard_protocol::{
    AssetListResponse, DeployEvent, SubmitDeployRequest, SubmitDeployResponse, UploadAssetResponse,
};
use shipyard_transfer::ArchiveStream;
use tracing::debug;

use crate::ApiError;

/// Deployment platform API client.
#[derive(Clone)]
pub struct Client {
    http: reqwest::Client,
    base_url: String,
}

impl Client {
    /// Creates a client for `base_url`, authenticating with `token` if given.
    pub fn new(base_url: &str, token: Option<&str>) -> Result<Self, ApiError> {
        let mut headers = HeaderMap::new();
        if let Some(token) = token {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {token}"))
                    .map_err(|_| ApiError::InvalidToken)?,
            );
        }

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .connect_timeout(HTTP_REQUEST_TIMEOUT)
            .build()
            .map_err(|source| ApiError::Http {
                operation: "build client",
                source,
            })?;

        let base_url = base_url.trim_end_matches('/');
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(ApiError::InvalidUrl(base_url.to_string()));
        }

        Ok(Self {
            http,
            base_url: base_url.to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Sends `request` and decodes a JSON success body.
    async fn send_json<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        url: String,
        request: reqwest::RequestBuilder,
    ) -> Result<T, ApiError> {
        let resp = request
            .send()
            .await
            .map_err(|source| ApiError::Http { operation, source })?;
        let status = resp.status();

        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                operation,
                url,
                status: status.as_u16(),
                body,
            });
        }

        let body = resp
            .bytes()
            .await
            .map_err(|source| ApiError::Http { operation, source })?;
        debug!(operation, %url, bytes = body.len(), "request succeeded");
        Ok(serde_json::from_slice(&body)?)
    }

    /// Lists stored assets with the given checksum.
    pub async fn list_assets(&self, checksum: &str) -> Result<AssetListResponse, ApiError> {
        let url = format!("{}/assets", self.base_url);
        let request = self
            .http
            .get(&url)
            .query(&[("checksum", checksum)])
            .timeout(HTTP_REQUEST_TIMEOUT);
        self.send_json("list assets", url, request).await
    }

    /// Streams a packaged archive as the asset for `checksum`.
    pub async fn put_asset(
        &self,
        archive: ArchiveStream,
        checksum: &str,
    ) -> Result<UploadAssetResponse, ApiError> {
        let url = format!("{}/assets/{}", self.base_url, encode(checksum));
        let request = self
            .http
            .put(&url)
            .header(CONTENT_TYPE, ASSET_CONTENT_TYPE)
            .body(reqwest::Body::wrap_stream(archive))
            .timeout(HTTP_UPLOAD_TIMEOUT);
        self.send_json("upload asset", url, request).await
    }

    /// Starts a deploy task for `deployment_id`.
    pub async fn create_task(
        &self,
        deployment_id: &str,
        body: &SubmitDeployRequest,
    ) -> Result<SubmitDeployResponse, ApiError> {
        let url = format!("{}/deployments/{}/tasks", self.base_url, encode(deployment_id));
        let request = self.http.post(&url).json(body).timeout(HTTP_REQUEST_TIMEOUT);
        self.send_json("submit deploy", url, request).await
    }

    /// Current status of a deploy task.
    pub async fn get_task(&self, task_id: &str) -> Result<DeployEvent, ApiError> {
        let url = format!("{}/tasks/{}", self.base_url, encode(task_id));
        let request = self.http.get(&url).timeout(HTTP_REQUEST_TIMEOUT);
        self.send_json("deploy status", url, request).await
    }
}

fn encode(segment: &str) -> String {
    utf8_percent_encode(segment, NON_ALPHANUMERIC).to_string()
}

impl AssetStore for Client {
    fn asset_exists<'a>(
        &'a self,
        checksum: &'a ContentHash,
    ) -> BoxFuture<'a, Result<bool, DeployError>> {
        Box::pin(async move {
            let hex = checksum.to_hex();
            let listing = self.list_assets(&hex).await?;
            Ok(listing.contains(&hex))
        })
    }

    fn upload_asset<'a>(
        &'a self,
        archive: ArchiveStream,
        checksum: &'a ContentHash,
    ) -> BoxFuture<'a, Result<UploadReceipt, DeployError>> {
        Box::pin(async move {
            let resp = self.put_asset(archive, &checksum.to_hex()).await?;
            Ok(UploadReceipt {
                checksum: resp.checksum,
            })
        })
    }
}

impl DeployService for Client {
    fn submit_deploy<'a>(
        &'a self,
        deployment_id: &'a str,
        request: &'a SubmitDeployRequest,
    ) -> BoxFuture<'a, Result<String, DeployError>> {
        Box::pin(async move {
            let resp = self.create_task(deployment_id, request).await?;
            Ok(resp.task_id)
        })
    }

    fn deploy_status<'a>(
        &'a self,
        task_id: &'a str,
    ) -> BoxFuture<'a, Result<DeployEvent, DeployError>> {
        Box::pin(async move { Ok(self.get_task(task_id).await?) })
    }
}
