//! HTTP client for an Azure-Computer-Vision-compatible REST endpoint.
//!
//! One `reqwest::Client` is built at process start and shared by every
//! workflow instance through `Arc<dyn VisionAdapter>`.

use std::time::Duration;

use anyhow::{Context, bail};
use async_trait::async_trait;
use reqwest::{RequestBuilder, Response, StatusCode};
use tracing::{debug, info};

use deepeyes_core::{
    DeepEyesError, DescriptionResult, ImageRef, ImageSource, JobId, JobStatus, VisionAdapter,
};
use deepeyes_logging::redact_sensitive_data;

use crate::ocr::{OPERATION_LOCATION, ReadOperationResponse, operation_id_from_location};
use crate::vision::{AnalyzeResponse, VISUAL_FEATURES};

const PROVIDER: &str = "azure";
const SUBSCRIPTION_KEY_HEADER: &str = "Ocp-Apim-Subscription-Key";
const CLIENT_REQUEST_ID_HEADER: &str = "x-ms-client-request-id";

#[derive(Debug, Clone)]
pub struct VisionClientConfig {
    pub endpoint: String,
    pub api_key: String,
    pub api_version: String,
    pub request_timeout: Duration,
}

impl VisionClientConfig {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            api_version: "v3.2".to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

pub struct AzureVisionClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl AzureVisionClient {
    pub fn new(config: VisionClientConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .context("Failed to build vision HTTP client")?;
        Self::with_http_client(http, config)
    }

    pub fn with_http_client(
        http: reqwest::Client,
        config: VisionClientConfig,
    ) -> anyhow::Result<Self> {
        let endpoint = config.endpoint.trim_end_matches('/');
        if url::Url::parse(endpoint).is_err() {
            bail!("Invalid vision endpoint: {}", endpoint);
        }
        if config.api_key.trim().is_empty() {
            bail!("Vision API key is empty");
        }
        info!(endpoint = %endpoint, version = %config.api_version, "Vision client configured");
        Ok(Self {
            http,
            base_url: format!("{}/vision/{}", endpoint, config.api_version),
            api_key: config.api_key,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    /// Attach the image as a JSON URL reference or as a raw binary body.
    async fn with_image(
        &self,
        request: RequestBuilder,
        image: &ImageRef,
    ) -> Result<RequestBuilder, DeepEyesError> {
        match &image.source {
            ImageSource::Url { url } => Ok(request.json(&serde_json::json!({ "url": url }))),
            ImageSource::File { path } => {
                let bytes = tokio::fs::read(path)
                    .await
                    .with_context(|| format!("Failed to read image {}", path.display()))?;
                Ok(request
                    .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                    .body(bytes))
            }
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, DeepEyesError> {
        let resp = request
            .header(SUBSCRIPTION_KEY_HEADER, &self.api_key)
            .send()
            .await
            .map_err(classify_transport)?;
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        Err(classify_status(status, &body))
    }
}

/// 429, 408 and 5xx are worth retrying; any other non-success status is final.
pub fn classify_status(status: StatusCode, body: &str) -> DeepEyesError {
    let message = format!("HTTP {}: {}", status.as_u16(), redact_sensitive_data(body));
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        DeepEyesError::transient(PROVIDER, message)
    } else {
        DeepEyesError::permanent(PROVIDER, message)
    }
}

fn classify_transport(err: reqwest::Error) -> DeepEyesError {
    let message = redact_sensitive_data(&err.to_string());
    if err.is_builder() || err.is_decode() {
        DeepEyesError::permanent(PROVIDER, message)
    } else {
        DeepEyesError::transient(PROVIDER, message)
    }
}

fn decode_err(err: reqwest::Error) -> DeepEyesError {
    DeepEyesError::permanent(PROVIDER, format!("undecodable response: {err}"))
}

#[async_trait]
impl VisionAdapter for AzureVisionClient {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn describe(&self, image: &ImageRef) -> Result<DescriptionResult, DeepEyesError> {
        info!(image = %image.name, "[Vision] Describing image");
        let request = self
            .http
            .post(self.url("analyze"))
            .query(&[("visualFeatures", VISUAL_FEATURES)]);
        let request = self.with_image(request, image).await?;
        let resp = self.send(request).await?;
        let body: AnalyzeResponse = resp.json().await.map_err(decode_err)?;
        Ok(body.into())
    }

    async fn start_text_job(
        &self,
        image: &ImageRef,
        idempotency_key: &str,
    ) -> Result<JobId, DeepEyesError> {
        info!(image = %image.name, "[Vision] Submitting read operation");
        let request = self
            .http
            .post(self.url("read/analyze"))
            .header(CLIENT_REQUEST_ID_HEADER, idempotency_key);
        let request = self.with_image(request, image).await?;
        let resp = self.send(request).await?;

        let location = resp
            .headers()
            .get(OPERATION_LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                DeepEyesError::permanent(PROVIDER, "read submission returned no Operation-Location")
            })?;
        let job = operation_id_from_location(location).ok_or_else(|| {
            DeepEyesError::permanent(PROVIDER, format!("malformed Operation-Location '{location}'"))
        })?;
        debug!(job_id = %job, "Read operation accepted");
        Ok(job)
    }

    async fn poll_text_job(&self, job: &JobId) -> Result<JobStatus, DeepEyesError> {
        let request = self
            .http
            .get(self.url(&format!("read/analyzeResults/{}", job.as_str())));
        let resp = self.send(request).await?;
        let body: ReadOperationResponse = resp.json().await.map_err(decode_err)?;
        debug!(job_id = %job, status = %body.status, "Read operation polled");
        Ok(body.into_job_status())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "").is_transient());
        assert!(classify_status(StatusCode::SERVICE_UNAVAILABLE, "").is_transient());
        assert!(classify_status(StatusCode::REQUEST_TIMEOUT, "").is_transient());
        assert!(!classify_status(StatusCode::BAD_REQUEST, "InvalidImageUrl").is_transient());
        assert!(!classify_status(StatusCode::UNAUTHORIZED, "").is_transient());
        assert!(!classify_status(StatusCode::NOT_FOUND, "").is_transient());
    }

    #[test]
    fn error_bodies_are_redacted() {
        let err = classify_status(
            StatusCode::UNAUTHORIZED,
            r#"{"error": "bad Ocp-Apim-Subscription-Key: 0123456789abcdef0123456789abcdef"}"#,
        );
        assert!(!err.to_string().contains("0123456789abcdef0123456789abcdef"));
    }

    #[test]
    fn builds_versioned_urls() {
        let client = AzureVisionClient::new(VisionClientConfig::new(
            "https://example.cognitiveservices.azure.com/",
            "key",
        ))
        .unwrap();
        assert_eq!(
            client.url("read/analyze"),
            "https://example.cognitiveservices.azure.com/vision/v3.2/read/analyze"
        );
    }

    #[test]
    fn rejects_bad_config() {
        assert!(AzureVisionClient::new(VisionClientConfig::new("nope", "key")).is_err());
        assert!(AzureVisionClient::new(VisionClientConfig::new("https://x.example", " ")).is_err());
    }

    #[tokio::test]
    async fn missing_file_is_not_retried() {
        let client =
            AzureVisionClient::new(VisionClientConfig::new("https://x.example", "key")).unwrap();
        let err = client
            .describe(&ImageRef::from_file("/definitely/not/here.png"))
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }
}
