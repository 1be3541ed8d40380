//! HTTP inference client
//!
//! POSTs the raw media bytes to the configured endpoint. A 2xx response body
//! is the artifact (a zip produced by the model).

use async_trait::async_trait;
use std::time::Duration;

use super::{InferenceClient, InferenceError, InferenceRequest};

/// reqwest-backed [`InferenceClient`]
#[derive(Clone)]
pub struct HttpInferenceClient {
    http: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl HttpInferenceClient {
    /// Create a client; `timeout` bounds each request end to end.
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, InferenceError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            timeout,
        })
    }
}

#[async_trait]
impl InferenceClient for HttpInferenceClient {
    fn backend_name(&self) -> &str {
        &self.endpoint
    }

    async fn infer(&self, request: InferenceRequest) -> Result<Vec<u8>, InferenceError> {
        let resp = self
            .http
            .post(&self.endpoint)
            .header("Content-Type", "application/octet-stream")
            .header("X-File-Name", &request.file_name)
            .header("X-Bundle-Id", &request.identity)
            .body(request.media)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    InferenceError::Timeout(self.timeout)
                } else {
                    InferenceError::Http(e)
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(InferenceError::ServerError(status));
        }

        let body = resp.bytes().await?;
        if body.is_empty() {
            return Err(InferenceError::EmptyResponse);
        }

        Ok(body.to_vec())
    }
}
