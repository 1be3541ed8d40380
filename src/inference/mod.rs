//! Inference service boundary
//!
//! The model behind the pipeline is an opaque external service: it takes the
//! bytes of one media file and either returns a result artifact or fails.
//! [`InferenceClient`] is that capability; [`HttpInferenceClient`] reaches a
//! real service over HTTP.

pub mod client;

pub use client::HttpInferenceClient;

use async_trait::async_trait;
use std::time::Duration;

/// One dispatch: a bundle's secondary-channel media.
#[derive(Debug, Clone)]
pub struct InferenceRequest {
    pub identity: String,
    pub file_name: String,
    pub media: Vec<u8>,
}

/// Inference errors
#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server returned status {0}")]
    ServerError(reqwest::StatusCode),
    #[error("server returned an empty artifact")]
    EmptyResponse,
    #[error("no response within {}s", .0.as_secs())]
    Timeout(Duration),
}

/// Capability to run inference on one media payload.
#[async_trait]
pub trait InferenceClient: Send + Sync {
    /// Name of the backend, for logging
    fn backend_name(&self) -> &str;

    /// Run inference and return the artifact bytes.
    async fn infer(&self, request: InferenceRequest) -> Result<Vec<u8>, InferenceError>;
}
