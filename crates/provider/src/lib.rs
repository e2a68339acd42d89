//! Provider abstraction for the generative-language upstream
//!
//! Defines the `EmbeddingProvider` and `GenerationProvider` traits that decouple
//! the key pool and the application from the HTTP details of a specific vendor.
//! `GeminiClient` implements both against Google's generative-language REST API.
//!
//! Every provider failure is a `ProviderError`, and every `ProviderError` knows
//! its own `ErrorClassification`. Callers never decide on their own whether a
//! failure was a quota problem.

pub mod gemini;
pub mod quota;

pub use gemini::GeminiClient;
pub use quota::{classify_body, classify_status};

use common::Secret;
use std::future::Future;
use std::pin::Pin;

/// Boxed future used by the provider and operation traits for dyn-compatibility.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Classification of upstream errors to determine pool action.
///
/// - QuotaExceeded marks the key as throttled and rotates away from it
/// - Permanent and Transient both mark the key as failed; the split is kept
///   for logs and metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClassification {
    /// Timeouts, 5xx, malformed responses
    Transient,
    /// Rate or usage allowance exhausted for this key
    QuotaExceeded,
    /// Invalid, revoked or unauthorized key
    Permanent,
}

impl ErrorClassification {
    pub fn is_quota(&self) -> bool {
        matches!(self, ErrorClassification::QuotaExceeded)
    }

    /// Label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorClassification::Transient => "transient",
            ErrorClassification::QuotaExceeded => "quota_exceeded",
            ErrorClassification::Permanent => "permanent",
        }
    }
}

/// Errors from provider calls.
///
/// Messages carry upstream detail (truncated) but never key material: keys are
/// sent in a header, so neither URLs nor transport errors contain them.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("upstream returned {status}: {message}")]
    Upstream { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

impl ProviderError {
    /// Build an error from a non-success HTTP response.
    pub fn from_status(status: u16, body: &str) -> Self {
        let message = quota::truncate_body(body);
        match classify_status(status, body) {
            ErrorClassification::QuotaExceeded => ProviderError::QuotaExceeded(message),
            ErrorClassification::Permanent => ProviderError::Auth(message),
            ErrorClassification::Transient => ProviderError::Upstream { status, message },
        }
    }

    pub fn classification(&self) -> ErrorClassification {
        match self {
            ProviderError::QuotaExceeded(_) => ErrorClassification::QuotaExceeded,
            ProviderError::Auth(_) => ErrorClassification::Permanent,
            ProviderError::Upstream { .. }
            | ProviderError::Transport(_)
            | ProviderError::MalformedResponse(_) => ErrorClassification::Transient,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        // Strip the URL so query strings never leak into messages.
        ProviderError::Transport(e.without_url().to_string())
    }
}

/// Result alias for provider operations.
pub type Result<T> = std::result::Result<T, ProviderError>;

/// Which side of a retrieval an embedding is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingTask {
    Document,
    Query,
}

impl EmbeddingTask {
    /// Gemini `taskType` value.
    pub fn as_api_str(&self) -> &'static str {
        match self {
            EmbeddingTask::Document => "RETRIEVAL_DOCUMENT",
            EmbeddingTask::Query => "RETRIEVAL_QUERY",
        }
    }
}

/// Texts to embed with a given model.
#[derive(Debug, Clone, Copy)]
pub struct EmbeddingRequest<'a> {
    pub model: &'a str,
    pub texts: &'a [String],
    pub task: EmbeddingTask,
}

/// A single-turn text generation request.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub model: String,
    pub prompt: String,
    pub temperature: f32,
    pub max_output_tokens: Option<u32>,
}

/// Computes embeddings with a caller-supplied key.
///
/// Returns one vector per input text, in input order.
pub trait EmbeddingProvider: Send + Sync {
    fn embed<'a>(
        &'a self,
        key: &'a Secret<String>,
        request: &'a EmbeddingRequest<'a>,
    ) -> BoxFuture<'a, Result<Vec<Vec<f32>>>>;
}

/// Generates text with a caller-supplied key.
pub trait GenerationProvider: Send + Sync {
    fn generate<'a>(
        &'a self,
        key: &'a Secret<String>,
        request: &'a GenerationRequest,
    ) -> BoxFuture<'a, Result<String>>;
}
