//! Gemini generative-language REST client
//!
//! Implements `EmbeddingProvider` (`batchEmbedContents`) and
//! `GenerationProvider` (`generateContent`). The key is supplied per call so
//! the pool decides which account pays for each request; it travels in the
//! `x-goog-api-key` header, never in the URL.

use std::time::Duration;

use common::Secret;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, instrument};

use crate::{
    BoxFuture, EmbeddingProvider, EmbeddingRequest, GenerationProvider, GenerationRequest,
    ProviderError, Result,
};

/// Public Gemini endpoint.
pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// `batchEmbedContents` accepts at most this many requests per call.
pub const MAX_EMBED_BATCH: usize = 100;

const API_KEY_HEADER: &str = "x-goog-api-key";

/// HTTP client for the Gemini API.
#[derive(Debug, Clone)]
pub struct GeminiClient {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct BatchEmbedResponse {
    #[serde(default)]
    embeddings: Vec<ContentEmbedding>,
}

#[derive(Debug, Deserialize)]
struct ContentEmbedding {
    values: Vec<f32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

impl GeminiClient {
    /// Build a client for `base_url` with a per-request timeout.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(ProviderError::from)?;
        Ok(Self::with_client(http, base_url))
    }

    /// Build a client around an existing `reqwest::Client`.
    pub fn with_client(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// POST a JSON body and return the parsed JSON response, mapping non-2xx
    /// statuses through the central classifier.
    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        key: &Secret<String>,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<T> {
        let response = self
            .http
            .post(url)
            .headers(auth_headers(key)?)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status.as_u16(), &body));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| ProviderError::MalformedResponse(e.without_url().to_string()))
    }

    #[instrument(skip_all, fields(model = request.model, texts = request.texts.len()))]
    async fn embed_batches(
        &self,
        key: &Secret<String>,
        request: &EmbeddingRequest<'_>,
    ) -> Result<Vec<Vec<f32>>> {
        let model = model_path(request.model);
        let url = format!("{}/v1beta/{}:batchEmbedContents", self.base_url, model);
        let mut vectors = Vec::with_capacity(request.texts.len());

        for batch in request.texts.chunks(MAX_EMBED_BATCH) {
            let requests: Vec<serde_json::Value> = batch
                .iter()
                .map(|text| {
                    json!({
                        "model": model,
                        "content": { "parts": [{ "text": text }] },
                        "taskType": request.task.as_api_str(),
                    })
                })
                .collect();

            let parsed: BatchEmbedResponse = self
                .post_json(key, &url, &json!({ "requests": requests }))
                .await?;

            if parsed.embeddings.len() != batch.len() {
                return Err(ProviderError::MalformedResponse(format!(
                    "expected {} embeddings, got {}",
                    batch.len(),
                    parsed.embeddings.len()
                )));
            }
            vectors.extend(parsed.embeddings.into_iter().map(|e| e.values));
            debug!(embedded = vectors.len(), "embedding batch complete");
        }

        Ok(vectors)
    }

    #[instrument(skip_all, fields(model = %request.model))]
    async fn generate_content(
        &self,
        key: &Secret<String>,
        request: &GenerationRequest,
    ) -> Result<String> {
        let url = format!(
            "{}/v1beta/{}:generateContent",
            self.base_url,
            model_path(&request.model)
        );

        let mut generation_config = json!({ "temperature": request.temperature });
        if let Some(max) = request.max_output_tokens {
            generation_config["maxOutputTokens"] = json!(max);
        }
        let body = json!({
            "contents": [{ "role": "user", "parts": [{ "text": request.prompt }] }],
            "generationConfig": generation_config,
        });

        let parsed: GenerateResponse = self.post_json(key, &url, &body).await?;
        extract_text(parsed)
    }
}

impl EmbeddingProvider for GeminiClient {
    fn embed<'a>(
        &'a self,
        key: &'a Secret<String>,
        request: &'a EmbeddingRequest<'a>,
    ) -> BoxFuture<'a, Result<Vec<Vec<f32>>>> {
        Box::pin(self.embed_batches(key, request))
    }
}

impl GenerationProvider for GeminiClient {
    fn generate<'a>(
        &'a self,
        key: &'a Secret<String>,
        request: &'a GenerationRequest,
    ) -> BoxFuture<'a, Result<String>> {
        Box::pin(self.generate_content(key, request))
    }
}

/// Header map carrying the API key, marked sensitive so it is never printed.
fn auth_headers(key: &Secret<String>) -> Result<HeaderMap> {
    let mut value = HeaderValue::from_str(key.expose())
        .map_err(|_| ProviderError::Auth("API key contains invalid header characters".into()))?;
    value.set_sensitive(true);
    let mut headers = HeaderMap::new();
    headers.insert(HeaderName::from_static(API_KEY_HEADER), value);
    Ok(headers)
}

/// Resource path for a model: `gemini-1.5-flash` and `models/gemini-1.5-flash`
/// both become `models/gemini-1.5-flash`.
fn model_path(model: &str) -> String {
    if model.starts_with("models/") {
        model.to_string()
    } else {
        format!("models/{model}")
    }
}

/// Concatenate the text parts of the first candidate.
fn extract_text(response: GenerateResponse) -> Result<String> {
    let Some(candidate) = response.candidates.into_iter().next() else {
        let reason = response
            .prompt_feedback
            .and_then(|f| f.block_reason)
            .unwrap_or_else(|| "no candidates returned".to_string());
        return Err(ProviderError::MalformedResponse(format!(
            "empty generation: {reason}"
        )));
    };

    let text: String = candidate
        .content
        .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default();
    Ok(text)
}
