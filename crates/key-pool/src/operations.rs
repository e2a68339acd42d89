//! Operation descriptors for the calls the assistant makes through the pool
//!
//! Each descriptor borrows a provider plus its parameters. The probe is the
//! same for every embedding call (embed one short string) and every
//! generation call (one-token completion of a short prompt).

use common::Secret;
use provider::{
    BoxFuture, EmbeddingProvider, EmbeddingRequest, EmbeddingTask, GenerationProvider,
    GenerationRequest, ProviderError,
};

use crate::resilient::Operation;

/// Text sent by embedding probes.
const PROBE_TEXT: &str = "ping";

async fn probe_embedding(
    provider: &dyn EmbeddingProvider,
    key: &Secret<String>,
    model: &str,
) -> provider::Result<()> {
    let texts = [PROBE_TEXT.to_string()];
    let request = EmbeddingRequest {
        model,
        texts: &texts,
        task: EmbeddingTask::Query,
    };
    provider.embed(key, &request).await.map(|_| ())
}

async fn probe_generation(
    provider: &dyn GenerationProvider,
    key: &Secret<String>,
    model: &str,
    temperature: f32,
) -> provider::Result<()> {
    let request = GenerationRequest {
        model: model.to_string(),
        prompt: PROBE_TEXT.to_string(),
        temperature,
        max_output_tokens: Some(1),
    };
    provider.generate(key, &request).await.map(|_| ())
}

/// Embed every chunk of a document set (index construction).
pub struct EmbedDocuments<'p> {
    provider: &'p dyn EmbeddingProvider,
    model: &'p str,
    texts: &'p [String],
}

impl<'p> EmbedDocuments<'p> {
    pub fn new(provider: &'p dyn EmbeddingProvider, model: &'p str, texts: &'p [String]) -> Self {
        Self {
            provider,
            model,
            texts,
        }
    }
}

impl Operation for EmbedDocuments<'_> {
    type Output = Vec<Vec<f32>>;

    fn name(&self) -> &'static str {
        "embed_documents"
    }

    fn probe<'a>(&'a self, key: &'a Secret<String>) -> BoxFuture<'a, provider::Result<()>> {
        Box::pin(probe_embedding(self.provider, key, self.model))
    }

    fn execute<'a>(
        &'a self,
        key: &'a Secret<String>,
    ) -> BoxFuture<'a, provider::Result<Vec<Vec<f32>>>> {
        Box::pin(async move {
            let request = EmbeddingRequest {
                model: self.model,
                texts: self.texts,
                task: EmbeddingTask::Document,
            };
            self.provider.embed(key, &request).await
        })
    }
}

/// Embed a single retrieval query.
pub struct EmbedQuery<'p> {
    provider: &'p dyn EmbeddingProvider,
    model: &'p str,
    text: &'p str,
}

impl<'p> EmbedQuery<'p> {
    pub fn new(provider: &'p dyn EmbeddingProvider, model: &'p str, text: &'p str) -> Self {
        Self {
            provider,
            model,
            text,
        }
    }
}

impl Operation for EmbedQuery<'_> {
    type Output = Vec<f32>;

    fn name(&self) -> &'static str {
        "embed_query"
    }

    fn probe<'a>(&'a self, key: &'a Secret<String>) -> BoxFuture<'a, provider::Result<()>> {
        Box::pin(probe_embedding(self.provider, key, self.model))
    }

    fn execute<'a>(&'a self, key: &'a Secret<String>) -> BoxFuture<'a, provider::Result<Vec<f32>>> {
        Box::pin(async move {
            let texts = [self.text.to_string()];
            let request = EmbeddingRequest {
                model: self.model,
                texts: &texts,
                task: EmbeddingTask::Query,
            };
            self.provider
                .embed(key, &request)
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| ProviderError::MalformedResponse("no embedding returned".into()))
        })
    }
}

/// Establish that a chat model is usable with some key. Conversation setup
/// runs this before handing out a chain; it produces nothing but the probe.
pub struct ChatModel<'p> {
    provider: &'p dyn GenerationProvider,
    model: &'p str,
    temperature: f32,
}

impl<'p> ChatModel<'p> {
    pub fn new(provider: &'p dyn GenerationProvider, model: &'p str, temperature: f32) -> Self {
        Self {
            provider,
            model,
            temperature,
        }
    }
}

impl Operation for ChatModel<'_> {
    type Output = ();

    fn name(&self) -> &'static str {
        "chat_model"
    }

    fn probe<'a>(&'a self, key: &'a Secret<String>) -> BoxFuture<'a, provider::Result<()>> {
        Box::pin(probe_generation(
            self.provider,
            key,
            self.model,
            self.temperature,
        ))
    }

    fn execute<'a>(&'a self, _key: &'a Secret<String>) -> BoxFuture<'a, provider::Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

/// One text generation: answer, question condensing, or quiz authoring.
pub struct Generate<'p> {
    provider: &'p dyn GenerationProvider,
    request: &'p GenerationRequest,
    name: &'static str,
}

impl<'p> Generate<'p> {
    pub fn new(provider: &'p dyn GenerationProvider, request: &'p GenerationRequest) -> Self {
        Self {
            provider,
            request,
            name: "generate",
        }
    }

    /// Override the operation name used in logs and metrics.
    pub fn named(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }
}

impl Operation for Generate<'_> {
    type Output = String;

    fn name(&self) -> &'static str {
        self.name
    }

    fn probe<'a>(&'a self, key: &'a Secret<String>) -> BoxFuture<'a, provider::Result<()>> {
        Box::pin(probe_generation(
            self.provider,
            key,
            &self.request.model,
            self.request.temperature,
        ))
    }

    fn execute<'a>(&'a self, key: &'a Secret<String>) -> BoxFuture<'a, provider::Result<String>> {
        self.provider.generate(key, self.request)
    }
}
