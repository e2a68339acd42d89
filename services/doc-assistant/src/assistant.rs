//! Document pipeline: extract, chunk, index, converse, quiz
//!
//! `Assistant` owns the resilient wrapper and the model providers. Every
//! provider call it makes goes through `Resilient`, so key rotation applies
//! uniformly to embeddings, chat setup, answers and quizzes.

use std::sync::Arc;

use key_pool::{ChatModel, EmbedDocuments, EmbedQuery, Generate, Resilient};
use provider::{EmbeddingProvider, GenerationProvider, GenerationRequest};
use thiserror::Error;
use tracing::{info, instrument};

use crate::chunking::TextSplitter;
use crate::config::{ChunkingConfig, Config, QuizConfig};
use crate::conversation::Conversation;
use crate::documents::{self, Document, ExtractError, Extractor};
use crate::index::VectorIndex;

#[derive(Debug, Error)]
pub enum AssistantError {
    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error("no extractable text in the uploaded documents")]
    NoText,

    #[error("question must not be empty")]
    EmptyQuestion,

    #[error(transparent)]
    Pool(#[from] key_pool::Error),
}

pub type Result<T> = std::result::Result<T, AssistantError>;

/// Model and pipeline parameters, fixed at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub embedding_model: String,
    pub chat_model: String,
    pub temperature: f32,
    pub chunking: ChunkingConfig,
    pub top_k: usize,
    pub quiz: QuizConfig,
}

impl Settings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            embedding_model: config.gemini.embedding_model.clone(),
            chat_model: config.gemini.chat_model.clone(),
            temperature: config.gemini.temperature,
            chunking: config.chunking,
            top_k: config.retrieval.top_k,
            quiz: config.quiz,
        }
    }
}

/// Cheap to clone; conversations keep their own handle.
#[derive(Clone)]
pub struct Assistant {
    resilient: Resilient,
    embedder: Arc<dyn EmbeddingProvider>,
    generator: Arc<dyn GenerationProvider>,
    settings: Arc<Settings>,
    extractor: Extractor,
}

impl Assistant {
    pub fn new(
        resilient: Resilient,
        embedder: Arc<dyn EmbeddingProvider>,
        generator: Arc<dyn GenerationProvider>,
        settings: Settings,
    ) -> Self {
        Self {
            resilient,
            embedder,
            generator,
            settings: Arc::new(settings),
            extractor: documents::pdf_text,
        }
    }

    /// Replace the PDF parser with a fixture parser.
    #[cfg(test)]
    pub fn with_extractor(mut self, extractor: Extractor) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn resilient(&self) -> &Resilient {
        &self.resilient
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub async fn extract_text(&self, docs: Vec<Document>) -> Result<String> {
        Ok(documents::extract_text(docs, self.extractor).await?)
    }

    pub fn chunk(&self, text: &str) -> Vec<String> {
        TextSplitter::new(self.settings.chunking).split(text)
    }

    /// Embed every chunk and build a searchable index.
    #[instrument(skip_all, fields(chunks = chunks.len()))]
    pub async fn build_index(&self, chunks: Vec<String>) -> Result<VectorIndex> {
        if chunks.is_empty() {
            return Err(AssistantError::NoText);
        }
        let op = EmbedDocuments::new(
            self.embedder.as_ref(),
            &self.settings.embedding_model,
            &chunks,
        );
        let vectors = self.resilient.run(&op).await?;
        let index = VectorIndex::from_embeddings(chunks, vectors);
        info!(vectors = index.len(), "index built");
        Ok(index)
    }

    /// Confirm the chat model is reachable with some key, then wrap the index
    /// in a fresh conversation.
    pub async fn build_conversation(&self, index: VectorIndex) -> Result<Conversation> {
        let op = ChatModel::new(
            self.generator.as_ref(),
            &self.settings.chat_model,
            self.settings.temperature,
        );
        self.resilient.run(&op).await?;
        Ok(Conversation::new(self.clone(), index))
    }

    #[instrument(skip_all, fields(chars = text.len()))]
    pub async fn generate_quiz(&self, text: &str) -> Result<String> {
        if text.trim().is_empty() {
            return Err(AssistantError::NoText);
        }
        self.generate(quiz_prompt(self.settings.quiz, text), "generate_quiz")
            .await
    }

    pub(crate) async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let op = EmbedQuery::new(self.embedder.as_ref(), &self.settings.embedding_model, text);
        Ok(self.resilient.run(&op).await?)
    }

    pub(crate) async fn generate(&self, prompt: String, name: &'static str) -> Result<String> {
        let request = GenerationRequest {
            model: self.settings.chat_model.clone(),
            prompt,
            temperature: self.settings.temperature,
            max_output_tokens: None,
        };
        let op = Generate::new(self.generator.as_ref(), &request).named(name);
        Ok(self.resilient.run(&op).await?)
    }
}

fn quiz_prompt(quiz: QuizConfig, text: &str) -> String {
    format!(
        "Create {} multiple-choice quiz questions with {} options each and the correct answer marked from the following text:\n\n{}",
        quiz.questions, quiz.options, text
    )
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use common::Secret;
    use key_pool::{KeyPool, PoolKey};
    use provider::{BoxFuture, EmbeddingRequest, EmbeddingTask, ProviderError};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Provider double shared by the service tests.
    ///
    /// Keys named `quota` hit quota on every call; `dead` keys are rejected as
    /// invalid. Embeddings are keyword indicators over `VOCAB`, so texts that
    /// share a vocabulary word are similar. Generations are scripted per
    /// prompt prefix, falling back to echoing the prompt's last line.
    #[derive(Default)]
    pub(crate) struct FakeModels {
        pub embed_calls: Mutex<Vec<(String, Vec<String>, EmbeddingTask)>>,
        pub prompts: Mutex<Vec<(String, GenerationRequest)>>,
        pub replies: Mutex<Vec<(String, String)>>,
    }

    pub(crate) const VOCAB: &[&str] = &["rust", "python", "ocean", "mountain"];

    impl FakeModels {
        pub fn reply_to(&self, prefix: &str, reply: &str) {
            self.replies
                .lock()
                .unwrap()
                .push((prefix.to_string(), reply.to_string()));
        }

        /// Prompts of real generations, probes excluded.
        pub fn real_prompts(&self) -> Vec<String> {
            self.prompts
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, r)| r.max_output_tokens.is_none())
                .map(|(_, r)| r.prompt.clone())
                .collect()
        }

        fn check_key(key: &Secret<String>) -> provider::Result<()> {
            match key.expose().as_str() {
                "quota" => Err(ProviderError::QuotaExceeded("Resource has been exhausted".into())),
                "dead" => Err(ProviderError::Auth("API key not valid".into())),
                _ => Ok(()),
            }
        }
    }

    pub(crate) fn keyword_vector(text: &str) -> Vec<f32> {
        let lower = text.to_lowercase();
        VOCAB
            .iter()
            .map(|w| if lower.contains(w) { 1.0 } else { 0.0 })
            .collect()
    }

    impl EmbeddingProvider for FakeModels {
        fn embed<'a>(
            &'a self,
            key: &'a Secret<String>,
            request: &'a EmbeddingRequest<'a>,
        ) -> BoxFuture<'a, provider::Result<Vec<Vec<f32>>>> {
            Box::pin(async move {
                self.embed_calls.lock().unwrap().push((
                    key.expose().clone(),
                    request.texts.to_vec(),
                    request.task,
                ));
                Self::check_key(key)?;
                Ok(request.texts.iter().map(|t| keyword_vector(t)).collect())
            })
        }
    }

    impl GenerationProvider for FakeModels {
        fn generate<'a>(
            &'a self,
            key: &'a Secret<String>,
            request: &'a GenerationRequest,
        ) -> BoxFuture<'a, provider::Result<String>> {
            Box::pin(async move {
                self.prompts
                    .lock()
                    .unwrap()
                    .push((key.expose().clone(), request.clone()));
                Self::check_key(key)?;
                let scripted = self
                    .replies
                    .lock()
                    .unwrap()
                    .iter()
                    .find(|(prefix, _)| request.prompt.starts_with(prefix.as_str()))
                    .map(|(_, reply)| reply.clone());
                Ok(scripted.unwrap_or_else(|| {
                    let last = request.prompt.lines().last().unwrap_or_default();
                    format!("echo: {last}")
                }))
            })
        }
    }

    pub(crate) fn test_settings() -> Settings {
        Settings {
            embedding_model: "models/embedding-001".into(),
            chat_model: "gemini-1.5-flash".into(),
            temperature: 0.0,
            chunking: ChunkingConfig {
                chunk_size: 40,
                chunk_overlap: 0,
            },
            top_k: 2,
            quiz: QuizConfig {
                questions: 5,
                options: 4,
            },
        }
    }

    pub(crate) fn test_assistant(secrets: &[&str], models: Arc<FakeModels>) -> Assistant {
        let keys = secrets
            .iter()
            .enumerate()
            .map(|(i, s)| PoolKey::new(format!("KEY_{}", i + 1), *s))
            .collect();
        let pool = Arc::new(KeyPool::new(keys, Duration::ZERO));
        Assistant::new(
            Resilient::new(pool, 3),
            models.clone(),
            models,
            test_settings(),
        )
    }

    #[tokio::test]
    async fn build_index_embeds_chunks_as_documents() {
        let models = Arc::new(FakeModels::default());
        let assistant = test_assistant(&["good"], models.clone());
        let chunks = assistant.chunk("Rust is a fast systems language.\n\nThe ocean is deep and wide.");
        assert_eq!(chunks.len(), 2);

        let index = assistant.build_index(chunks).await.unwrap();
        assert_eq!(index.len(), 2);

        let calls = models.embed_calls.lock().unwrap().clone();
        let (_, texts, task) = calls.last().unwrap();
        assert_eq!(*task, EmbeddingTask::Document);
        assert_eq!(
            texts,
            &vec![
                "Rust is a fast systems language.".to_string(),
                "The ocean is deep and wide.".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn build_index_rejects_empty_chunk_list() {
        let models = Arc::new(FakeModels::default());
        let assistant = test_assistant(&["good"], models.clone());
        let err = assistant.build_index(vec![]).await.unwrap_err();
        assert!(matches!(err, AssistantError::NoText));
        assert!(models.embed_calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn build_index_rotates_past_exhausted_key() {
        let models = Arc::new(FakeModels::default());
        let assistant = test_assistant(&["quota", "good"], models.clone());
        let index = assistant.build_index(vec!["rust".into()]).await.unwrap();
        assert_eq!(index.len(), 1);

        let snapshot = assistant.resilient().pool().snapshot().await;
        assert_eq!(snapshot.quota_exceeded, vec!["KEY_1"]);
        assert_eq!(snapshot.current.as_deref(), Some("KEY_2"));
    }

    #[tokio::test]
    async fn build_conversation_fails_when_every_key_is_dead() {
        let models = Arc::new(FakeModels::default());
        let assistant = test_assistant(&["dead", "dead"], models);
        let err = assistant
            .build_conversation(VectorIndex::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AssistantError::Pool(key_pool::Error::RetryBudgetExhausted {
                operation: "chat_model",
                ..
            })
        ));
    }

    #[tokio::test]
    async fn quiz_prompt_names_counts_and_carries_text() {
        let models = Arc::new(FakeModels::default());
        models.reply_to("Create 5 multiple-choice", "1. What is Rust?");
        let assistant = test_assistant(&["good"], models.clone());

        let quiz = assistant.generate_quiz("Rust is a language.").await.unwrap();
        assert_eq!(quiz, "1. What is Rust?");

        let prompts = models.real_prompts();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].starts_with(
            "Create 5 multiple-choice quiz questions with 4 options each and the correct answer marked from the following text"
        ));
        assert!(prompts[0].ends_with("Rust is a language."));
    }

    #[tokio::test]
    async fn quiz_requires_text() {
        let models = Arc::new(FakeModels::default());
        let assistant = test_assistant(&["good"], models.clone());
        let err = assistant.generate_quiz("  \n").await.unwrap_err();
        assert!(matches!(err, AssistantError::NoText));
        assert!(models.prompts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_pool_surfaces_no_credential() {
        let models = Arc::new(FakeModels::default());
        let assistant = test_assistant(&[], models);
        let err = assistant.generate_quiz("text").await.unwrap_err();
        assert!(matches!(
            err,
            AssistantError::Pool(key_pool::Error::NoCredentialAvailable { .. })
        ));
    }
}
