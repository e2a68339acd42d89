//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! API keys are only ever read from the environment variables named in
//! `[pool] key_env_vars`, never from the TOML itself, so the file can be
//! committed without leaking secrets.

use common::Secret;
use key_pool::PoolKey;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Root configuration
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub pool: PoolConfig,
    pub gemini: GeminiConfig,
    pub chunking: ChunkingConfig,
    pub retrieval: RetrievalConfig,
    pub quiz: QuizConfig,
    /// Keys resolved from the environment at load time.
    #[serde(skip)]
    pub api_keys: Vec<PoolKey>,
}

/// HTTP listener settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub max_upload_bytes: usize,
    pub max_connections: usize,
}

/// Key pool settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Environment variables holding API keys, in rotation order.
    pub key_env_vars: Vec<String>,
    pub rotation_cooldown_secs: u64,
    pub max_retries: u32,
}

/// Upstream model settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GeminiConfig {
    pub base_url: String,
    pub embedding_model: String,
    pub chat_model: String,
    pub temperature: f32,
    pub timeout_secs: u64,
}

/// Text splitter settings, measured in characters
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub top_k: usize,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct QuizConfig {
    pub questions: u32,
    pub options: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            max_upload_bytes: 50 * 1024 * 1024,
            max_connections: 256,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            key_env_vars: vec![
                "GOOGLE_API_KEY".into(),
                "GOOGLE_API_KEY_2".into(),
                "GOOGLE_API_KEY_3".into(),
            ],
            rotation_cooldown_secs: 5,
            max_retries: key_pool::DEFAULT_MAX_RETRIES,
        }
    }
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            base_url: provider::gemini::DEFAULT_BASE_URL.into(),
            embedding_model: "models/embedding-001".into(),
            chat_model: "gemini-1.5-flash".into(),
            temperature: 0.0,
            timeout_secs: 60,
        }
    }
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            chunk_overlap: 200,
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self { top_k: 4 }
    }
}

impl Default for QuizConfig {
    fn default() -> Self {
        Self {
            questions: 5,
            options: 4,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, validate it, then read API keys
    /// from the environment.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.finish()
    }

    /// Built-in defaults plus environment keys, for running without a file.
    pub fn from_defaults() -> common::Result<Self> {
        Config::default().finish()
    }

    fn finish(mut self) -> common::Result<Self> {
        self.validate()?;
        self.api_keys = resolve_keys(&self.pool.key_env_vars)?;
        Ok(self)
    }

    fn validate(&self) -> common::Result<()> {
        if !self.gemini.base_url.starts_with("http://")
            && !self.gemini.base_url.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "gemini.base_url must start with http:// or https://, got: {}",
                self.gemini.base_url
            )));
        }
        if self.gemini.timeout_secs == 0 {
            return Err(common::Error::Config(
                "gemini.timeout_secs must be greater than 0".into(),
            ));
        }
        if self.chunking.chunk_size == 0 {
            return Err(common::Error::Config(
                "chunking.chunk_size must be greater than 0".into(),
            ));
        }
        if self.chunking.chunk_overlap >= self.chunking.chunk_size {
            return Err(common::Error::Config(format!(
                "chunking.chunk_overlap ({}) must be smaller than chunk_size ({})",
                self.chunking.chunk_overlap, self.chunking.chunk_size
            )));
        }
        if self.retrieval.top_k == 0 {
            return Err(common::Error::Config(
                "retrieval.top_k must be greater than 0".into(),
            ));
        }
        if self.server.max_upload_bytes == 0 || self.server.max_connections == 0 {
            return Err(common::Error::Config(
                "server.max_upload_bytes and server.max_connections must be greater than 0".into(),
            ));
        }
        if self.quiz.questions == 0 || self.quiz.options < 2 {
            return Err(common::Error::Config(
                "quiz needs at least 1 question and 2 options".into(),
            ));
        }
        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    ///
    /// The flag reports whether the path was asked for explicitly; only then
    /// is a missing file an error.
    pub fn resolve_path(cli_path: Option<&str>) -> (PathBuf, bool) {
        if let Some(p) = cli_path {
            return (PathBuf::from(p), true);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return (PathBuf::from(p), true);
        }
        (PathBuf::from("doc-assistant.toml"), false)
    }
}

/// Read each named variable in order. Unset or blank variables are skipped;
/// a value that is not valid unicode is an error.
fn resolve_keys(vars: &[String]) -> common::Result<Vec<PoolKey>> {
    let mut keys = Vec::new();
    for var in vars {
        match std::env::var(var) {
            Ok(value) => {
                let secret = Secret::new(value.trim().to_string());
                if secret.is_empty() {
                    warn!(var = %var, "API key variable is blank, skipping");
                } else {
                    keys.push(PoolKey::new(var.clone(), secret));
                }
            }
            Err(std::env::VarError::NotPresent) => {
                warn!(var = %var, "API key variable not set, skipping");
            }
            Err(std::env::VarError::NotUnicode(_)) => {
                return Err(common::Error::Env {
                    var: var.clone(),
                    reason: "not valid unicode".into(),
                });
            }
        }
    }
    Ok(keys)
}
