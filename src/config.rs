//! TOML configuration for the ragnote backend.
//!
//! Every section except `[db]` is optional and falls back to defaults, so a
//! minimal config only needs a database path:
//!
//! ```toml
//! [db]
//! path = "./data/ragnote.sqlite"
//! ```
//!
//! Secrets are never read from the file when an environment variable is
//! available: `OPENAI_API_KEY` for OpenAI-backed providers and
//! `RAGNOTE_AUTH_SECRET` for token signing.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ChunkingConfig {
    pub max_tokens: usize,
    pub overlap_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: 700,
            overlap_tokens: 80,
        }
    }
}

/// Retrieval channel(s) used to rank chunks.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    /// FTS5 BM25 only.
    Keyword,
    /// Vector similarity only.
    Semantic,
    /// Weighted merge of both channels.
    Hybrid,
}

impl SearchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchMode::Keyword => "keyword",
            SearchMode::Semantic => "semantic",
            SearchMode::Hybrid => "hybrid",
        }
    }

    pub fn needs_embeddings(&self) -> bool {
        !matches!(self, SearchMode::Keyword)
    }
}

impl FromStr for SearchMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "keyword" => Ok(SearchMode::Keyword),
            "semantic" => Ok(SearchMode::Semantic),
            "hybrid" => Ok(SearchMode::Hybrid),
            other => bail!(
                "Unknown search mode: {}. Use keyword, semantic, or hybrid.",
                other
            ),
        }
    }
}

impl fmt::Display for SearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetrievalConfig {
    pub mode: SearchMode,
    pub hybrid_alpha: f64,
    pub candidate_k_keyword: i64,
    pub candidate_k_vector: i64,
    /// Maximum documents returned by `search`.
    pub final_limit: i64,
    /// Passages handed to the language model per chat turn.
    pub top_k: usize,
    pub max_chunks_per_doc: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            mode: SearchMode::Hybrid,
            hybrid_alpha: 0.6,
            candidate_k_keyword: 80,
            candidate_k_vector: 80,
            final_limit: 12,
            top_k: 3,
            max_chunks_per_doc: 3,
        }
    }
}

impl RetrievalConfig {
    /// The configured mode, degraded to keyword search when no embedding
    /// provider is available.
    pub fn effective_mode(&self, embedding: &EmbeddingConfig) -> SearchMode {
        if self.mode.needs_embeddings() && !embedding.is_enabled() {
            SearchMode::Keyword
        } else {
            self.mode
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL override (Ollama host, or an OpenAI-compatible gateway).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_embedding_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LlmConfig {
    /// `disabled`, `ollama`, `openai`, or `llamacpp`.
    pub provider: String,
    pub model: Option<String>,
    pub url: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub stop: Vec<String>,
    pub system_prompt: Option<String>,
    /// Budget for retrieved passages inside the prompt.
    pub max_context_tokens: usize,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            url: None,
            max_tokens: 500,
            temperature: 0.2,
            stop: vec!["Question:".to_string()],
            system_prompt: None,
            max_context_tokens: 1500,
            timeout_secs: 120,
            max_retries: 2,
        }
    }
}

impl LlmConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    /// Allowed CORS origins. Empty or `"*"` allows any origin.
    pub cors_origins: Vec<String>,
    pub uploads_dir: PathBuf,
    pub max_upload_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8000".to_string(),
            cors_origins: vec!["http://localhost:3000".to_string()],
            uploads_dir: PathBuf::from("./data/uploads"),
            max_upload_bytes: 25 * 1024 * 1024,
        }
    }
}

/// Upper bound on `auth.token_ttl_minutes`.
pub const MAX_TOKEN_TTL_MINUTES: i64 = 525_600 * 10;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AuthConfig {
    /// Token signing secret. `RAGNOTE_AUTH_SECRET` takes precedence.
    pub secret: Option<String>,
    pub token_ttl_minutes: i64,
    /// Reject unauthenticated requests to upload, chat, search, documents and notes.
    pub require_auth: bool,
    pub password_hash_rounds: u32,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret: None,
            token_ttl_minutes: 30,
            require_auth: false,
            password_hash_rounds: 100_000,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.chunking.max_tokens == 0 {
            bail!("chunking.max_tokens must be > 0");
        }
        if self.chunking.overlap_tokens >= self.chunking.max_tokens {
            bail!("chunking.overlap_tokens must be < chunking.max_tokens");
        }

        if self.retrieval.final_limit < 1 {
            bail!("retrieval.final_limit must be >= 1");
        }
        if self.retrieval.top_k == 0 {
            bail!("retrieval.top_k must be >= 1");
        }
        if self.retrieval.max_chunks_per_doc == 0 {
            bail!("retrieval.max_chunks_per_doc must be >= 1");
        }
        if !(0.0..=1.0).contains(&self.retrieval.hybrid_alpha) {
            bail!("retrieval.hybrid_alpha must be in [0.0, 1.0]");
        }

        match self.embedding.provider.as_str() {
            "disabled" | "openai" | "ollama" => {}
            other => bail!(
                "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
                other
            ),
        }
        if self.embedding.is_enabled() {
            if self.embedding.dims.is_none() || self.embedding.dims == Some(0) {
                bail!(
                    "embedding.dims must be > 0 when provider is '{}'",
                    self.embedding.provider
                );
            }
            if self.embedding.model.is_none() {
                bail!(
                    "embedding.model must be specified when provider is '{}'",
                    self.embedding.provider
                );
            }
            if self.embedding.batch_size == 0 {
                bail!("embedding.batch_size must be > 0");
            }
        }

        match self.llm.provider.as_str() {
            "disabled" | "llamacpp" => {}
            "ollama" | "openai" => {
                if self.llm.model.is_none() {
                    bail!(
                        "llm.model must be specified when provider is '{}'",
                        self.llm.provider
                    );
                }
            }
            other => bail!(
                "Unknown llm provider: '{}'. Must be disabled, ollama, openai, or llamacpp.",
                other
            ),
        }

        if self.auth.token_ttl_minutes <= 0 {
            bail!("auth.token_ttl_minutes must be > 0");
        }
        if self.auth.token_ttl_minutes > MAX_TOKEN_TTL_MINUTES {
            bail!(
                "auth.token_ttl_minutes must be <= {} (ten years)",
                MAX_TOKEN_TTL_MINUTES
            );
        }
        if self.auth.password_hash_rounds < 1000 {
            bail!("auth.password_hash_rounds must be >= 1000");
        }

        Ok(())
    }
}

/// Parse and validate a config document.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    config.validate()?;
    Ok(config)
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}
