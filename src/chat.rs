//! Grounded question answering.
//!
//! Retrieves the top-k passages for a message, assembles a prompt, and asks
//! the configured language model. With no model configured the passages
//! themselves are returned as the answer.

use serde::Serialize;
use sqlx::SqlitePool;
use thiserror::Error;

use crate::config::{Config, SearchMode};
use crate::db;
use crate::index::VectorIndex;
use crate::llm;
use crate::prompt;
use crate::search::{self, RetrievedChunk};

/// Upper bound for a caller-supplied `top_k`.
pub const MAX_TOP_K: usize = 50;

const NO_MATCHES_ANSWER: &str = "No relevant passages found.";

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("message must not be empty")]
    EmptyMessage,
    #[error("No documents uploaded yet.")]
    NoDocuments,
    #[error("retrieval failed: {0}")]
    Retrieval(anyhow::Error),
    #[error("language model request failed: {0}")]
    Generation(anyhow::Error),
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatSource {
    pub document_id: String,
    pub title: Option<String>,
    pub source_id: String,
    pub chunk_index: i64,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatAnswer {
    pub response: String,
    pub sources: Vec<ChatSource>,
    pub model: Option<String>,
    pub retrieval_only: bool,
}

pub async fn answer(
    pool: &SqlitePool,
    index: &VectorIndex,
    config: &Config,
    message: &str,
    top_k: Option<usize>,
) -> Result<ChatAnswer, ChatError> {
    let message = message.trim();
    if message.is_empty() {
        return Err(ChatError::EmptyMessage);
    }

    let indexed: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
        .fetch_one(pool)
        .await
        .map_err(|e| ChatError::Retrieval(e.into()))?;
    if indexed == 0 {
        return Err(ChatError::NoDocuments);
    }

    let k = top_k.unwrap_or(config.retrieval.top_k).clamp(1, MAX_TOP_K);
    let passages = retrieve(pool, index, config, message, k).await?;

    let (response, retrieval_only) = if config.llm.is_enabled() {
        let prompt = prompt::build_prompt(message, &passages, config.llm.max_context_tokens);
        let answer = llm::generate(&config.llm, &prompt)
            .await
            .map_err(ChatError::Generation)?;
        (answer, false)
    } else if passages.is_empty() {
        (NO_MATCHES_ANSWER.to_string(), true)
    } else {
        (prompt::retrieval_only_answer(&passages), true)
    };

    tracing::info!(
        passages = passages.len(),
        retrieval_only,
        "chat answered"
    );

    Ok(ChatAnswer {
        response,
        sources: passages
            .into_iter()
            .map(|p| ChatSource {
                document_id: p.document_id,
                title: p.title,
                source_id: p.source_id,
                chunk_index: p.chunk_index,
                score: p.score,
            })
            .collect(),
        model: llm::model_label(&config.llm),
        retrieval_only,
    })
}

/// Retrieve with the configured mode. If the embedding service fails, fall
/// back to keyword retrieval rather than failing the turn.
async fn retrieve(
    pool: &SqlitePool,
    index: &VectorIndex,
    config: &Config,
    message: &str,
    k: usize,
) -> Result<Vec<RetrievedChunk>, ChatError> {
    let mode = config.retrieval.effective_mode(&config.embedding);

    match search::retrieve_chunks(pool, index, config, message, mode, k).await {
        Ok(passages) => Ok(passages),
        Err(e) if mode != SearchMode::Keyword => {
            tracing::warn!(error = %e, %mode, "retrieval failed, falling back to keyword");
            search::retrieve_chunks(pool, index, config, message, SearchMode::Keyword, k)
                .await
                .map_err(ChatError::Retrieval)
        }
        Err(e) => Err(ChatError::Retrieval(e)),
    }
}

/// CLI entry point for `ragnote ask`.
pub async fn run_ask(config: &Config, question: &str, top_k: Option<usize>) -> anyhow::Result<()> {
    let pool = db::connect(config).await?;
    let index = VectorIndex::for_config(&pool, &config.embedding).await?;
    let result = answer(&pool, &index, config, question, top_k).await;
    pool.close().await;
    let reply = result?;

    println!("{}", reply.response);
    if !reply.sources.is_empty() {
        println!();
        println!("Sources:");
        for (i, source) in reply.sources.iter().enumerate() {
            println!(
                "  [{}] {} (chunk {}, score {:.2})",
                i + 1,
                source.title.as_deref().unwrap_or(&source.source_id),
                source.chunk_index,
                source.score
            );
        }
    }
    Ok(())
}
