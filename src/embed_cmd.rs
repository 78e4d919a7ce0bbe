//! Embedding backfill and storage.
//!
//! A chunk is *pending* when it has no embedding for the configured model or
//! its stored hash no longer matches the chunk text. Uploads embed inline
//! through [`embed_chunks`]; anything that failed there is picked up later by
//! [`embed_pending`] (`ragnote embed pending`, `POST /index/sync`).

use anyhow::{bail, Result};
use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;
use crate::embedding;
use crate::models::Chunk;

#[derive(Debug, Default, Clone, Serialize)]
pub struct EmbedSummary {
    pub total: u64,
    pub embedded: u64,
    pub failed: u64,
}

/// Result of embedding a freshly chunked document.
#[derive(Debug, Default)]
pub struct InlineEmbedding {
    /// `(chunk_id, vector)` for every stored embedding, ready for the index.
    pub vectors: Vec<(String, Vec<f32>)>,
    pub embedded: u64,
    pub pending: u64,
}

/// Embed chunks during ingestion. Non-fatal on failure: chunks that could
/// not be embedded are counted as pending.
pub async fn embed_chunks(config: &Config, pool: &SqlitePool, chunks: &[Chunk]) -> InlineEmbedding {
    let mut outcome = InlineEmbedding::default();
    if !config.embedding.is_enabled() || chunks.is_empty() {
        return outcome;
    }

    let provider = match embedding::create_provider(&config.embedding) {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!(error = %e, "could not create embedding provider");
            outcome.pending = chunks.len() as u64;
            return outcome;
        }
    };
    let model_name = provider.model_name().to_string();

    for batch in chunks.chunks(config.embedding.batch_size.max(1)) {
        let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();

        match embedding::embed_texts(&config.embedding, &texts).await {
            Ok(vectors) => {
                for (chunk, vec) in batch.iter().zip(vectors) {
                    let blob = embedding::vec_to_blob(&vec);
                    if let Err(e) = upsert_embedding(
                        pool,
                        &chunk.id,
                        &chunk.document_id,
                        &model_name,
                        provider.dims(),
                        &chunk.hash,
                        &blob,
                    )
                    .await
                    {
                        tracing::warn!(chunk_id = %chunk.id, error = %e, "failed to store embedding");
                        outcome.pending += 1;
                    } else {
                        outcome.embedded += 1;
                        outcome.vectors.push((chunk.id.clone(), vec));
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, chunks = batch.len(), "embedding batch failed");
                outcome.pending += batch.len() as u64;
            }
        }
    }

    outcome
}

/// Embed every pending chunk, up to `limit`.
pub async fn embed_pending(
    pool: &SqlitePool,
    config: &Config,
    limit: Option<usize>,
    batch_size: usize,
) -> Result<EmbedSummary> {
    if !config.embedding.is_enabled() {
        bail!("Embedding provider is disabled. Set [embedding] provider in config.");
    }
    let provider = embedding::create_provider(&config.embedding)?;
    let model_name = provider.model_name().to_string();

    let pending = find_pending_chunks(pool, &model_name, limit).await?;
    embed_batches(pool, config, &model_name, provider.dims(), &pending, batch_size).await
}

/// Delete all stored embeddings and regenerate them.
pub async fn rebuild(pool: &SqlitePool, config: &Config, batch_size: usize) -> Result<EmbedSummary> {
    if !config.embedding.is_enabled() {
        bail!("Embedding provider is disabled. Set [embedding] provider in config.");
    }
    let provider = embedding::create_provider(&config.embedding)?;
    let model_name = provider.model_name().to_string();

    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM chunk_vectors")
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM embeddings").execute(&mut *tx).await?;
    tx.commit().await?;
    tracing::info!("cleared existing embeddings");

    let all_chunks = find_pending_chunks(pool, &model_name, None).await?;
    embed_batches(pool, config, &model_name, provider.dims(), &all_chunks, batch_size).await
}

/// CLI entry point for `ragnote embed pending`.
pub async fn run_embed_pending(
    config: &Config,
    limit: Option<usize>,
    batch_size_override: Option<usize>,
    dry_run: bool,
) -> Result<()> {
    if !config.embedding.is_enabled() {
        bail!("Embedding provider is disabled. Set [embedding] provider in config.");
    }
    let pool = db::connect(config).await?;

    if dry_run {
        let provider = embedding::create_provider(&config.embedding)?;
        let pending = find_pending_chunks(&pool, provider.model_name(), limit).await?;
        println!("embed pending (dry-run)");
        println!("  chunks needing embeddings: {}", pending.len());
        pool.close().await;
        return Ok(());
    }

    let batch_size = batch_size_override.unwrap_or(config.embedding.batch_size);
    let summary = embed_pending(&pool, config, limit, batch_size).await?;

    println!("embed pending");
    if summary.total == 0 {
        println!("  all chunks up to date");
    } else {
        println!("  total pending: {}", summary.total);
        println!("  embedded: {}", summary.embedded);
        println!("  failed: {}", summary.failed);
    }

    pool.close().await;
    Ok(())
}

/// CLI entry point for `ragnote embed rebuild`.
pub async fn run_embed_rebuild(config: &Config, batch_size_override: Option<usize>) -> Result<()> {
    let pool = db::connect(config).await?;
    let batch_size = batch_size_override.unwrap_or(config.embedding.batch_size);
    let summary = rebuild(&pool, config, batch_size).await?;

    println!("embed rebuild");
    println!("  total chunks: {}", summary.total);
    println!("  embedded: {}", summary.embedded);
    println!("  failed: {}", summary.failed);

    pool.close().await;
    Ok(())
}

struct PendingChunk {
    chunk_id: String,
    document_id: String,
    text: String,
    hash: String,
}

async fn embed_batches(
    pool: &SqlitePool,
    config: &Config,
    model_name: &str,
    dims: usize,
    items: &[PendingChunk],
    batch_size: usize,
) -> Result<EmbedSummary> {
    let mut summary = EmbedSummary {
        total: items.len() as u64,
        ..EmbedSummary::default()
    };

    for batch in items.chunks(batch_size.max(1)) {
        let texts: Vec<String> = batch.iter().map(|p| p.text.clone()).collect();

        match embedding::embed_texts(&config.embedding, &texts).await {
            Ok(vectors) => {
                for (item, vec) in batch.iter().zip(vectors.iter()) {
                    let blob = embedding::vec_to_blob(vec);
                    upsert_embedding(
                        pool,
                        &item.chunk_id,
                        &item.document_id,
                        model_name,
                        dims,
                        &item.hash,
                        &blob,
                    )
                    .await?;
                    summary.embedded += 1;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, chunks = batch.len(), "embedding batch failed");
                summary.failed += batch.len() as u64;
            }
        }
    }

    tracing::info!(
        total = summary.total,
        embedded = summary.embedded,
        failed = summary.failed,
        "embedding pass finished"
    );
    Ok(summary)
}

/// Chunks of one document that are missing or stale embeddings for `model`.
pub async fn pending_document_chunks(
    pool: &SqlitePool,
    model: &str,
    document_id: &str,
) -> Result<Vec<Chunk>> {
    let rows = sqlx::query(
        r#"
        SELECT c.id, c.document_id, c.chunk_index, c.text, c.hash
        FROM chunks c
        LEFT JOIN embeddings e ON e.chunk_id = c.id AND e.model = ?
        WHERE c.document_id = ? AND (e.chunk_id IS NULL OR e.hash != c.hash)
        ORDER BY c.chunk_index
        "#,
    )
    .bind(model)
    .bind(document_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| Chunk {
            id: row.get("id"),
            document_id: row.get("document_id"),
            chunk_index: row.get("chunk_index"),
            text: row.get("text"),
            hash: row.get("hash"),
        })
        .collect())
}

async fn find_pending_chunks(
    pool: &SqlitePool,
    model: &str,
    limit: Option<usize>,
) -> Result<Vec<PendingChunk>> {
    let limit_val = limit.map(|l| l as i64).unwrap_or(-1);

    // missing for this model, or stale hash
    let rows = sqlx::query(
        r#"
        SELECT c.id AS chunk_id, c.document_id, c.text, c.hash
        FROM chunks c
        LEFT JOIN embeddings e ON e.chunk_id = c.id AND e.model = ?
        WHERE e.chunk_id IS NULL OR e.hash != c.hash
        ORDER BY c.document_id, c.chunk_index
        LIMIT ?
        "#,
    )
    .bind(model)
    .bind(limit_val)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| PendingChunk {
            chunk_id: row.get("chunk_id"),
            document_id: row.get("document_id"),
            text: row.get("text"),
            hash: row.get("hash"),
        })
        .collect())
}

async fn upsert_embedding(
    pool: &SqlitePool,
    chunk_id: &str,
    document_id: &str,
    model: &str,
    dims: usize,
    text_hash: &str,
    blob: &[u8],
) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO embeddings (chunk_id, model, dims, created_at, hash)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(chunk_id) DO UPDATE SET
            model = excluded.model,
            dims = excluded.dims,
            created_at = excluded.created_at,
            hash = excluded.hash
        "#,
    )
    .bind(chunk_id)
    .bind(model)
    .bind(dims as i64)
    .bind(now)
    .bind(text_hash)
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO chunk_vectors (chunk_id, document_id, embedding)
        VALUES (?, ?, ?)
        ON CONFLICT(chunk_id) DO UPDATE SET
            document_id = excluded.document_id,
            embedding = excluded.embedding
        "#,
    )
    .bind(chunk_id)
    .bind(document_id)
    .bind(blob)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}
