//! Document ingestion: extraction → chunking → embedding → storage.
//!
//! Uploads and local files share [`index_item`]. A document is identified by
//! `(source, source_id)`; indexing it again replaces its chunks, FTS rows,
//! and vectors in place, leaving every other document untouched. Unchanged
//! content (same dedup hash) is skipped.
//!
//! Embedding is inline and non-fatal: chunks that could not be embedded stay
//! pending until `ragnote embed pending` or `POST /index/sync`.

use anyhow::Result;
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::chunk::chunk_text;
use crate::config::Config;
use crate::db;
use crate::documents;
use crate::embed_cmd;
use crate::extract::{self, ExtractError};
use crate::index::VectorIndex;
use crate::local_files;
use crate::models::{Chunk, IngestItem};

pub const SOURCE_UPLOAD: &str = "upload";
pub const SOURCE_FILE: &str = "file";

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("unsupported file type: {0}")]
    UnsupportedType(String),
    #[error("invalid filename: {0}")]
    InvalidFilename(String),
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error("no text could be extracted from {0}")]
    EmptyText(String),
    #[error("extraction aborted for {0}: file is malformed")]
    ExtractionAborted(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestOutcome {
    pub document_id: String,
    pub chunks: u64,
    pub embedded: u64,
    pub pending: u64,
    pub unchanged: bool,
}

/// Reduce a client-supplied filename to a safe basename.
pub fn sanitize_filename(name: &str) -> Result<String, IngestError> {
    let base = name
        .rsplit(|c: char| c == '/' || c == '\\')
        .next()
        .unwrap_or("")
        .trim();

    if base.is_empty() || base == "." || base == ".." || base.chars().any(char::is_control) {
        return Err(IngestError::InvalidFilename(name.to_string()));
    }
    Ok(base.to_string())
}

/// Extract, store, and index an uploaded file. The filename is the
/// document's identity: uploading the same name again replaces it.
pub async fn ingest_upload(
    pool: &SqlitePool,
    index: &VectorIndex,
    config: &Config,
    filename: &str,
    bytes: Vec<u8>,
) -> Result<IngestOutcome, IngestError> {
    let name = sanitize_filename(filename)?;
    let content_type = extract::content_type_for_filename(&name)
        .ok_or_else(|| IngestError::UnsupportedType(name.clone()))?;

    let bytes = Arc::new(bytes);
    let shared = Arc::clone(&bytes);
    let text = extract_isolated(&name, move || extract::extract_text(&shared, content_type)).await?;

    if text.trim().is_empty() {
        return Err(IngestError::EmptyText(name));
    }

    let uploads_dir = &config.server.uploads_dir;
    tokio::fs::create_dir_all(uploads_dir)
        .await
        .map_err(|e| IngestError::Other(e.into()))?;
    tokio::fs::write(uploads_dir.join(&name), bytes.as_slice())
        .await
        .map_err(|e| IngestError::Other(e.into()))?;

    let item = IngestItem {
        source: SOURCE_UPLOAD.to_string(),
        source_id: name.clone(),
        source_url: None,
        title: Some(name.clone()),
        content_type: content_type.to_string(),
        body: text,
        metadata_json: serde_json::json!({ "filename": name, "size_bytes": bytes.len() })
            .to_string(),
        updated_at: chrono::Utc::now(),
    };

    let outcome = index_item(pool, Some(index), config, &item).await?;
    tracing::info!(
        filename = %name,
        document_id = %outcome.document_id,
        chunks = outcome.chunks,
        embedded = outcome.embedded,
        pending = outcome.pending,
        "upload indexed"
    );
    Ok(outcome)
}

/// Run an extractor on the blocking pool. Parsers for binary formats can
/// panic on malformed input; that surfaces as `ExtractionAborted`.
async fn extract_isolated<F>(name: &str, extract: F) -> Result<String, IngestError>
where
    F: FnOnce() -> Result<String, ExtractError> + Send + 'static,
{
    match tokio::task::spawn_blocking(extract).await {
        Ok(result) => Ok(result?),
        Err(e) => {
            tracing::warn!(file = %name, error = %e, "extractor aborted");
            Err(IngestError::ExtractionAborted(name.to_string()))
        }
    }
}

/// Upsert a document and rebuild its chunks and vectors.
///
/// `index` is the live vector index to update, if one is loaded.
pub async fn index_item(
    pool: &SqlitePool,
    index: Option<&VectorIndex>,
    config: &Config,
    item: &IngestItem,
) -> Result<IngestOutcome> {
    let dedup_hash = dedup_hash(item);

    let existing: Option<(String, String)> =
        sqlx::query_as("SELECT id, dedup_hash FROM documents WHERE source = ? AND source_id = ?")
            .bind(&item.source)
            .bind(&item.source_id)
            .fetch_optional(pool)
            .await?;

    if let Some((id, hash)) = &existing {
        if *hash == dedup_hash {
            return resume_unchanged(pool, index, config, id).await;
        }
    }

    let doc_id = existing
        .map(|(id, _)| id)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let chunks = chunk_text(
        &doc_id,
        &item.body,
        config.chunking.max_tokens,
        config.chunking.overlap_tokens,
    );
    write_document(pool, &doc_id, item, &dedup_hash, &chunks).await?;

    let embedded = embed_cmd::embed_chunks(config, pool, &chunks).await;

    if let Some(index) = index {
        let count = embedded.vectors.len();
        if let Err(e) = index.replace_document(&doc_id, embedded.vectors) {
            tracing::warn!(document_id = %doc_id, error = %e, "vector index not updated");
        } else {
            tracing::debug!(document_id = %doc_id, vectors = count, "vector index updated");
        }
    }

    Ok(IngestOutcome {
        document_id: doc_id,
        chunks: chunks.len() as u64,
        embedded: embedded.embedded,
        pending: embedded.pending,
        unchanged: false,
    })
}

/// Unchanged content is not re-chunked, but chunks still missing vectors
/// from an earlier failed pass are embedded now.
async fn resume_unchanged(
    pool: &SqlitePool,
    index: Option<&VectorIndex>,
    config: &Config,
    doc_id: &str,
) -> Result<IngestOutcome> {
    let chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE document_id = ?")
        .bind(doc_id)
        .fetch_one(pool)
        .await?;
    let mut outcome = IngestOutcome {
        document_id: doc_id.to_string(),
        chunks: chunks as u64,
        embedded: 0,
        pending: 0,
        unchanged: true,
    };

    let model = match config.embedding.model.as_deref() {
        Some(model) if config.embedding.is_enabled() => model,
        _ => return Ok(outcome),
    };
    let pending = embed_cmd::pending_document_chunks(pool, model, doc_id).await?;
    if pending.is_empty() {
        return Ok(outcome);
    }

    let embedded = embed_cmd::embed_chunks(config, pool, &pending).await;
    outcome.embedded = embedded.embedded;
    outcome.pending = embedded.pending;

    if let Some(index) = index {
        if embedded.embedded > 0 {
            if let Err(e) = index.reload_document(pool, doc_id).await {
                tracing::warn!(document_id = %doc_id, error = %e, "vector index not updated");
            }
        }
    }

    tracing::debug!(
        document_id = %doc_id,
        embedded = outcome.embedded,
        pending = outcome.pending,
        "resumed embedding for unchanged document"
    );
    Ok(outcome)
}

/// Delete a document and, for uploads, its stored file.
/// Returns `false` if the document did not exist.
pub async fn delete_upload(
    pool: &SqlitePool,
    index: Option<&VectorIndex>,
    config: &Config,
    document_id: &str,
) -> Result<bool> {
    let origin: Option<(String, String)> =
        sqlx::query_as("SELECT source, source_id FROM documents WHERE id = ?")
            .bind(document_id)
            .fetch_optional(pool)
            .await?;
    let Some((source, source_id)) = origin else {
        return Ok(false);
    };

    documents::delete_document(pool, document_id).await?;
    if let Some(index) = index {
        index.remove_document(document_id);
    }

    if source == SOURCE_UPLOAD {
        let path = config.server.uploads_dir.join(&source_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "could not remove stored upload"),
        }
    }

    tracing::info!(document_id, "document deleted");
    Ok(true)
}

/// CLI entry point for `ragnote ingest`.
pub async fn run_ingest(config: &Config, paths: &[PathBuf], include: &[String]) -> Result<()> {
    let files = local_files::collect_files(paths, include)?;
    let pool = db::connect(config).await?;

    let mut indexed = 0u64;
    let mut unchanged = 0u64;
    let mut skipped = 0u64;
    let mut chunks_written = 0u64;
    let mut embeddings_written = 0u64;
    let mut embeddings_pending = 0u64;

    for file in &files {
        let bytes = Arc::new(std::fs::read(&file.path)?);
        let shared = Arc::clone(&bytes);
        let content_type = file.content_type;
        let extracted =
            extract_isolated(&file.source_id, move || extract::extract_text(&shared, content_type))
                .await;
        let text = match extracted {
            Ok(t) if !t.trim().is_empty() => t,
            Ok(_) => {
                tracing::warn!(path = %file.source_id, "no text extracted, skipping");
                skipped += 1;
                continue;
            }
            Err(e) => {
                tracing::warn!(path = %file.source_id, error = %e, "extraction failed, skipping");
                skipped += 1;
                continue;
            }
        };

        let title = file
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string());
        let item = IngestItem {
            source: SOURCE_FILE.to_string(),
            source_id: file.source_id.clone(),
            source_url: Some(format!("file://{}", file.source_id)),
            title,
            content_type: file.content_type.to_string(),
            body: text,
            metadata_json: serde_json::json!({ "size_bytes": bytes.len() }).to_string(),
            updated_at: file.modified,
        };

        let outcome = index_item(&pool, None, config, &item).await?;
        embeddings_written += outcome.embedded;
        embeddings_pending += outcome.pending;
        if outcome.unchanged {
            unchanged += 1;
            continue;
        }
        indexed += 1;
        chunks_written += outcome.chunks;
    }

    println!("ingest");
    println!("  files found: {}", files.len());
    println!("  indexed documents: {}", indexed);
    println!("  unchanged: {}", unchanged);
    println!("  skipped: {}", skipped);
    println!("  chunks written: {}", chunks_written);
    if config.embedding.is_enabled() {
        println!("  embeddings written: {}", embeddings_written);
        println!("  embeddings pending: {}", embeddings_pending);
    }
    println!("ok");

    pool.close().await;
    Ok(())
}

fn dedup_hash(item: &IngestItem) -> String {
    let mut hasher = Sha256::new();
    hasher.update(item.source.as_bytes());
    hasher.update([0u8]);
    hasher.update(item.source_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(item.body.as_bytes());
    format!("{:x}", hasher.finalize())
}

async fn write_document(
    pool: &SqlitePool,
    doc_id: &str,
    item: &IngestItem,
    dedup_hash: &str,
    chunks: &[Chunk],
) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO documents (id, source, source_id, source_url, title, created_at, updated_at, content_type, body, metadata_json, dedup_hash)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(source, source_id) DO UPDATE SET
            source_url = excluded.source_url,
            title = excluded.title,
            updated_at = excluded.updated_at,
            content_type = excluded.content_type,
            body = excluded.body,
            metadata_json = excluded.metadata_json,
            dedup_hash = excluded.dedup_hash
        "#,
    )
    .bind(doc_id)
    .bind(&item.source)
    .bind(&item.source_id)
    .bind(&item.source_url)
    .bind(&item.title)
    .bind(now)
    .bind(item.updated_at.timestamp())
    .bind(&item.content_type)
    .bind(&item.body)
    .bind(&item.metadata_json)
    .bind(dedup_hash)
    .execute(&mut *tx)
    .await?;

    sqlx::query("DELETE FROM chunk_vectors WHERE document_id = ?")
        .bind(doc_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query(
        "DELETE FROM embeddings WHERE chunk_id IN (SELECT id FROM chunks WHERE document_id = ?)",
    )
    .bind(doc_id)
    .execute(&mut *tx)
    .await?;
    sqlx::query("DELETE FROM chunks_fts WHERE document_id = ?")
        .bind(doc_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM chunks WHERE document_id = ?")
        .bind(doc_id)
        .execute(&mut *tx)
        .await?;

    for chunk in chunks {
        sqlx::query(
            "INSERT INTO chunks (id, document_id, chunk_index, text, hash) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&chunk.id)
        .bind(&chunk.document_id)
        .bind(chunk.chunk_index)
        .bind(&chunk.text)
        .bind(&chunk.hash)
        .execute(&mut *tx)
        .await?;

        sqlx::query("INSERT INTO chunks_fts (chunk_id, document_id, text) VALUES (?, ?, ?)")
            .bind(&chunk.id)
            .bind(&chunk.document_id)
            .bind(&chunk.text)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    Ok(())
}
