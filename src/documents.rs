//! Indexed document listing, retrieval, and removal.
//!
//! Used by the `ragnote documents|get|delete` commands and the
//! `/documents` routes.

use anyhow::{bail, Result};
use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;
use crate::models::format_ts_iso;

#[derive(Debug, Clone, Serialize)]
pub struct DocumentSummary {
    pub id: String,
    pub source: String,
    pub source_id: String,
    pub title: Option<String>,
    pub content_type: String,
    pub updated_at: String,
    pub chunk_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentResponse {
    pub id: String,
    pub source: String,
    pub source_id: String,
    pub source_url: Option<String>,
    pub title: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub content_type: String,
    pub body: String,
    pub metadata: serde_json::Value,
    pub chunks: Vec<ChunkResponse>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkResponse {
    pub index: i64,
    pub text: String,
}

/// Most recently updated first.
pub async fn list_documents(pool: &SqlitePool) -> Result<Vec<DocumentSummary>> {
    let rows = sqlx::query(
        r#"
        SELECT d.id, d.source, d.source_id, d.title, d.content_type, d.updated_at,
               COUNT(c.id) AS chunk_count
        FROM documents d
        LEFT JOIN chunks c ON c.document_id = d.id
        GROUP BY d.id
        ORDER BY d.updated_at DESC, d.id ASC
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| DocumentSummary {
            id: row.get("id"),
            source: row.get("source"),
            source_id: row.get("source_id"),
            title: row.get("title"),
            content_type: row.get("content_type"),
            updated_at: format_ts_iso(row.get("updated_at")),
            chunk_count: row.get("chunk_count"),
        })
        .collect())
}

pub async fn get_document(pool: &SqlitePool, id: &str) -> Result<Option<DocumentResponse>> {
    let doc_row = sqlx::query(
        "SELECT id, source, source_id, source_url, title, created_at, updated_at, content_type, body, metadata_json FROM documents WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    let Some(doc_row) = doc_row else {
        return Ok(None);
    };

    let metadata_json: String = doc_row.get("metadata_json");
    let metadata: serde_json::Value =
        serde_json::from_str(&metadata_json).unwrap_or(serde_json::json!({}));

    let chunk_rows = sqlx::query(
        "SELECT chunk_index, text FROM chunks WHERE document_id = ? ORDER BY chunk_index ASC",
    )
    .bind(id)
    .fetch_all(pool)
    .await?;

    let chunks = chunk_rows
        .iter()
        .map(|row| ChunkResponse {
            index: row.get("chunk_index"),
            text: row.get("text"),
        })
        .collect();

    Ok(Some(DocumentResponse {
        id: doc_row.get("id"),
        source: doc_row.get("source"),
        source_id: doc_row.get("source_id"),
        source_url: doc_row.get("source_url"),
        title: doc_row.get("title"),
        created_at: format_ts_iso(doc_row.get("created_at")),
        updated_at: format_ts_iso(doc_row.get("updated_at")),
        content_type: doc_row.get("content_type"),
        body: doc_row.get("body"),
        metadata,
        chunks,
    }))
}

/// Remove a document with its chunks, FTS rows, and vectors in one
/// transaction. Returns `false` if the document did not exist.
pub async fn delete_document(pool: &SqlitePool, id: &str) -> Result<bool> {
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM chunk_vectors WHERE document_id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM embeddings WHERE chunk_id IN (SELECT id FROM chunks WHERE document_id = ?)")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM chunks_fts WHERE document_id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM chunks WHERE document_id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    let deleted = sqlx::query("DELETE FROM documents WHERE id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

    tx.commit().await?;
    Ok(deleted > 0)
}

// ============ CLI ============

pub async fn run_list(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let docs = list_documents(&pool).await?;
    pool.close().await;

    if docs.is_empty() {
        println!("No documents indexed.");
        return Ok(());
    }

    println!(
        "{:<36}  {:<8} {:>6}  {:<20}  {}",
        "ID", "SOURCE", "CHUNKS", "UPDATED", "TITLE"
    );
    for doc in &docs {
        println!(
            "{:<36}  {:<8} {:>6}  {:<20}  {}",
            doc.id,
            doc.source,
            doc.chunk_count,
            doc.updated_at,
            doc.title.as_deref().unwrap_or(&doc.source_id)
        );
    }
    Ok(())
}

pub async fn run_get(config: &Config, id: &str) -> Result<()> {
    let pool = db::connect(config).await?;
    let doc = get_document(&pool, id).await?;
    pool.close().await;

    let Some(doc) = doc else {
        bail!("document not found: {}", id);
    };

    println!("--- Document ---");
    println!("id:           {}", doc.id);
    println!(
        "title:        {}",
        doc.title.as_deref().unwrap_or("(untitled)")
    );
    println!("source:       {}", doc.source);
    println!("source_id:    {}", doc.source_id);
    if let Some(ref url) = doc.source_url {
        println!("source_url:   {}", url);
    }
    println!("created_at:   {}", doc.created_at);
    println!("updated_at:   {}", doc.updated_at);
    println!("content_type: {}", doc.content_type);
    println!("metadata:     {}", doc.metadata);
    println!();

    println!("--- Chunks ({}) ---", doc.chunks.len());
    for chunk in &doc.chunks {
        println!("[chunk {}]", chunk.index);
        println!("{}", chunk.text);
        println!();
    }

    Ok(())
}

/// `ragnote delete <id>`: removes the document; stored upload files are
/// removed too.
pub async fn run_delete(config: &Config, id: &str) -> Result<()> {
    let pool = db::connect(config).await?;
    let removed = crate::ingest::delete_upload(&pool, None, config, id).await?;
    pool.close().await;

    if !removed {
        bail!("document not found: {}", id);
    }
    println!("Deleted document {}", id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;
    use crate::migrate;

    async fn seeded() -> (tempfile::TempDir, SqlitePool) {
        let tmp = tempfile::TempDir::new().unwrap();
        let cfg = parse_config(&format!(
            "[db]\npath = \"{}\"\n",
            tmp.path().join("db.sqlite").display()
        ))
        .unwrap();
        let pool = db::connect(&cfg).await.unwrap();
        migrate::apply(&pool).await.unwrap();

        sqlx::query(
            "INSERT INTO documents (id, source, source_id, title, created_at, updated_at, body, dedup_hash, metadata_json)
             VALUES ('d1', 'upload', 'a.txt', 'A', 0, 0, 'alpha beta', 'h', '{\"size\":10}')",
        )
        .execute(&pool)
        .await
        .unwrap();
        for (i, text) in ["alpha", "beta"].iter().enumerate() {
            let id = format!("c{}", i);
            sqlx::query("INSERT INTO chunks (id, document_id, chunk_index, text, hash) VALUES (?, 'd1', ?, ?, '')")
                .bind(&id)
                .bind(i as i64)
                .bind(*text)
                .execute(&pool)
                .await
                .unwrap();
            sqlx::query("INSERT INTO chunks_fts (chunk_id, document_id, text) VALUES (?, 'd1', ?)")
                .bind(&id)
                .bind(*text)
                .execute(&pool)
                .await
                .unwrap();
            sqlx::query("INSERT INTO embeddings (chunk_id, model, dims, created_at, hash) VALUES (?, 'm', 2, 0, '')")
                .bind(&id)
                .execute(&pool)
                .await
                .unwrap();
            sqlx::query("INSERT INTO chunk_vectors (chunk_id, document_id, embedding) VALUES (?, 'd1', x'00')")
                .bind(&id)
                .execute(&pool)
                .await
                .unwrap();
        }
        (tmp, pool)
    }

    #[tokio::test]
    async fn list_and_get() {
        let (_tmp, pool) = seeded().await;

        let docs = list_documents(&pool).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].chunk_count, 2);

        let doc = get_document(&pool, "d1").await.unwrap().unwrap();
        assert_eq!(doc.metadata["size"], 10);
        assert_eq!(doc.chunks.len(), 2);
        assert_eq!(doc.chunks[1].text, "beta");
        assert!(get_document(&pool, "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_removes_every_row() {
        let (_tmp, pool) = seeded().await;

        assert!(delete_document(&pool, "d1").await.unwrap());
        assert!(!delete_document(&pool, "d1").await.unwrap());

        for table in ["documents", "chunks", "chunks_fts", "embeddings", "chunk_vectors"] {
            let n: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
                .fetch_one(&pool)
                .await
                .unwrap();
            assert_eq!(n, 0, "{} not empty", table);
        }
    }
}
