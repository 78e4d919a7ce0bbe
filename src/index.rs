//! In-memory vector index over chunk embeddings.
//!
//! The persistent copy of every vector lives in `chunk_vectors`; this index
//! mirrors the vectors of one embedding model so a query does not have to
//! scan SQLite. Updates are per document: re-ingesting a document swaps its
//! vectors in one write-locked step, so concurrent readers see either the
//! old or the new set, never a mix.
//!
//! Search is exact brute-force cosine similarity.

use std::cmp::Ordering;
use std::collections::HashMap;

use anyhow::{bail, Result};
use parking_lot::RwLock;
use sqlx::{Row, SqlitePool};

use crate::config::EmbeddingConfig;
use crate::embedding;

/// A nearest-neighbour hit.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorHit {
    pub chunk_id: String,
    pub document_id: String,
    pub score: f32,
}

type DocumentVectors = Vec<(String, Vec<f32>)>;

pub struct VectorIndex {
    model: String,
    dims: usize,
    entries: RwLock<HashMap<String, DocumentVectors>>,
}

impl VectorIndex {
    pub fn new(model: impl Into<String>, dims: usize) -> Self {
        Self {
            model: model.into(),
            dims,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Build an index from the vectors stored for `model`.
    pub async fn load(pool: &SqlitePool, model: &str, dims: usize) -> Result<Self> {
        let index = Self::new(model, dims);
        index.reload(pool).await?;
        Ok(index)
    }

    /// Replace the whole in-memory contents with what is stored in SQLite.
    ///
    /// Rows with the wrong dimensionality are skipped with a warning.
    pub async fn reload(&self, pool: &SqlitePool) -> Result<usize> {
        let rows = sqlx::query(
            r#"
            SELECT cv.chunk_id, cv.document_id, cv.embedding
            FROM chunk_vectors cv
            JOIN embeddings e ON e.chunk_id = cv.chunk_id
            WHERE e.model = ?
            ORDER BY cv.document_id, cv.chunk_id
            "#,
        )
        .bind(&self.model)
        .fetch_all(pool)
        .await?;

        let mut fresh: HashMap<String, DocumentVectors> = HashMap::new();
        let mut loaded = 0usize;
        let mut skipped = 0usize;

        for row in &rows {
            let blob: Vec<u8> = row.get("embedding");
            let vector = embedding::blob_to_vec(&blob);
            if vector.len() != self.dims {
                skipped += 1;
                continue;
            }
            let document_id: String = row.get("document_id");
            fresh
                .entry(document_id)
                .or_default()
                .push((row.get("chunk_id"), vector));
            loaded += 1;
        }

        if skipped > 0 {
            tracing::warn!(
                skipped,
                model = %self.model,
                dims = self.dims,
                "skipped stored vectors with mismatched dimensions"
            );
        }

        *self.entries.write() = fresh;
        tracing::debug!(loaded, model = %self.model, "vector index loaded");
        Ok(loaded)
    }

    /// Re-read one document's stored vectors and swap them in.
    pub async fn reload_document(&self, pool: &SqlitePool, document_id: &str) -> Result<usize> {
        let rows = sqlx::query(
            r#"
            SELECT cv.chunk_id, cv.embedding
            FROM chunk_vectors cv
            JOIN embeddings e ON e.chunk_id = cv.chunk_id
            WHERE e.model = ? AND cv.document_id = ?
            ORDER BY cv.chunk_id
            "#,
        )
        .bind(&self.model)
        .bind(document_id)
        .fetch_all(pool)
        .await?;

        let mut vectors: DocumentVectors = Vec::with_capacity(rows.len());
        for row in &rows {
            let blob: Vec<u8> = row.get("embedding");
            let vector = embedding::blob_to_vec(&blob);
            if vector.len() == self.dims {
                vectors.push((row.get("chunk_id"), vector));
            }
        }
        let count = vectors.len();
        self.replace_document(document_id, vectors)?;
        Ok(count)
    }

    /// Open the index for the configured embedding model. With embeddings
    /// disabled this is an empty index that never matches.
    pub async fn for_config(pool: &SqlitePool, config: &EmbeddingConfig) -> Result<Self> {
        match (config.is_enabled(), config.model.as_deref(), config.dims) {
            (true, Some(model), Some(dims)) => Self::load(pool, model, dims).await,
            _ => Ok(Self::new("disabled", 0)),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    /// Swap in the vectors for one document. An empty set removes it.
    pub fn replace_document(&self, document_id: &str, vectors: DocumentVectors) -> Result<()> {
        if let Some((chunk_id, v)) = vectors.iter().find(|(_, v)| v.len() != self.dims) {
            bail!(
                "Vector for chunk {} has {} dims, index expects {}",
                chunk_id,
                v.len(),
                self.dims
            );
        }

        let mut entries = self.entries.write();
        if vectors.is_empty() {
            entries.remove(document_id);
        } else {
            entries.insert(document_id.to_string(), vectors);
        }
        Ok(())
    }

    pub fn remove_document(&self, document_id: &str) -> bool {
        self.entries.write().remove(document_id).is_some()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Number of indexed chunk vectors.
    pub fn len(&self) -> usize {
        self.entries.read().values().map(|v| v.len()).sum()
    }

    pub fn document_count(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().values().all(|v| v.is_empty())
    }

    /// Top-`k` chunks by cosine similarity to `query`, best first.
    /// Ties are broken by chunk id so results are deterministic.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<VectorHit> {
        if k == 0 || query.len() != self.dims {
            return Vec::new();
        }

        let entries = self.entries.read();
        let mut hits: Vec<VectorHit> = entries
            .iter()
            .flat_map(|(document_id, vectors)| {
                vectors.iter().map(move |(chunk_id, v)| VectorHit {
                    chunk_id: chunk_id.clone(),
                    document_id: document_id.clone(),
                    score: embedding::cosine_similarity(query, v),
                })
            })
            .collect();
        drop(entries);

        if hits.len() > k {
            hits.select_nth_unstable_by(k - 1, compare_hits);
            hits.truncate(k);
        }
        hits.sort_by(compare_hits);
        hits
    }
}

fn compare_hits(a: &VectorHit, b: &VectorHit) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.chunk_id.cmp(&b.chunk_id))
}
