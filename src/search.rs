//! Keyword, semantic, and hybrid retrieval over indexed chunks.
//!
//! Keyword candidates come from FTS5 BM25, semantic candidates from the
//! in-memory [`VectorIndex`]. Each channel is min-max normalized to
//! `[0, 1]` and blended as `(1 - alpha) * keyword + alpha * vector`.
//!
//! Two views sit on top of the blended chunk ranking:
//! - [`retrieve_chunks`]: chunk-level passages for prompt assembly,
//!   capped per document.
//! - [`search_documents`]: document-level results (MAX over chunks).

use anyhow::{bail, Result};
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use crate::config::{Config, SearchMode};
use crate::db;
use crate::embedding;
use crate::index::VectorIndex;
use crate::models::format_ts_iso;

const MAX_QUERY_TERMS: usize = 32;

/// A passage selected for a query.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievedChunk {
    pub chunk_id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub title: Option<String>,
    pub source_id: String,
    pub text: String,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResultItem {
    pub id: String,
    pub title: Option<String>,
    pub source: String,
    pub source_id: String,
    pub source_url: Option<String>,
    pub updated_at: String,
    pub score: f64,
    pub snippet: String,
    #[serde(skip)]
    updated_ts: i64,
}

// ============ Candidate types ============

#[derive(Debug, Clone)]
pub struct ChunkCandidate {
    pub chunk_id: String,
    pub document_id: String,
    pub raw_score: f64,
    pub snippet: String,
}

#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk_id: String,
    pub document_id: String,
    pub score: f64,
    pub snippet: String,
}

// ============ Query building ============

/// Turn free text into an FTS5 query that cannot be a syntax error: every
/// alphanumeric run becomes a quoted term, terms are OR-ed.
///
/// Returns `None` when the text has no searchable terms.
pub fn fts_query(text: &str) -> Option<String> {
    let mut seen = HashSet::new();
    let terms: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .filter(|t| seen.insert(t.clone()))
        .take(MAX_QUERY_TERMS)
        .map(|t| format!("\"{}\"", t))
        .collect();

    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

// ============ Ranking ============

/// Min-max normalize scores to [0, 1]. All-equal scores map to 1.0.
pub fn normalize_scores(candidates: &[ChunkCandidate]) -> Vec<(&ChunkCandidate, f64)> {
    if candidates.is_empty() {
        return Vec::new();
    }

    let s_min = candidates
        .iter()
        .map(|c| c.raw_score)
        .fold(f64::INFINITY, f64::min);
    let s_max = candidates
        .iter()
        .map(|c| c.raw_score)
        .fold(f64::NEG_INFINITY, f64::max);

    candidates
        .iter()
        .map(|c| {
            let norm = if (s_max - s_min).abs() < f64::EPSILON {
                1.0
            } else {
                (c.raw_score - s_min) / (s_max - s_min)
            };
            (c, norm)
        })
        .collect()
}

/// Blend both channels per chunk. A chunk missing from a channel scores 0
/// there. Sorted by score desc, then chunk id.
pub fn merge_hybrid(
    keyword: &[ChunkCandidate],
    vector: &[ChunkCandidate],
    alpha: f64,
) -> Vec<ScoredChunk> {
    let kw_map: HashMap<&str, f64> = normalize_scores(keyword)
        .into_iter()
        .map(|(c, s)| (c.chunk_id.as_str(), s))
        .collect();
    let vec_map: HashMap<&str, f64> = normalize_scores(vector)
        .into_iter()
        .map(|(c, s)| (c.chunk_id.as_str(), s))
        .collect();

    let mut all_chunks: HashMap<&str, &ChunkCandidate> = HashMap::new();
    for c in keyword.iter().chain(vector.iter()) {
        all_chunks
            .entry(c.chunk_id.as_str())
            .and_modify(|existing| {
                if existing.snippet.is_empty() && !c.snippet.is_empty() {
                    *existing = c;
                }
            })
            .or_insert(c);
    }

    let mut scored: Vec<ScoredChunk> = all_chunks
        .into_iter()
        .map(|(chunk_id, cand)| {
            let k = kw_map.get(chunk_id).copied().unwrap_or(0.0);
            let v = vec_map.get(chunk_id).copied().unwrap_or(0.0);
            ScoredChunk {
                chunk_id: chunk_id.to_string(),
                document_id: cand.document_id.clone(),
                score: (1.0 - alpha) * k + alpha * v,
                snippet: cand.snippet.clone(),
            }
        })
        .collect();

    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
    scored
}

// ============ Candidate retrieval ============

async fn fetch_keyword_candidates(
    pool: &SqlitePool,
    query: &str,
    candidate_k: i64,
) -> Result<Vec<ChunkCandidate>> {
    let Some(match_expr) = fts_query(query) else {
        return Ok(Vec::new());
    };

    let rows = sqlx::query(
        r#"
        SELECT chunk_id, document_id, rank,
               snippet(chunks_fts, 2, '>>>', '<<<', '...', 48) AS snippet
        FROM chunks_fts
        WHERE chunks_fts MATCH ?
        ORDER BY rank
        LIMIT ?
        "#,
    )
    .bind(match_expr)
    .bind(candidate_k)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| {
            let rank: f64 = row.get("rank");
            ChunkCandidate {
                chunk_id: row.get("chunk_id"),
                document_id: row.get("document_id"),
                raw_score: -rank, // bm25 rank is lower-is-better
                snippet: row.get("snippet"),
            }
        })
        .collect())
}

async fn fetch_vector_candidates(
    index: &VectorIndex,
    config: &Config,
    query: &str,
    candidate_k: usize,
) -> Result<Vec<ChunkCandidate>> {
    if index.is_empty() {
        return Ok(Vec::new());
    }
    let query_vec = embedding::embed_query(&config.embedding, query).await?;

    Ok(index
        .search(&query_vec, candidate_k)
        .into_iter()
        .map(|hit| ChunkCandidate {
            chunk_id: hit.chunk_id,
            document_id: hit.document_id,
            raw_score: hit.score as f64,
            snippet: String::new(),
        })
        .collect())
}

/// Rank chunks for `query` in `mode`, best first.
async fn rank_chunks(
    pool: &SqlitePool,
    index: &VectorIndex,
    config: &Config,
    query: &str,
    mode: SearchMode,
    min_candidates: usize,
) -> Result<Vec<ScoredChunk>> {
    if mode.needs_embeddings() && !config.embedding.is_enabled() {
        bail!(
            "Mode '{}' requires embeddings. Set [embedding] provider in config.",
            mode
        );
    }

    let keyword = if mode != SearchMode::Semantic {
        let k = config
            .retrieval
            .candidate_k_keyword
            .max(min_candidates as i64);
        fetch_keyword_candidates(pool, query, k).await?
    } else {
        Vec::new()
    };

    let vector = if mode != SearchMode::Keyword {
        let k = (config.retrieval.candidate_k_vector.max(0) as usize).max(min_candidates);
        fetch_vector_candidates(index, config, query, k).await?
    } else {
        Vec::new()
    };

    let alpha = match mode {
        SearchMode::Keyword => 0.0,
        SearchMode::Semantic => 1.0,
        SearchMode::Hybrid => config.retrieval.hybrid_alpha,
    };

    tracing::debug!(
        %mode,
        keyword = keyword.len(),
        vector = vector.len(),
        "retrieval candidates"
    );

    Ok(merge_hybrid(&keyword, &vector, alpha))
}

/// Top-`k` passages for `query`, at most `retrieval.max_chunks_per_doc`
/// from any one document.
pub async fn retrieve_chunks(
    pool: &SqlitePool,
    index: &VectorIndex,
    config: &Config,
    query: &str,
    mode: SearchMode,
    k: usize,
) -> Result<Vec<RetrievedChunk>> {
    if query.trim().is_empty() || k == 0 {
        return Ok(Vec::new());
    }

    let ranked = rank_chunks(pool, index, config, query, mode, k).await?;
    let cap = config.retrieval.max_chunks_per_doc;

    let mut per_doc: HashMap<&str, usize> = HashMap::new();
    let mut out = Vec::with_capacity(k);

    for sc in &ranked {
        if out.len() >= k {
            break;
        }
        let taken = per_doc.entry(sc.document_id.as_str()).or_insert(0);
        if *taken >= cap {
            continue;
        }

        let row = sqlx::query(
            r#"
            SELECT c.chunk_index, c.text, d.title, d.source_id
            FROM chunks c
            JOIN documents d ON d.id = c.document_id
            WHERE c.id = ?
            "#,
        )
        .bind(&sc.chunk_id)
        .fetch_optional(pool)
        .await?;

        // chunk replaced by a concurrent re-ingest
        let Some(row) = row else { continue };

        *taken += 1;
        out.push(RetrievedChunk {
            chunk_id: sc.chunk_id.clone(),
            document_id: sc.document_id.clone(),
            chunk_index: row.get("chunk_index"),
            title: row.get("title"),
            source_id: row.get("source_id"),
            text: row.get("text"),
            score: sc.score,
        });
    }

    Ok(out)
}

/// Document-level results: each document scores as its best chunk.
/// Sorted by score desc, updated_at desc, id asc.
pub async fn search_documents(
    pool: &SqlitePool,
    index: &VectorIndex,
    config: &Config,
    query: &str,
    mode: SearchMode,
    limit: i64,
) -> Result<Vec<SearchResultItem>> {
    if query.trim().is_empty() || limit < 1 {
        return Ok(Vec::new());
    }

    let ranked = rank_chunks(pool, index, config, query, mode, 0).await?;

    // ranked is best-first, so the first chunk seen per document wins
    let mut best: Vec<&ScoredChunk> = Vec::new();
    let mut seen = HashSet::new();
    for sc in &ranked {
        if seen.insert(sc.document_id.as_str()) {
            best.push(sc);
        }
    }

    let mut results = Vec::with_capacity(best.len());
    for sc in best {
        let row = sqlx::query(
            "SELECT id, title, source, source_id, source_url, updated_at FROM documents WHERE id = ?",
        )
        .bind(&sc.document_id)
        .fetch_optional(pool)
        .await?;
        let Some(row) = row else { continue };

        let snippet = if sc.snippet.is_empty() {
            sqlx::query_scalar::<_, String>(
                "SELECT COALESCE(substr(text, 1, 240), '') FROM chunks WHERE id = ?",
            )
            .bind(&sc.chunk_id)
            .fetch_optional(pool)
            .await?
            .unwrap_or_default()
        } else {
            sc.snippet.clone()
        };

        let updated_ts: i64 = row.get("updated_at");
        results.push(SearchResultItem {
            id: row.get("id"),
            title: row.get("title"),
            source: row.get("source"),
            source_id: row.get("source_id"),
            source_url: row.get("source_url"),
            updated_at: format_ts_iso(updated_ts),
            score: sc.score,
            snippet,
            updated_ts,
        });
    }

    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then(b.updated_ts.cmp(&a.updated_ts))
            .then(a.id.cmp(&b.id))
    });
    results.truncate(limit as usize);

    Ok(results)
}

pub async fn run_search(
    config: &Config,
    query: &str,
    mode: Option<SearchMode>,
    limit: Option<i64>,
) -> Result<()> {
    if query.trim().is_empty() {
        println!("No results.");
        return Ok(());
    }

    let mode = mode.unwrap_or_else(|| config.retrieval.effective_mode(&config.embedding));
    let pool = db::connect(config).await?;
    let index = VectorIndex::for_config(&pool, &config.embedding).await?;
    let limit = limit.unwrap_or(config.retrieval.final_limit);

    let results = search_documents(&pool, &index, config, query, mode, limit).await?;

    if results.is_empty() {
        println!("No results.");
        pool.close().await;
        return Ok(());
    }

    for (i, result) in results.iter().enumerate() {
        let title_display = result.title.as_deref().unwrap_or("(untitled)");
        println!(
            "{}. [{:.2}] {} / {}",
            i + 1,
            result.score,
            result.source,
            title_display
        );
        println!("    updated: {}", &result.updated_at[..10.min(result.updated_at.len())]);
        println!("    source: {}", result.source_id);
        if let Some(ref url) = result.source_url {
            println!("    url: {}", url);
        }
        println!(
            "    excerpt: \"{}\"",
            result.snippet.replace('\n', " ").trim()
        );
        println!("    id: {}", result.id);
        println!();
    }

    pool.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;
    use crate::migrate;

    fn make_candidate(chunk_id: &str, doc_id: &str, score: f64) -> ChunkCandidate {
        ChunkCandidate {
            chunk_id: chunk_id.to_string(),
            document_id: doc_id.to_string(),
            raw_score: score,
            snippet: String::new(),
        }
    }

    #[test]
    fn fts_query_quotes_terms() {
        assert_eq!(
            fts_query("What's the plan? (v2)").unwrap(),
            "\"what\" OR \"s\" OR \"the\" OR \"plan\" OR \"v2\""
        );
    }

    #[test]
    fn fts_query_dedups_and_handles_empty() {
        assert_eq!(fts_query("Rust rust RUST").unwrap(), "\"rust\"");
        assert!(fts_query("?! -- ...").is_none());
        assert!(fts_query("").is_none());
    }

    #[test]
    fn test_normalize_empty() {
        assert!(normalize_scores(&[]).is_empty());
    }

    #[test]
    fn test_normalize_range() {
        let candidates = vec![
            make_candidate("c1", "d1", 10.0),
            make_candidate("c2", "d2", 5.0),
            make_candidate("c3", "d3", 0.0),
        ];
        let result = normalize_scores(&candidates);
        assert!((result[0].1 - 1.0).abs() < 1e-9);
        assert!((result[1].1 - 0.5).abs() < 1e-9);
        assert!((result[2].1 - 0.0).abs() < 1e-9);
    }

    #[test]
    fn test_normalize_all_equal() {
        let candidates = vec![
            make_candidate("c1", "d1", 3.0),
            make_candidate("c2", "d2", 3.0),
        ];
        for (_, score) in normalize_scores(&candidates) {
            assert!((score - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn merge_alpha_zero_is_keyword_order() {
        let kw = vec![
            make_candidate("c1", "d1", 10.0),
            make_candidate("c2", "d2", 5.0),
            make_candidate("c3", "d3", 1.0),
        ];
        let vec_cands = vec![
            make_candidate("c1", "d1", 0.1),
            make_candidate("c3", "d3", 0.9),
        ];
        let merged = merge_hybrid(&kw, &vec_cands, 0.0);
        let ids: Vec<&str> = merged.iter().map(|s| s.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["c1", "c2", "c3"]);
    }

    #[test]
    fn merge_alpha_one_is_vector_order() {
        let kw = vec![make_candidate("c1", "d1", 10.0)];
        let vec_cands = vec![
            make_candidate("c1", "d1", 0.1),
            make_candidate("c2", "d2", 0.9),
            make_candidate("c3", "d3", 0.5),
        ];
        let merged = merge_hybrid(&kw, &vec_cands, 1.0);
        let ids: Vec<&str> = merged.iter().map(|s| s.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["c2", "c3", "c1"]);
    }

    #[test]
    fn merge_blends_both_channels() {
        let kw = vec![
            make_candidate("a", "d1", 2.0),
            make_candidate("b", "d1", 1.0),
        ];
        let vec_cands = vec![
            make_candidate("b", "d1", 0.9),
            make_candidate("a", "d1", 0.1),
        ];
        // a: 0.4*1 + 0.6*0 = 0.4; b: 0.4*0 + 0.6*1 = 0.6
        let merged = merge_hybrid(&kw, &vec_cands, 0.6);
        assert_eq!(merged[0].chunk_id, "b");
        assert!((merged[0].score - 0.6).abs() < 1e-9);
        assert!((merged[1].score - 0.4).abs() < 1e-9);
    }

    #[test]
    fn merge_ties_sorted_by_chunk_id() {
        let kw = vec![
            make_candidate("z", "d1", 1.0),
            make_candidate("m", "d2", 1.0),
        ];
        let merged = merge_hybrid(&kw, &[], 0.0);
        assert_eq!(merged[0].chunk_id, "m");
        assert_eq!(merged[1].chunk_id, "z");
    }

    async fn seeded_pool(dir: &std::path::Path) -> (Config, SqlitePool) {
        let cfg = parse_config(&format!(
            "[db]\npath = \"{}\"\n[retrieval]\nmax_chunks_per_doc = 1\n",
            dir.join("db.sqlite").display()
        ))
        .unwrap();
        let pool = db::connect(&cfg).await.unwrap();
        migrate::apply(&pool).await.unwrap();

        let docs = [
            ("d1", "Rust book", 100, vec!["rust ownership and borrowing", "rust lifetimes"]),
            ("d2", "Cookbook", 200, vec!["pasta with tomato sauce"]),
        ];
        for (id, title, ts, chunks) in docs {
            sqlx::query(
                "INSERT INTO documents (id, source, source_id, title, created_at, updated_at, body, dedup_hash)
                 VALUES (?, 'upload', ?, ?, ?, ?, '', '')",
            )
            .bind(id)
            .bind(format!("{}.txt", id))
            .bind(title)
            .bind(ts)
            .bind(ts)
            .execute(&pool)
            .await
            .unwrap();
            for (i, text) in chunks.iter().enumerate() {
                let chunk_id = format!("{}-{}", id, i);
                sqlx::query(
                    "INSERT INTO chunks (id, document_id, chunk_index, text, hash) VALUES (?, ?, ?, ?, '')",
                )
                .bind(&chunk_id)
                .bind(id)
                .bind(i as i64)
                .bind(*text)
                .execute(&pool)
                .await
                .unwrap();
                sqlx::query("INSERT INTO chunks_fts (chunk_id, document_id, text) VALUES (?, ?, ?)")
                    .bind(&chunk_id)
                    .bind(id)
                    .bind(*text)
                    .execute(&pool)
                    .await
                    .unwrap();
            }
        }
        (cfg, pool)
    }

    #[tokio::test]
    async fn keyword_retrieval_caps_chunks_per_document() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (cfg, pool) = seeded_pool(tmp.path()).await;
        let index = VectorIndex::new("disabled", 0);

        let passages = retrieve_chunks(&pool, &index, &cfg, "rust?", SearchMode::Keyword, 5)
            .await
            .unwrap();
        assert_eq!(passages.len(), 1);
        assert_eq!(passages[0].document_id, "d1");
        assert_eq!(passages[0].title.as_deref(), Some("Rust book"));
    }

    #[tokio::test]
    async fn keyword_document_search() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (cfg, pool) = seeded_pool(tmp.path()).await;
        let index = VectorIndex::new("disabled", 0);

        let results = search_documents(&pool, &index, &cfg, "tomato pasta", SearchMode::Keyword, 10)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "d2");
        assert!(results[0].snippet.contains(">>>"));
    }

    #[tokio::test]
    async fn semantic_without_embeddings_is_an_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (cfg, pool) = seeded_pool(tmp.path()).await;
        let index = VectorIndex::new("disabled", 0);

        let err = search_documents(&pool, &index, &cfg, "rust", SearchMode::Semantic, 10)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("embeddings"));
    }
}
