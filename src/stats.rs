//! Database statistics and health overview.
//!
//! Provides a quick summary of what's indexed: document counts, chunk counts,
//! embedding coverage, notes and users, and per-source breakdowns. Used by
//! `ragnote stats` and `GET /stats`.

use anyhow::Result;
use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;

#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    pub documents: i64,
    pub chunks: i64,
    pub embedded_chunks: i64,
    pub notes: i64,
    pub users: i64,
    pub sources: Vec<SourceStats>,
}

/// Per-source breakdown of document and chunk counts.
#[derive(Debug, Clone, Serialize)]
pub struct SourceStats {
    pub source: String,
    pub documents: i64,
    pub chunks: i64,
    pub embedded_chunks: i64,
    pub last_updated: Option<i64>,
}

pub async fn collect_stats(pool: &SqlitePool) -> Result<Stats> {
    let documents = count(pool, "SELECT COUNT(*) FROM documents").await?;
    let chunks = count(pool, "SELECT COUNT(*) FROM chunks").await?;
    let embedded_chunks = count(pool, "SELECT COUNT(*) FROM chunk_vectors").await?;
    let notes = count(pool, "SELECT COUNT(*) FROM notes").await?;
    let users = count(pool, "SELECT COUNT(*) FROM users").await?;

    let source_rows = sqlx::query(
        r#"
        SELECT
            d.source,
            COUNT(DISTINCT d.id) AS doc_count,
            COUNT(DISTINCT c.id) AS chunk_count,
            COUNT(DISTINCT cv.chunk_id) AS embedded_count,
            MAX(d.updated_at) AS last_updated
        FROM documents d
        LEFT JOIN chunks c ON c.document_id = d.id
        LEFT JOIN chunk_vectors cv ON cv.chunk_id = c.id
        GROUP BY d.source
        ORDER BY doc_count DESC, d.source ASC
        "#,
    )
    .fetch_all(pool)
    .await?;

    let sources = source_rows
        .iter()
        .map(|row| SourceStats {
            source: row.get("source"),
            documents: row.get("doc_count"),
            chunks: row.get("chunk_count"),
            embedded_chunks: row.get("embedded_count"),
            last_updated: row.get("last_updated"),
        })
        .collect();

    Ok(Stats {
        documents,
        chunks,
        embedded_chunks,
        notes,
        users,
        sources,
    })
}

async fn count(pool: &SqlitePool, sql: &str) -> Result<i64> {
    Ok(sqlx::query_scalar(sql).fetch_one(pool).await?)
}

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let stats = collect_stats(&pool).await?;
    pool.close().await;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("ragnote database stats");
    println!("======================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Documents:   {}", stats.documents);
    println!("  Chunks:      {}", stats.chunks);
    println!(
        "  Embedded:    {} / {} ({}%)",
        stats.embedded_chunks,
        stats.chunks,
        if stats.chunks > 0 {
            (stats.embedded_chunks * 100) / stats.chunks
        } else {
            0
        }
    );
    println!("  Notes:       {}", stats.notes);
    println!("  Users:       {}", stats.users);

    if !stats.sources.is_empty() {
        println!();
        println!("  By source:");
        println!(
            "  {:<12} {:>6} {:>8} {:>10}   {}",
            "SOURCE", "DOCS", "CHUNKS", "EMBEDDED", "LAST UPDATE"
        );
        println!("  {}", "-".repeat(64));

        for s in &stats.sources {
            let updated = match s.last_updated {
                Some(ts) => format_ts_relative(ts),
                None => "never".to_string(),
            };
            println!(
                "  {:<12} {:>6} {:>8} {:>10}   {}",
                s.source, s.documents, s.chunks, s.embedded_chunks, updated
            );
        }
    }

    println!();
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp relative to now (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;

    if delta < 0 || delta >= 86400 * 30 {
        return chrono::DateTime::from_timestamp(ts, 0)
            .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| ts.to_string());
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    }
}
