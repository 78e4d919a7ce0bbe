//! Note CRUD.
//!
//! Every operation is scoped to an owner. `None` is the anonymous owner used
//! when authentication is optional, so anonymous notes are never visible to
//! signed-in users and vice versa.

use serde::Deserialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use thiserror::Error;

use crate::models::{format_ts_iso, Note};

pub const DEFAULT_LIST_LIMIT: i64 = 50;
pub const MAX_LIST_LIMIT: i64 = 500;

#[derive(Debug, Error)]
pub enum NoteError {
    #[error("title must not be empty")]
    EmptyTitle,
    #[error(transparent)]
    Storage(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewNote {
    pub title: String,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NoteUpdate {
    pub title: Option<String>,
    pub content: Option<String>,
}

fn note_from_row(row: &SqliteRow) -> Note {
    Note {
        id: row.get("id"),
        title: row.get("title"),
        content: row.get("content"),
        user_id: row.get("user_id"),
        created_at: format_ts_iso(row.get("created_at")),
        updated_at: format_ts_iso(row.get("updated_at")),
    }
}

fn validate_title(title: &str) -> Result<String, NoteError> {
    let title = title.trim();
    if title.is_empty() {
        return Err(NoteError::EmptyTitle);
    }
    Ok(title.to_string())
}

pub async fn create_note(pool: &SqlitePool, owner: Option<i64>, note: &NewNote) -> Result<Note, NoteError> {
    let title = validate_title(&note.title)?;
    let now = chrono::Utc::now().timestamp();

    let id = sqlx::query(
        "INSERT INTO notes (title, content, user_id, created_at, updated_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&title)
    .bind(&note.content)
    .bind(owner)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?
    .last_insert_rowid();

    Ok(Note {
        id,
        title,
        content: note.content.clone(),
        user_id: owner,
        created_at: format_ts_iso(now),
        updated_at: format_ts_iso(now),
    })
}

pub async fn get_note(pool: &SqlitePool, owner: Option<i64>, id: i64) -> Result<Option<Note>, NoteError> {
    let row = sqlx::query(
        "SELECT id, title, content, user_id, created_at, updated_at FROM notes WHERE id = ? AND user_id IS ?",
    )
    .bind(id)
    .bind(owner)
    .fetch_optional(pool)
    .await?;

    Ok(row.as_ref().map(note_from_row))
}

/// Newest first. `limit` is clamped to `1..=MAX_LIST_LIMIT`.
pub async fn list_notes(
    pool: &SqlitePool,
    owner: Option<i64>,
    limit: Option<i64>,
    offset: Option<i64>,
) -> Result<Vec<Note>, NoteError> {
    let limit = limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
    let offset = offset.unwrap_or(0).max(0);

    let rows = sqlx::query(
        r#"
        SELECT id, title, content, user_id, created_at, updated_at
        FROM notes
        WHERE user_id IS ?
        ORDER BY updated_at DESC, id DESC
        LIMIT ? OFFSET ?
        "#,
    )
    .bind(owner)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;

    Ok(rows.iter().map(note_from_row).collect())
}

/// Apply the fields present in `update`. Returns `None` when the note does
/// not exist for this owner.
pub async fn update_note(
    pool: &SqlitePool,
    owner: Option<i64>,
    id: i64,
    update: &NoteUpdate,
) -> Result<Option<Note>, NoteError> {
    let Some(existing) = get_note(pool, owner, id).await? else {
        return Ok(None);
    };

    let title = match &update.title {
        Some(t) => validate_title(t)?,
        None => existing.title,
    };
    let content = update.content.clone().unwrap_or(existing.content);
    let now = chrono::Utc::now().timestamp();

    sqlx::query("UPDATE notes SET title = ?, content = ?, updated_at = ? WHERE id = ? AND user_id IS ?")
        .bind(&title)
        .bind(&content)
        .bind(now)
        .bind(id)
        .bind(owner)
        .execute(pool)
        .await?;

    Ok(Some(Note {
        id,
        title,
        content,
        user_id: owner,
        created_at: existing.created_at,
        updated_at: format_ts_iso(now),
    }))
}

/// Returns `false` when there was nothing to delete.
pub async fn delete_note(pool: &SqlitePool, owner: Option<i64>, id: i64) -> Result<bool, NoteError> {
    let result = sqlx::query("DELETE FROM notes WHERE id = ? AND user_id IS ?")
        .bind(id)
        .bind(owner)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}
