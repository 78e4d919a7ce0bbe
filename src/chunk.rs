//! Paragraph-boundary text chunker with overlap.
//!
//! Splits extracted document text into [`Chunk`]s that respect a
//! `max_tokens` limit. Splitting happens on paragraph boundaries (`\n\n`)
//! so each chunk stays coherent; paragraphs longer than the limit are
//! hard-split on line or word boundaries.
//!
//! With `overlap_tokens > 0`, every chunk after the first starts with the
//! word-aligned tail of the previous chunk, so a sentence cut at a chunk
//! boundary is still retrievable from either side.
//!
//! Each chunk carries a SHA-256 hash of its text for embedding staleness
//! detection.

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::Chunk;

/// Approximate chars-per-token ratio.
pub const CHARS_PER_TOKEN: usize = 4;

/// Split text into chunks on paragraph boundaries, respecting `max_tokens`.
/// Returns chunks with contiguous indices starting at 0.
pub fn chunk_text(
    document_id: &str,
    text: &str,
    max_tokens: usize,
    overlap_tokens: usize,
) -> Vec<Chunk> {
    let max_chars = max_tokens.max(1) * CHARS_PER_TOKEN;
    let overlap_chars = overlap_tokens * CHARS_PER_TOKEN;

    let pieces = pack_paragraphs(text, max_chars);
    if pieces.is_empty() {
        return vec![make_chunk(document_id, 0, text.trim())];
    }

    let mut chunks = Vec::with_capacity(pieces.len());
    for (i, piece) in pieces.iter().enumerate() {
        let tail = if i > 0 {
            overlap_tail(&pieces[i - 1], overlap_chars)
        } else {
            ""
        };
        let body = if tail.is_empty() {
            piece.clone()
        } else {
            format!("{}\n{}", tail, piece)
        };
        chunks.push(make_chunk(document_id, i as i64, &body));
    }

    chunks
}

/// Greedily pack paragraphs into pieces of at most `max_chars` bytes.
fn pack_paragraphs(text: &str, max_chars: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current = String::new();

    for para in text.split("\n\n") {
        let trimmed = para.trim();
        if trimmed.is_empty() {
            continue;
        }

        let would_be = if current.is_empty() {
            trimmed.len()
        } else {
            current.len() + 2 + trimmed.len()
        };

        if would_be > max_chars && !current.is_empty() {
            pieces.push(std::mem::take(&mut current));
        }

        if trimmed.len() > max_chars {
            hard_split(trimmed, max_chars, &mut pieces);
        } else {
            if !current.is_empty() {
                current.push_str("\n\n");
            }
            current.push_str(trimmed);
        }
    }

    if !current.is_empty() {
        pieces.push(current);
    }

    pieces
}

/// Split an oversized paragraph at newline or space boundaries.
fn hard_split(paragraph: &str, max_chars: usize, pieces: &mut Vec<String>) {
    let mut remaining = paragraph;
    while !remaining.is_empty() {
        let mut split_at = floor_char_boundary(remaining, max_chars);
        if split_at == 0 {
            split_at = remaining
                .char_indices()
                .nth(1)
                .map(|(i, _)| i)
                .unwrap_or(remaining.len());
        }

        let actual_split = if split_at < remaining.len() {
            remaining[..split_at]
                .rfind('\n')
                .or_else(|| remaining[..split_at].rfind(' '))
                .map(|pos| pos + 1)
                .unwrap_or(split_at)
        } else {
            split_at
        };

        let piece = remaining[..actual_split].trim();
        if !piece.is_empty() {
            pieces.push(piece.to_string());
        }
        remaining = &remaining[actual_split..];
    }
}

/// The last `max_chars` bytes of `text`, starting at a word boundary.
fn overlap_tail(text: &str, max_chars: usize) -> &str {
    if max_chars == 0 || text.is_empty() {
        return "";
    }
    if text.len() <= max_chars {
        return text;
    }

    let mut start = text.len() - max_chars;
    while !text.is_char_boundary(start) {
        start += 1;
    }

    let tail = &text[start..];
    let aligned = if text[..start].ends_with(char::is_whitespace) {
        tail
    } else {
        match tail.find(char::is_whitespace) {
            Some(pos) => &tail[pos..],
            None => tail,
        }
    };
    aligned.trim_start()
}

fn floor_char_boundary(s: &str, idx: usize) -> usize {
    let mut i = idx.min(s.len());
    while !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// SHA-256 hex digest of a chunk's text.
pub fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn make_chunk(document_id: &str, index: i64, text: &str) -> Chunk {
    Chunk {
        id: Uuid::new_v4().to_string(),
        document_id: document_id.to_string(),
        chunk_index: index,
        text: text.to_string(),
        hash: hash_text(text),
    }
}
