//! Prompt assembly for grounded answers.
//!
//! Retrieved passages are numbered in rank order and placed ahead of the
//! question:
//!
//! ```text
//! Context:
//! [1] <title>
//! <passage>
//!
//! [2] <title>
//! <passage>
//!
//! Question: <question>
//!
//! Answer:
//! ```

use crate::chunk::CHARS_PER_TOKEN;
use crate::search::RetrievedChunk;

const NO_CONTEXT: &str = "(no relevant passages found)";

/// Build the completion prompt. Passages are added until
/// `max_context_tokens` worth of characters is used; the passage that
/// crosses the budget is truncated.
pub fn build_prompt(question: &str, passages: &[RetrievedChunk], max_context_tokens: usize) -> String {
    let budget = max_context_tokens * CHARS_PER_TOKEN;
    let mut context = String::new();
    let mut used = 0usize;

    for (i, passage) in passages.iter().enumerate() {
        if used >= budget {
            break;
        }
        let title = passage.title.as_deref().unwrap_or(&passage.source_id);
        let remaining = budget - used;
        let text = truncate_on_char_boundary(passage.text.trim(), remaining);
        if text.is_empty() {
            break;
        }
        used += text.len();

        if !context.is_empty() {
            context.push_str("\n\n");
        }
        context.push_str(&format!("[{}] {}\n{}", i + 1, title, text));
    }

    if context.is_empty() {
        context.push_str(NO_CONTEXT);
    }

    format!(
        "Context:\n{}\n\nQuestion: {}\n\nAnswer:",
        context,
        question.trim()
    )
}

/// Answer used when no language model is configured: the passages
/// themselves, best first.
pub fn retrieval_only_answer(passages: &[RetrievedChunk]) -> String {
    passages
        .iter()
        .map(|p| p.text.trim())
        .collect::<Vec<_>>()
        .join("\n")
}

fn truncate_on_char_boundary(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
