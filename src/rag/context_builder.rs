//! Prompt construction from retrieved chunks.

use super::types::SearchResult;

/// Separator written after every retrieved chunk in the context block.
pub const CHUNK_SEPARATOR: &str = "\n---\n";

/// Concatenates result texts, each followed by [`CHUNK_SEPARATOR`], in
/// retrieval order.
pub fn build_context(results: &[SearchResult]) -> String {
    let mut context = String::new();
    for result in results {
        context.push_str(&result.text);
        context.push_str(CHUNK_SEPARATOR);
    }
    context
}

/// Builds the chat prompt for `query`.
///
/// Without results the model is asked to answer from its own knowledge.
pub fn build_prompt(results: &[SearchResult], query: &str) -> String {
    if results.is_empty() {
        return format!(
            "No reference material was found. Answer the following question from your own knowledge.\n\n# Question\n{}",
            query
        );
    }

    format!(
        "Answer the question using the reference material below.\n\n# Reference material\n{}\n\n# Question\n{}",
        build_context(results),
        query
    )
}
