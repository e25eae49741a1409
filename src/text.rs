//! Text utilities: normalization, content hashing and code-point chunking.

use std::path::Path;

use sha2::{Digest, Sha256};

use crate::core::errors::RagError;

/// Reads a UTF-8 document from disk.
pub fn read_text_file(path: &Path) -> Result<String, RagError> {
    std::fs::read_to_string(path)
        .map_err(|e| RagError::Backend(format!("failed to read {}: {}", path.display(), e)))
}

/// Collapses whitespace runs to a single space and trims both ends.
pub fn clean_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Hex-encoded SHA-256 digest used as the content identity of a document.
pub fn calculate_hash(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

/// Splits `text` into windows of `size` code points.
///
/// Consecutive windows start `max(1, size - overlap)` code points apart and
/// the final window is truncated at the end of the text. Input no longer
/// than `size` comes back as a single chunk.
pub fn split_text(text: &str, size: usize, overlap: usize) -> Result<Vec<String>, RagError> {
    if size == 0 {
        return Err(RagError::invalid("chunk size must be at least 1"));
    }

    let chars: Vec<char> = text.chars().collect();
    let total = chars.len();
    if total <= size {
        return Ok(vec![text.to_string()]);
    }

    let step = size.saturating_sub(overlap).max(1);
    let mut chunks = Vec::with_capacity(total / step + 1);
    let mut start = 0;

    loop {
        let end = (start + size).min(total);
        chunks.push(chars[start..end].iter().collect());
        if end == total {
            break;
        }
        start += step;
    }

    Ok(chunks)
}
