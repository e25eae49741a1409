//! Data model shared by every store backend.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};

use crate::core::errors::RagError;

/// String-to-string metadata attached to records and used as a query filter.
pub type Metadata = BTreeMap<String, String>;

/// Unit of storage: one chunk of one ingested document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub doc_id: String,
    /// Hex digest of the normalized source text the chunk came from.
    pub hash: String,
    pub text: String,
    pub embedding: Vec<f32>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub metadata: Metadata,
    /// Seconds since the Unix epoch.
    pub created_at: i64,
    /// RFC 3339 rendering of `created_at`, written for human readers only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
}

/// Files written by older tools carry `"metadata": null` for untagged records.
fn null_as_empty<'de, D>(deserializer: D) -> Result<Metadata, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Metadata>::deserialize(deserializer)?.unwrap_or_default())
}

/// A retrieved chunk and its score (higher is better).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub text: String,
    pub score: f32,
}

/// Query-time parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchOptions {
    pub top_k: usize,
    pub threshold: f32,
    /// 1.0 is pure relevance; lower values trade relevance for diversity.
    pub mmr_lambda: f32,
    pub recency_weight: f32,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            top_k: 5,
            threshold: 0.1,
            mmr_lambda: 0.5,
            recency_weight: 0.2,
            metadata: Metadata::new(),
        }
    }
}

impl SearchOptions {
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn validate(&self) -> Result<(), RagError> {
        if self.top_k == 0 {
            return Err(RagError::invalid("top_k must be at least 1"));
        }
        if !(-1.0..=1.0).contains(&self.threshold) {
            return Err(RagError::invalid(format!(
                "threshold must be within [-1, 1], got {}",
                self.threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.mmr_lambda) {
            return Err(RagError::invalid(format!(
                "mmr_lambda must be within [0, 1], got {}",
                self.mmr_lambda
            )));
        }
        if !(0.0..=1.0).contains(&self.recency_weight) {
            return Err(RagError::invalid(format!(
                "recency_weight must be within [0, 1], got {}",
                self.recency_weight
            )));
        }
        Ok(())
    }
}

/// A document to ingest.
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub doc_id: String,
    pub text: String,
    pub metadata: Metadata,
    pub chunk_size: usize,
    pub overlap: usize,
}

impl NewDocument {
    pub fn new(doc_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            doc_id: doc_id.into(),
            text: text.into(),
            metadata: Metadata::new(),
            chunk_size: 500,
            overlap: 50,
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_chunking(mut self, chunk_size: usize, overlap: usize) -> Self {
        self.chunk_size = chunk_size;
        self.overlap = overlap;
        self
    }
}

/// What `add_document` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// The same normalized content was already stored under this id.
    Unchanged,
    /// Prior records were replaced by `chunks` new ones.
    Stored { chunks: usize },
}

/// True when every key of `filter` is present in `metadata` with an equal value.
pub fn matches_metadata(metadata: &Metadata, filter: &Metadata) -> bool {
    filter
        .iter()
        .all(|(key, value)| metadata.get(key) == Some(value))
}
