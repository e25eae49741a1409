//! Storage interface shared by the RAG backends.
//!
//! Both backends (`JsonRagStore`, `PgRagStore`) implement the same ingest and
//! retrieval semantics. Embeddings are produced by a caller-supplied
//! [`EmbedFn`], so stores never depend on the remote client.

use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::types::{IngestOutcome, NewDocument, SearchOptions, SearchResult};
use crate::core::errors::RagError;

pub type EmbedFuture = Pin<Box<dyn Future<Output = Result<Vec<Vec<f32>>, RagError>> + Send>>;

/// Embedding callback: one vector per input chunk, in input order.
pub trait EmbedFn: Fn(Vec<String>, CancellationToken) -> EmbedFuture + Send + Sync {}

impl<F> EmbedFn for F where F: Fn(Vec<String>, CancellationToken) -> EmbedFuture + Send + Sync {}

/// Wraps an async closure into an [`EmbedFn`].
pub fn embed_fn<F, Fut>(f: F) -> impl EmbedFn
where
    F: Fn(Vec<String>, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Vec<Vec<f32>>, RagError>> + Send + 'static,
{
    move |chunks: Vec<String>, cancel: CancellationToken| -> EmbedFuture {
        Box::pin(f(chunks, cancel))
    }
}

/// Abstract trait for RAG storage backends.
#[async_trait]
pub trait RagStore: Send + Sync {
    /// Normalizes, hashes, chunks and embeds `doc`, replacing any records
    /// previously stored under `doc.doc_id`.
    ///
    /// Re-ingesting identical normalized content is a no-op reported as
    /// [`IngestOutcome::Unchanged`].
    async fn add_document(
        &self,
        doc: NewDocument,
        embed_fn: &dyn EmbedFn,
        cancel: &CancellationToken,
    ) -> Result<IngestOutcome, RagError>;

    /// Similarity search with optional MMR diversification.
    async fn search(
        &self,
        query_embedding: &[f32],
        options: &SearchOptions,
        cancel: &CancellationToken,
    ) -> Result<Vec<SearchResult>, RagError>;

    /// Similarity search blended with record freshness.
    async fn recency_search(
        &self,
        query_embedding: &[f32],
        options: &SearchOptions,
        cancel: &CancellationToken,
    ) -> Result<Vec<SearchResult>, RagError>;

    /// Removes every record of `doc_id`. Unknown ids remove nothing.
    async fn delete_document(
        &self,
        doc_id: &str,
        cancel: &CancellationToken,
    ) -> Result<usize, RagError>;

    /// Total number of stored records.
    async fn count(&self, cancel: &CancellationToken) -> Result<usize, RagError>;
}

/// Checks an embedding batch before it is written.
///
/// `stored_dim` is the dimensionality already used by the store, if any.
pub(crate) fn validate_embeddings(
    chunks: &[String],
    embeddings: &[Vec<f32>],
    stored_dim: Option<usize>,
) -> Result<(), RagError> {
    if embeddings.len() != chunks.len() {
        return Err(RagError::Remote(format!(
            "embedding callback returned {} vectors for {} chunks",
            embeddings.len(),
            chunks.len()
        )));
    }

    let Some(first) = embeddings.first() else {
        return Ok(());
    };
    let dim = first.len();
    if dim == 0 {
        return Err(RagError::invalid("embedding vectors must not be empty"));
    }
    if let Some(bad) = embeddings.iter().position(|e| e.len() != dim) {
        return Err(RagError::InvalidInput(format!(
            "embedding {} has dimension {}, expected {}",
            bad,
            embeddings[bad].len(),
            dim
        )));
    }
    if let Some(stored) = stored_dim {
        if stored != dim {
            return Err(RagError::InvalidInput(format!(
                "embedding dimension {} does not match stored dimension {}",
                dim, stored
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunks(n: usize) -> Vec<String> {
        (0..n).map(|i| i.to_string()).collect()
    }

    #[tokio::test]
    async fn embed_fn_wraps_async_closures() {
        let f = embed_fn(|chunks: Vec<String>, _cancel| async move {
            Ok(chunks.iter().map(|c| vec![c.len() as f32]).collect())
        });
        let out = f(vec!["ab".into(), "c".into()], CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out, vec![vec![2.0], vec![1.0]]);
    }

    #[test]
    fn batch_length_mismatch_is_remote_failure() {
        let err = validate_embeddings(&chunks(2), &[vec![1.0]], None).unwrap_err();
        assert!(matches!(err, RagError::Remote(_)));
    }

    #[test]
    fn ragged_batch_is_rejected() {
        let err = validate_embeddings(&chunks(2), &[vec![1.0, 0.0], vec![1.0]], None).unwrap_err();
        assert!(matches!(err, RagError::InvalidInput(_)));
    }

    #[test]
    fn stored_dimension_must_match() {
        let batch = vec![vec![1.0, 0.0], vec![0.0, 1.0]];
        assert!(validate_embeddings(&chunks(2), &batch, Some(2)).is_ok());
        assert!(matches!(
            validate_embeddings(&chunks(2), &batch, Some(3)),
            Err(RagError::InvalidInput(_))
        ));
    }
}
