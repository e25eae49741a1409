//! Query-time orchestration.
//!
//! `RagPipeline` ties a [`RagStore`] to an [`LlmProvider`]: documents are
//! chunked and embedded on the way in, questions are embedded, matched and
//! answered on the way out.

use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::context_builder::build_prompt;
use super::store::{embed_fn, EmbedFn, RagStore};
use super::types::{IngestOutcome, Metadata, NewDocument, SearchOptions, SearchResult};
use crate::core::config::{AppConfig, ChunkConfig, RetrievalConfig};
use crate::core::errors::RagError;
use crate::llm::provider::LlmProvider;
use crate::llm::types::ChatRequest;
use crate::text::read_text_file;

/// Retrieved context plus the model's reply.
#[derive(Debug, Clone)]
pub struct Answer {
    pub results: Vec<SearchResult>,
    pub prompt: String,
    pub text: String,
}

pub struct RagPipeline {
    store: Arc<dyn RagStore>,
    provider: Arc<dyn LlmProvider>,
    embed: Box<dyn EmbedFn>,
    chunk: ChunkConfig,
    retrieval: RetrievalConfig,
}

impl RagPipeline {
    pub fn new(store: Arc<dyn RagStore>, provider: Arc<dyn LlmProvider>, config: &AppConfig) -> Self {
        let embed = Box::new(provider_embed_fn(provider.clone()));
        Self {
            store,
            provider,
            embed,
            chunk: config.chunk.clone(),
            retrieval: config.retrieval.clone(),
        }
    }

    pub fn store(&self) -> &dyn RagStore {
        self.store.as_ref()
    }

    /// Search options derived from the retrieval configuration.
    pub fn default_options(&self) -> SearchOptions {
        self.retrieval.search_options()
    }

    pub async fn ingest(
        &self,
        doc_id: &str,
        text: &str,
        metadata: Metadata,
        cancel: &CancellationToken,
    ) -> Result<IngestOutcome, RagError> {
        let doc = NewDocument::new(doc_id, text)
            .with_metadata(metadata)
            .with_chunking(self.chunk.size, self.chunk.overlap);
        self.store.add_document(doc, &*self.embed, cancel).await
    }

    /// Ingests a UTF-8 file, using its path as the document id.
    pub async fn ingest_file(
        &self,
        path: &Path,
        metadata: Metadata,
        cancel: &CancellationToken,
    ) -> Result<IngestOutcome, RagError> {
        let text = read_text_file(path)?;
        self.ingest(&path.to_string_lossy(), &text, metadata, cancel)
            .await
    }

    /// Retrieves context for `question` with the configured options.
    pub async fn retrieve(
        &self,
        question: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<SearchResult>, RagError> {
        self.retrieve_with(question, &self.default_options(), cancel)
            .await
    }

    /// Embeds `question` and runs a recency-weighted search when
    /// `recency_weight > 0`, a plain similarity search otherwise.
    pub async fn retrieve_with(
        &self,
        question: &str,
        options: &SearchOptions,
        cancel: &CancellationToken,
    ) -> Result<Vec<SearchResult>, RagError> {
        let query = self.provider.embed_one(question, cancel).await?;
        let results = if options.recency_weight > 0.0 {
            self.store.recency_search(&query, options, cancel).await?
        } else {
            self.store.search(&query, options, cancel).await?
        };
        tracing::debug!("Retrieved {} chunks for question", results.len());
        Ok(results)
    }

    pub async fn answer(&self, question: &str, cancel: &CancellationToken) -> Result<Answer, RagError> {
        let results = self.retrieve(question, cancel).await?;
        let prompt = build_prompt(&results, question);
        let text = self.provider.chat(ChatRequest::user(prompt.clone()), cancel).await?;
        Ok(Answer {
            results,
            prompt,
            text,
        })
    }
}

/// Embedding callback backed by any provider.
pub fn provider_embed_fn(provider: Arc<dyn LlmProvider>) -> impl EmbedFn {
    embed_fn(move |chunks: Vec<String>, cancel: CancellationToken| {
        let provider = provider.clone();
        async move { provider.embed(&chunks, &cancel).await }
    })
}
