use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::types::{ChatRequest, ProviderModel};
use crate::core::errors::RagError;

#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// return the provider name (e.g. "openai")
    fn name(&self) -> &str;

    /// list available models from the provider
    async fn list_models(&self, cancel: &CancellationToken) -> Result<Vec<ProviderModel>, RagError>;

    /// chat completion (non-streaming)
    async fn chat(&self, request: ChatRequest, cancel: &CancellationToken) -> Result<String, RagError>;

    /// generate embeddings, one per input, in input order
    async fn embed(
        &self,
        inputs: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<Vec<f32>>, RagError>;

    /// embed a single text (query side)
    async fn embed_one(&self, input: &str, cancel: &CancellationToken) -> Result<Vec<f32>, RagError> {
        self.embed(&[input.to_string()], cancel)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| RagError::Remote("embedding service returned no vectors".to_string()))
    }
}
