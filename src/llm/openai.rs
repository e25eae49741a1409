use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::provider::LlmProvider;
use super::types::{ChatRequest, ProviderModel};
use crate::core::cancel::run_cancellable;
use crate::core::config::{defaults, ApiConfig};
use crate::core::errors::RagError;
use crate::rag::store::{embed_fn, EmbedFn};

/// Client for OpenAI-compatible `/chat/completions`, `/embeddings` and
/// `/models` endpoints.
#[derive(Clone)]
pub struct OpenAiClient {
    base_url: String,
    api_key: String,
    model: String,
    embedding_model: String,
    client: Client,
}

impl OpenAiClient {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self, RagError> {
        let base_url = if base_url.trim().is_empty() {
            defaults::API_BASE_URL
        } else {
            base_url
        };
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(RagError::remote)?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: String::new(),
            embedding_model: defaults::EMBEDDING_MODEL.to_string(),
            client,
        })
    }

    pub fn from_config(config: &ApiConfig) -> Result<Self, RagError> {
        Ok(Self::new(
            &config.base_url,
            &config.api_key,
            Duration::from_secs(config.timeout_secs),
        )?
        .with_model(&config.model)
        .with_embedding_model(&config.embedding_model))
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = model.to_string();
        self
    }

    /// An empty name keeps the default embedding model.
    pub fn with_embedding_model(mut self, model: &str) -> Self {
        if !model.trim().is_empty() {
            self.embedding_model = model.to_string();
        }
        self
    }

    /// Adapts this client into the embedding callback consumed by stores.
    pub fn embed_fn(&self) -> impl EmbedFn {
        let client = self.clone();
        embed_fn(move |chunks: Vec<String>, cancel: CancellationToken| {
            let client = client.clone();
            async move { client.embed(&chunks, &cancel).await }
        })
    }

    async fn post_json(
        &self,
        path: &str,
        body: serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<Response, RagError> {
        let url = format!("{}/{}", self.base_url, path);
        let res = run_cancellable(
            cancel,
            self.client
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(&body)
                .send(),
        )
        .await?;
        check_status(res, path, cancel).await
    }
}

async fn check_status(
    res: Response,
    path: &str,
    cancel: &CancellationToken,
) -> Result<Response, RagError> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    let text = run_cancellable(cancel, res.text()).await.unwrap_or_default();
    Err(RagError::Remote(format!("{} returned {}: {}", path, status, text)))
}

#[derive(Deserialize)]
struct ModelsResponse {
    data: Vec<ModelInfo>,
}

#[derive(Deserialize)]
struct ModelInfo {
    id: String,
    #[serde(default)]
    owned_by: Option<String>,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

#[async_trait]
impl LlmProvider for OpenAiClient {
    fn name(&self) -> &str {
        "openai"
    }

    async fn list_models(&self, cancel: &CancellationToken) -> Result<Vec<ProviderModel>, RagError> {
        let url = format!("{}/models", self.base_url);
        let res = run_cancellable(
            cancel,
            self.client.get(&url).bearer_auth(&self.api_key).send(),
        )
        .await?;
        let res = check_status(res, "models", cancel).await?;
        let response: ModelsResponse = run_cancellable(cancel, res.json()).await?;

        Ok(response
            .data
            .into_iter()
            .map(|m| ProviderModel {
                id: m.id,
                owned_by: m.owned_by,
            })
            .collect())
    }

    async fn chat(&self, request: ChatRequest, cancel: &CancellationToken) -> Result<String, RagError> {
        if self.model.trim().is_empty() {
            return Err(RagError::invalid("chat model is not configured"));
        }

        let mut body = json!({
            "model": self.model,
            "messages": request.messages,
        });
        if let Some(obj) = body.as_object_mut() {
            if let Some(t) = request.temperature {
                obj.insert("temperature".to_string(), json!(t));
            }
            if let Some(t) = request.max_tokens {
                obj.insert("max_tokens".to_string(), json!(t));
            }
        }

        let res = self.post_json("chat/completions", body, cancel).await?;
        let payload: ChatResponse = run_cancellable(cancel, res.json()).await?;

        let choice = payload
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| RagError::Remote("no response choices returned from API".to_string()))?;
        tracing::debug!("Chat completion received from {}", self.model);
        Ok(choice.message.content.unwrap_or_default())
    }

    async fn embed(
        &self,
        inputs: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<Vec<f32>>, RagError> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }

        let body = json!({
            "model": self.embedding_model,
            "input": inputs,
        });
        let res = self.post_json("embeddings", body, cancel).await?;
        let mut payload: EmbeddingResponse = run_cancellable(cancel, res.json()).await?;

        if payload.data.len() != inputs.len() {
            return Err(RagError::Remote(format!(
                "API returned {} embeddings, but {} were requested",
                payload.data.len(),
                inputs.len()
            )));
        }
        payload.data.sort_by_key(|d| d.index);
        tracing::debug!(
            "Embedded {} inputs with {}",
            inputs.len(),
            self.embedding_model
        );
        Ok(payload.data.into_iter().map(|d| d.embedding).collect())
    }
}
