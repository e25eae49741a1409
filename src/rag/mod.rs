//! RAG (Retrieval-Augmented Generation) module.
//!
//! This module provides:
//! - `RagStore`: storage contract implemented by `JsonRagStore` and `PgRagStore`
//! - `RagPipeline`: ingest, retrieve and answer on top of a store and an LLM provider
//! - `build_prompt`: turns retrieved chunks into a chat prompt

pub mod context_builder;
pub mod engine;
pub mod json;
pub mod postgres;
pub mod store;
pub mod types;

use std::sync::Arc;

pub use context_builder::{build_context, build_prompt};
pub use engine::{Answer, RagPipeline};
pub use json::JsonRagStore;
pub use postgres::PgRagStore;
pub use store::{embed_fn, EmbedFn, RagStore};
pub use types::{IngestOutcome, Metadata, NewDocument, Record, SearchOptions, SearchResult};

use crate::core::config::{AppConfig, AppPaths, StoreBackend};
use crate::core::errors::RagError;

/// Opens the store backend selected by `config.store.backend`.
pub async fn open_store(
    config: &AppConfig,
    paths: &AppPaths,
) -> Result<Arc<dyn RagStore>, RagError> {
    match config.store.backend {
        StoreBackend::Json => {
            let path = paths.resolve(&config.store.path);
            tracing::info!("Using JSON store at {}", path.display());
            Ok(Arc::new(JsonRagStore::open(path).await?))
        }
        StoreBackend::Postgres => {
            tracing::info!(
                "Using PostgreSQL store {}:{}/{} (table {})",
                config.postgres.host,
                config.postgres.port,
                config.postgres.dbname,
                config.postgres.table
            );
            let store = PgRagStore::connect(&config.postgres.connection_url(), &config.postgres.table)
                .await?
                .with_oversample(config.retrieval.recency_oversample);
            Ok(Arc::new(store))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn json_backend_resolves_under_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let paths = AppPaths::from_dir(dir.path());
        let store = open_store(&AppConfig::default(), &paths).await.unwrap();
        assert_eq!(store.count(&CancellationToken::new()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn postgres_backend_rejects_unsafe_table_name() {
        let dir = tempfile::tempdir().unwrap();
        let paths = AppPaths::from_dir(dir.path());
        let mut config = AppConfig::default();
        config.store.backend = StoreBackend::Postgres;
        config.postgres.table = "docs; drop table docs".to_string();

        let err = open_store(&config, &paths).await.err().unwrap();
        assert!(matches!(err, RagError::InvalidInput(_)));
    }
}
