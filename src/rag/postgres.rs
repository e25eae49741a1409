//! PostgreSQL + pgvector RAG store implementation.
//!
//! Records live in a single table with a `vector` column. Nearest-neighbour
//! ordering uses the cosine distance operator `<=>`, so `score = 1 - distance`.

use async_trait::async_trait;
use pgvector::Vector;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Postgres, Row};
use tokio_util::sync::CancellationToken;

use super::store::{validate_embeddings, EmbedFn, RagStore};
use super::types::{IngestOutcome, Metadata, NewDocument, SearchOptions, SearchResult};
use crate::core::cancel::{ensure_active, run_cancellable};
use crate::core::config::defaults;
use crate::core::errors::RagError;
use crate::text::{calculate_hash, clean_text, split_text};
use crate::vector_math::{blend_recency, select_top_k, RecencyCandidate};

pub struct PgRagStore {
    pool: PgPool,
    table: String,
    oversample: usize,
}

/// A row fetched by a nearest-neighbour query.
struct Neighbour {
    content: String,
    score: f32,
    created_at: i64,
    embedding: Option<Vec<f32>>,
}

impl PgRagStore {
    pub async fn connect(url: &str, table: &str) -> Result<Self, RagError> {
        validate_identifier(table)?;
        let pool = PgPoolOptions::new()
            .min_connections(1)
            .max_connections(4)
            .connect(url)
            .await?;
        Self::with_pool(pool, table).await
    }

    /// Wraps an existing pool and makes sure the extension and table exist.
    pub async fn with_pool(pool: PgPool, table: &str) -> Result<Self, RagError> {
        validate_identifier(table)?;
        let store = Self {
            pool,
            table: table.to_string(),
            oversample: defaults::RECENCY_OVERSAMPLE,
        };
        store.init_schema().await?;
        Ok(store)
    }

    /// Sets how many rows per requested result are fetched before in-memory
    /// re-ranking (MMR and recency).
    pub fn with_oversample(mut self, factor: usize) -> Self {
        self.oversample = factor.max(1);
        self
    }

    async fn init_schema(&self) -> Result<(), RagError> {
        sqlx::query("CREATE EXTENSION IF NOT EXISTS vector")
            .execute(&self.pool)
            .await?;

        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id SERIAL PRIMARY KEY,
                doc_id TEXT NOT NULL,
                hash TEXT NOT NULL,
                content TEXT NOT NULL,
                embedding vector NOT NULL,
                metadata JSONB NOT NULL DEFAULT '{{}}',
                created_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP
            )",
            self.table
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_{0}_doc_id ON {0}(doc_id)",
            self.table
        ))
        .execute(&self.pool)
        .await?;

        tracing::debug!("PostgreSQL store ready (table {})", self.table);
        Ok(())
    }

    /// Embedding length already in use, ignoring rows of `exclude_doc`.
    async fn stored_dimension(
        &self,
        exclude_doc: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Option<usize>, RagError> {
        let sql = dimension_sql(&self.table, exclude_doc.is_some());
        let mut q = sqlx::query_scalar::<Postgres, i32>(&sql);
        if let Some(doc_id) = exclude_doc {
            q = q.bind(doc_id);
        }
        let dim = run_cancellable(cancel, q.fetch_optional(&self.pool)).await?;
        Ok(dim.map(|d| d.max(0) as usize))
    }

    /// Nearest rows to `query` among the filter matches, best first.
    async fn nearest(
        &self,
        query: &[f32],
        metadata: &Metadata,
        limit: usize,
        with_embedding: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<Neighbour>, RagError> {
        let (filter, values) = build_where(metadata, 2)?;
        let limit_param = values.len() + 2;
        let embedding_column = if with_embedding {
            ", embedding"
        } else {
            ""
        };
        let sql = format!(
            "SELECT content,
                    (1 - (embedding <=> $1))::float8 AS score,
                    EXTRACT(EPOCH FROM created_at)::bigint AS created_epoch{}
             FROM {}{}
             ORDER BY embedding <=> $1
             LIMIT ${}",
            embedding_column, self.table, filter, limit_param
        );

        let mut q = sqlx::query(&sql).bind(Vector::from(query.to_vec()));
        for value in values {
            q = q.bind(value);
        }
        let q = q.bind(sql_limit(limit));

        let rows = run_cancellable(cancel, q.fetch_all(&self.pool)).await?;
        rows.iter().map(|row| row_to_neighbour(row, with_embedding)).collect()
    }

    /// Rows matching `metadata` in insertion order, scored 0.
    ///
    /// Used when the query length differs from the stored one, where the
    /// distance operator would reject the comparison.
    async fn unscored(
        &self,
        metadata: &Metadata,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<Neighbour>, RagError> {
        let (filter, values) = build_where(metadata, 1)?;
        let sql = format!(
            "SELECT content, EXTRACT(EPOCH FROM created_at)::bigint AS created_epoch
             FROM {}{} ORDER BY id LIMIT ${}",
            self.table,
            filter,
            values.len() + 1
        );
        let mut q = sqlx::query(&sql);
        for value in values {
            q = q.bind(value);
        }
        let rows = run_cancellable(cancel, q.bind(sql_limit(limit)).fetch_all(&self.pool)).await?;
        rows.iter()
            .map(|row| -> Result<Neighbour, RagError> {
                Ok(Neighbour {
                    content: row.try_get("content")?,
                    score: 0.0,
                    created_at: row.try_get("created_epoch")?,
                    embedding: None,
                })
            })
            .collect()
    }

    /// Fetches the candidate pool for a query, honouring `threshold`.
    async fn pool(
        &self,
        query: &[f32],
        options: &SearchOptions,
        limit: usize,
        with_embedding: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<Neighbour>, RagError> {
        let rows = match self.stored_dimension(None, cancel).await? {
            None => return Ok(Vec::new()),
            Some(dim) if dim != query.len() => {
                tracing::debug!(
                    "Query dimension {} differs from stored dimension {}",
                    query.len(),
                    dim
                );
                self.unscored(&options.metadata, limit, cancel).await?
            }
            Some(_) => {
                self.nearest(query, &options.metadata, limit, with_embedding, cancel)
                    .await?
            }
        };
        Ok(rows
            .into_iter()
            .filter(|row| row.score >= options.threshold)
            .collect())
    }
}

fn row_to_neighbour(row: &PgRow, with_embedding: bool) -> Result<Neighbour, RagError> {
    let score: f64 = row.try_get("score")?;
    let embedding = if with_embedding {
        let vector: Vector = row.try_get("embedding")?;
        Some(vector.to_vec())
    } else {
        None
    };
    Ok(Neighbour {
        content: row.try_get("content")?,
        score: score as f32,
        created_at: row.try_get("created_epoch")?,
        embedding,
    })
}

/// Accepts `[A-Za-z_][A-Za-z0-9_]*`, the only names spliced into SQL text.
pub(crate) fn validate_identifier(name: &str) -> Result<(), RagError> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(RagError::InvalidInput(format!("invalid identifier: {:?}", name)))
    }
}

/// Compiles a metadata filter into ` WHERE metadata->>'k' = $n AND ...`.
///
/// Placeholders start at `$first_param`; the returned values are bound in
/// the same order. Keys are emitted sorted.
pub(crate) fn build_where(
    metadata: &Metadata,
    first_param: usize,
) -> Result<(String, Vec<String>), RagError> {
    if metadata.is_empty() {
        return Ok((String::new(), Vec::new()));
    }

    let mut clauses = Vec::with_capacity(metadata.len());
    let mut values = Vec::with_capacity(metadata.len());
    for (offset, (key, value)) in metadata.iter().enumerate() {
        validate_identifier(key)?;
        clauses.push(format!("metadata->>'{}' = ${}", key, first_param + offset));
        values.push(value.clone());
    }
    Ok((format!(" WHERE {}", clauses.join(" AND ")), values))
}

fn dimension_sql(table: &str, exclude_doc: bool) -> String {
    if exclude_doc {
        format!(
            "SELECT vector_dims(embedding) FROM {} WHERE doc_id <> $1 LIMIT 1",
            table
        )
    } else {
        format!("SELECT vector_dims(embedding) FROM {} LIMIT 1", table)
    }
}

/// `LIMIT` operand; saturates instead of wrapping for huge `top_k`.
fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

#[async_trait]
impl RagStore for PgRagStore {
    async fn add_document(
        &self,
        doc: NewDocument,
        embed_fn: &dyn EmbedFn,
        cancel: &CancellationToken,
    ) -> Result<IngestOutcome, RagError> {
        ensure_active(cancel)?;

        let clean = clean_text(&doc.text);
        let hash = calculate_hash(&clean);

        let exists_sql = format!(
            "SELECT EXISTS(SELECT 1 FROM {} WHERE doc_id = $1 AND hash = $2)",
            self.table
        );
        let exists: bool = run_cancellable(
            cancel,
            sqlx::query_scalar(&exists_sql)
                .bind(&doc.doc_id)
                .bind(&hash)
                .fetch_one(&self.pool),
        )
        .await?;
        if exists {
            tracing::debug!("Document {} unchanged, skipping ingest", doc.doc_id);
            return Ok(IngestOutcome::Unchanged);
        }

        let stored_dim = self.stored_dimension(Some(&doc.doc_id), cancel).await?;
        let chunks = split_text(&clean, doc.chunk_size, doc.overlap)?;
        let embeddings = run_cancellable(cancel, embed_fn(chunks.clone(), cancel.clone())).await?;
        // The callback may observe the token and return early in the same poll.
        ensure_active(cancel)?;
        validate_embeddings(&chunks, &embeddings, stored_dim)?;

        let delete_sql = format!("DELETE FROM {} WHERE doc_id = $1", self.table);
        let insert_sql = format!(
            "INSERT INTO {} (doc_id, hash, content, embedding, metadata)
             VALUES ($1, $2, $3, $4, $5)",
            self.table
        );

        // An uncommitted transaction rolls back when dropped.
        let (tx, replaced) = run_cancellable(cancel, async {
            let mut tx = self.pool.begin().await?;
            let replaced = sqlx::query(&delete_sql)
                .bind(&doc.doc_id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
            for (chunk, embedding) in chunks.iter().zip(&embeddings) {
                sqlx::query(&insert_sql)
                    .bind(&doc.doc_id)
                    .bind(&hash)
                    .bind(chunk)
                    .bind(Vector::from(embedding.clone()))
                    .bind(Json(&doc.metadata))
                    .execute(&mut *tx)
                    .await?;
            }
            Ok::<_, sqlx::Error>((tx, replaced))
        })
        .await?;
        ensure_active(cancel)?;
        tx.commit().await?;

        tracing::info!(
            "Stored document {} as {} chunks (replaced {})",
            doc.doc_id,
            chunks.len(),
            replaced
        );
        Ok(IngestOutcome::Stored {
            chunks: chunks.len(),
        })
    }

    async fn search(
        &self,
        query_embedding: &[f32],
        options: &SearchOptions,
        cancel: &CancellationToken,
    ) -> Result<Vec<SearchResult>, RagError> {
        ensure_active(cancel)?;
        options.validate()?;

        if options.mmr_lambda >= 1.0 {
            let rows = self
                .pool(query_embedding, options, options.top_k, false, cancel)
                .await?;
            return Ok(rows
                .into_iter()
                .map(|row| SearchResult {
                    text: row.content,
                    score: row.score,
                })
                .collect());
        }

        let limit = options.top_k.saturating_mul(self.oversample);
        let rows = self
            .pool(query_embedding, options, limit, true, cancel)
            .await?;
        let embeddings: Vec<Vec<f32>> = rows
            .iter()
            .map(|row| row.embedding.clone().unwrap_or_default())
            .collect();
        let hits = select_top_k(
            query_embedding,
            &embeddings,
            options.top_k,
            options.threshold,
            options.mmr_lambda,
        );

        Ok(hits
            .into_iter()
            .map(|hit| SearchResult {
                text: rows[hit.index].content.clone(),
                score: hit.score,
            })
            .collect())
    }

    async fn recency_search(
        &self,
        query_embedding: &[f32],
        options: &SearchOptions,
        cancel: &CancellationToken,
    ) -> Result<Vec<SearchResult>, RagError> {
        ensure_active(cancel)?;
        options.validate()?;

        let limit = options.top_k.saturating_mul(self.oversample);
        let candidates = self
            .pool(query_embedding, options, limit, false, cancel)
            .await?
            .into_iter()
            .map(|row| RecencyCandidate {
                score: row.score,
                created_at: row.created_at,
                item: row.content,
            })
            .collect();

        Ok(blend_recency(candidates, options.recency_weight, options.top_k)
            .into_iter()
            .map(|cand| SearchResult {
                text: cand.item,
                score: cand.score,
            })
            .collect())
    }

    async fn delete_document(
        &self,
        doc_id: &str,
        cancel: &CancellationToken,
    ) -> Result<usize, RagError> {
        ensure_active(cancel)?;
        let sql = format!("DELETE FROM {} WHERE doc_id = $1", self.table);
        let removed = run_cancellable(cancel, sqlx::query(&sql).bind(doc_id).execute(&self.pool))
            .await?
            .rows_affected() as usize;
        if removed > 0 {
            tracing::info!("Deleted document {} ({} chunks)", doc_id, removed);
        }
        Ok(removed)
    }

    async fn count(&self, cancel: &CancellationToken) -> Result<usize, RagError> {
        ensure_active(cancel)?;
        let sql = format!("SELECT COUNT(*) FROM {}", self.table);
        let count: i64 =
            run_cancellable(cancel, sqlx::query_scalar(&sql).fetch_one(&self.pool)).await?;
        Ok(count.max(0) as usize)
    }
}
