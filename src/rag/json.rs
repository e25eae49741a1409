//! File-backed RAG store.
//!
//! Keeps every record in process memory and rewrites a single pretty-printed
//! JSON file after each mutation. Scoring is a linear scan through the
//! similarity kernel in `vector_math`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use super::store::{validate_embeddings, EmbedFn, RagStore};
use super::types::{
    matches_metadata, IngestOutcome, NewDocument, Record, SearchOptions, SearchResult,
};
use crate::core::cancel::{ensure_active, run_cancellable};
use crate::core::errors::RagError;
use crate::text::{calculate_hash, clean_text, split_text};
use crate::vector_math::{blend_recency, select_top_k, RecencyCandidate};

pub struct JsonRagStore {
    path: PathBuf,
    records: RwLock<Vec<Record>>,
}

impl JsonRagStore {
    /// Opens the store at `path`, loading existing records when the file exists.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, RagError> {
        let path = path.into();
        let records = load_records(&path).await?;
        tracing::debug!(
            "Opened JSON store at {} with {} records",
            path.display(),
            records.len()
        );
        Ok(Self {
            path,
            records: RwLock::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot of the stored records in insertion order.
    pub async fn records(&self) -> Vec<Record> {
        self.records.read().await.clone()
    }

    /// Writes `records` to a sibling temp file and renames it into place.
    ///
    /// Not raced against cancellation: the blocking rename cannot be recalled,
    /// so callers check the token before committing to a save.
    async fn save(&self, records: &[Record]) -> Result<(), RagError> {
        let data = serde_json::to_vec_pretty(records)?;
        let tmp_path = self.path.with_extension("json.tmp");
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(&tmp_path, &data).await?;
        tokio::fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }

    /// Filters by metadata and returns the matching records.
    fn filtered<'a>(records: &'a [Record], options: &SearchOptions) -> Vec<&'a Record> {
        records
            .iter()
            .filter(|r| matches_metadata(&r.metadata, &options.metadata))
            .collect()
    }
}

async fn load_records(path: &Path) -> Result<Vec<Record>, RagError> {
    let data = match tokio::fs::read(path).await {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    serde_json::from_slice(&data).map_err(|e| {
        RagError::Backend(format!("malformed store file {}: {}", path.display(), e))
    })
}

fn stamp(created_at: i64) -> Option<String> {
    Utc.timestamp_opt(created_at, 0)
        .single()
        .map(|dt| dt.to_rfc3339())
}

#[async_trait]
impl RagStore for JsonRagStore {
    async fn add_document(
        &self,
        doc: NewDocument,
        embed_fn: &dyn EmbedFn,
        cancel: &CancellationToken,
    ) -> Result<IngestOutcome, RagError> {
        ensure_active(cancel)?;

        let clean = clean_text(&doc.text);
        let hash = calculate_hash(&clean);

        let stored_dim = {
            let records = self.records.read().await;
            if records
                .iter()
                .any(|r| r.doc_id == doc.doc_id && r.hash == hash)
            {
                tracing::debug!("Document {} unchanged, skipping ingest", doc.doc_id);
                return Ok(IngestOutcome::Unchanged);
            }
            records
                .iter()
                .find(|r| r.doc_id != doc.doc_id)
                .map(|r| r.embedding.len())
        };

        let chunks = split_text(&clean, doc.chunk_size, doc.overlap)?;
        let embeddings = run_cancellable(cancel, embed_fn(chunks.clone(), cancel.clone())).await?;
        // The callback may observe the token and return early in the same poll.
        ensure_active(cancel)?;
        validate_embeddings(&chunks, &embeddings, stored_dim)?;

        let created_at = Utc::now().timestamp();
        let date = stamp(created_at);
        let chunk_count = chunks.len();

        let mut records = self.records.write().await;
        ensure_active(cancel)?;
        let previous = records.clone();
        records.retain(|r| r.doc_id != doc.doc_id);
        let replaced = previous.len() - records.len();
        records.extend(chunks.into_iter().zip(embeddings).map(|(text, embedding)| Record {
            doc_id: doc.doc_id.clone(),
            hash: hash.clone(),
            text,
            embedding,
            metadata: doc.metadata.clone(),
            created_at,
            date: date.clone(),
        }));

        if let Err(err) = self.save(&records).await {
            tracing::warn!("Failed to persist document {}: {}; rolling back", doc.doc_id, err);
            *records = previous;
            return Err(err);
        }

        tracing::info!(
            "Stored document {} as {} chunks (replaced {})",
            doc.doc_id,
            chunk_count,
            replaced
        );
        Ok(IngestOutcome::Stored {
            chunks: chunk_count,
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

        let records = self.records.read().await;
        let pool = Self::filtered(&records, options);
        if pool.is_empty() {
            return Ok(Vec::new());
        }

        let embeddings: Vec<&[f32]> = pool.iter().map(|r| r.embedding.as_slice()).collect();
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
                text: pool[hit.index].text.clone(),
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

        let records = self.records.read().await;
        let pool = Self::filtered(&records, options);
        if pool.is_empty() {
            return Ok(Vec::new());
        }

        let embeddings: Vec<&[f32]> = pool.iter().map(|r| r.embedding.as_slice()).collect();
        let candidates = select_top_k(
            query_embedding,
            &embeddings,
            pool.len(),
            options.threshold,
            1.0,
        )
        .into_iter()
        .map(|hit| RecencyCandidate {
            item: hit.index,
            score: hit.score,
            created_at: pool[hit.index].created_at,
        })
        .collect();

        Ok(blend_recency(candidates, options.recency_weight, options.top_k)
            .into_iter()
            .map(|cand| SearchResult {
                text: pool[cand.item].text.clone(),
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

        let mut records = self.records.write().await;
        ensure_active(cancel)?;
        let previous = records.clone();
        records.retain(|r| r.doc_id != doc_id);
        let removed = previous.len() - records.len();
        if removed == 0 {
            return Ok(0);
        }

        if let Err(err) = self.save(&records).await {
            tracing::warn!("Failed to persist deletion of {}: {}; rolling back", doc_id, err);
            *records = previous;
            return Err(err);
        }

        tracing::info!("Deleted document {} ({} chunks)", doc_id, removed);
        Ok(removed)
    }

    async fn count(&self, cancel: &CancellationToken) -> Result<usize, RagError> {
        ensure_active(cancel)?;
        Ok(self.records.read().await.len())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::rag::store::embed_fn;
    use crate::rag::types::Metadata;

    /// Maps each chunk to a vector derived from its first character so tests
    /// can steer similarity without a model.
    fn char_embedder() -> impl EmbedFn {
        embed_fn(|chunks: Vec<String>, _cancel| async move {
            Ok(chunks
                .iter()
                .map(|c| match c.chars().next() {
                    Some('a') => vec![1.0, 0.0, 0.0],
                    Some('b') => vec![0.0, 1.0, 0.0],
                    Some('c') => vec![0.0, 0.0, 1.0],
                    _ => vec![1.0, 1.0, 1.0],
                })
                .collect())
        })
    }

    fn counting_embedder(calls: Arc<AtomicUsize>) -> impl EmbedFn {
        embed_fn(move |chunks: Vec<String>, _cancel| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok(chunks.iter().map(|_| vec![1.0, 0.0]).collect()) }
        })
    }

    async fn test_store() -> (tempfile::TempDir, JsonRagStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonRagStore::open(dir.path().join("store.json")).await.unwrap();
        (dir, store)
    }

    fn doc(id: &str, text: &str) -> NewDocument {
        NewDocument::new(id, text).with_chunking(4, 0)
    }

    fn meta(pairs: &[(&str, &str)]) -> Metadata {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn relevance(top_k: usize) -> SearchOptions {
        SearchOptions {
            top_k,
            threshold: -1.0,
            mmr_lambda: 1.0,
            recency_weight: 0.0,
            metadata: Metadata::new(),
        }
    }

    #[tokio::test]
    async fn missing_file_opens_empty() {
        let (_dir, store) = test_store().await;
        assert_eq!(store.count(&CancellationToken::new()).await.unwrap(), 0);
        assert!(!store.path().exists());
    }

    #[tokio::test]
    async fn ingest_persists_and_reloads() {
        let (dir, store) = test_store().await;
        let cancel = CancellationToken::new();

        let outcome = store
            .add_document(doc("d1", "aaaa bbbb"), &char_embedder(), &cancel)
            .await
            .unwrap();
        assert_eq!(outcome, IngestOutcome::Stored { chunks: 3 });

        let reopened = JsonRagStore::open(dir.path().join("store.json")).await.unwrap();
        let records = reopened.records().await;
        let texts: Vec<&str> = records.iter().map(|r| r.text.as_str()).collect();
        assert_eq!(texts, vec!["aaaa", " bbb", "b"]);
        assert!(records.iter().all(|r| r.hash == calculate_hash("aaaa bbbb")));
        assert!(records.iter().all(|r| r.date.is_some()));
    }

    #[tokio::test]
    async fn identical_content_is_a_noop() {
        let (_dir, store) = test_store().await;
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicUsize::new(0));

        store
            .add_document(NewDocument::new("d1", "hello"), &counting_embedder(calls.clone()), &cancel)
            .await
            .unwrap();
        let first = store.records().await;

        let outcome = store
            .add_document(NewDocument::new("d1", "  hello \n"), &counting_embedder(calls.clone()), &cancel)
            .await
            .unwrap();

        assert_eq!(outcome, IngestOutcome::Unchanged);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.records().await, first);
    }

    #[tokio::test]
    async fn new_content_replaces_then_delete_empties() {
        let (_dir, store) = test_store().await;
        let cancel = CancellationToken::new();

        store
            .add_document(doc("d1", "aaaaaaaa"), &char_embedder(), &cancel)
            .await
            .unwrap();
        store
            .add_document(doc("d1", "bbbbcccc"), &char_embedder(), &cancel)
            .await
            .unwrap();

        let texts: Vec<String> = store.records().await.into_iter().map(|r| r.text).collect();
        assert_eq!(texts, vec!["bbbb", "cccc"]);

        assert_eq!(store.delete_document("d1", &cancel).await.unwrap(), 2);
        assert_eq!(store.count(&cancel).await.unwrap(), 0);
        assert_eq!(store.delete_document("unknown", &cancel).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn replacement_leaves_other_documents_alone() {
        let (_dir, store) = test_store().await;
        let cancel = CancellationToken::new();

        store.add_document(doc("d1", "aaaa"), &char_embedder(), &cancel).await.unwrap();
        store.add_document(doc("d2", "cccc"), &char_embedder(), &cancel).await.unwrap();
        store.add_document(doc("d1", "bbbb"), &char_embedder(), &cancel).await.unwrap();

        let records = store.records().await;
        let pairs: Vec<(&str, &str)> = records
            .iter()
            .map(|r| (r.doc_id.as_str(), r.text.as_str()))
            .collect();
        assert_eq!(pairs, vec![("d2", "cccc"), ("d1", "bbbb")]);
    }

    #[tokio::test]
    async fn search_ranks_by_similarity() {
        let (_dir, store) = test_store().await;
        let cancel = CancellationToken::new();
        store
            .add_document(doc("d1", "aaaabbbbcccc"), &char_embedder(), &cancel)
            .await
            .unwrap();

        let results = store
            .search(&[0.1, 1.0, 0.0], &relevance(2), &cancel)
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].text, "bbbb");
        assert_eq!(results[1].text, "aaaa");
        assert!(results[0].score > results[1].score);
    }

    #[tokio::test]
    async fn search_respects_threshold() {
        let (_dir, store) = test_store().await;
        let cancel = CancellationToken::new();
        store
            .add_document(doc("d1", "aaaabbbbcccc"), &char_embedder(), &cancel)
            .await
            .unwrap();

        let options = SearchOptions {
            threshold: 0.5,
            ..relevance(10)
        };
        let results = store.search(&[1.0, 0.0, 0.0], &options, &cancel).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].text, "aaaa");
    }

    #[tokio::test]
    async fn metadata_filter_limits_candidates() {
        let (_dir, store) = test_store().await;
        let cancel = CancellationToken::new();
        store
            .add_document(
                doc("ja", "aaaa").with_metadata(meta(&[("lang", "ja"), ("kind", "faq")])),
                &char_embedder(),
                &cancel,
            )
            .await
            .unwrap();
        store
            .add_document(
                doc("en", "aaab").with_metadata(meta(&[("lang", "en")])),
                &char_embedder(),
                &cancel,
            )
            .await
            .unwrap();

        let query = [1.0, 0.0, 0.0];
        let all = store.search(&query, &relevance(10), &cancel).await.unwrap();
        assert_eq!(all.len(), 2);

        let ja = store
            .search(&query, &relevance(10).with_metadata("lang", "ja"), &cancel)
            .await
            .unwrap();
        assert_eq!(ja.len(), 1);
        assert_eq!(ja[0].text, "aaaa");

        let missing_key = store
            .search(&query, &relevance(10).with_metadata("kind", "faq").with_metadata("lang", "en"), &cancel)
            .await
            .unwrap();
        assert!(missing_key.is_empty());
    }

    #[tokio::test]
    async fn mmr_search_diversifies() {
        let (_dir, store) = test_store().await;
        let cancel = CancellationToken::new();
        let embedder = embed_fn(|chunks: Vec<String>, _cancel| async move {
            Ok(chunks
                .iter()
                .map(|c| match c.as_str() {
                    "xxxx" => vec![0.9, 0.435_889_9, 0.0],
                    "yyyy" => vec![0.88, 0.474_973_7, 0.0],
                    _ => vec![0.2, -0.1, 0.974_679_4],
                })
                .collect())
        });
        store
            .add_document(doc("d1", "xxxxyyyyzzzz"), &embedder, &cancel)
            .await
            .unwrap();

        let options = SearchOptions {
            mmr_lambda: 0.5,
            ..relevance(2)
        };
        let results = store.search(&[1.0, 0.0, 0.0], &options, &cancel).await.unwrap();
        let texts: Vec<&str> = results.iter().map(|r| r.text.as_str()).collect();
        assert_eq!(texts, vec!["xxxx", "zzzz"]);
    }

    #[tokio::test]
    async fn dimension_mismatch_is_rejected() {
        let (_dir, store) = test_store().await;
        let cancel = CancellationToken::new();
        store.add_document(doc("d1", "aaaa"), &char_embedder(), &cancel).await.unwrap();

        let two_dim = embed_fn(|chunks: Vec<String>, _cancel| async move {
            Ok(chunks.iter().map(|_| vec![1.0, 0.0]).collect())
        });
        let err = store
            .add_document(doc("d2", "bbbb"), &two_dim, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::InvalidInput(_)));
        assert_eq!(store.count(&cancel).await.unwrap(), 1);

        // replacing the only document may change dimensionality
        store.add_document(doc("d1", "cccc"), &two_dim, &cancel).await.unwrap();
        assert_eq!(store.records().await[0].embedding.len(), 2);
    }

    #[tokio::test]
    async fn query_dimension_mismatch_scores_zero() {
        let (_dir, store) = test_store().await;
        let cancel = CancellationToken::new();
        store.add_document(doc("d1", "aaaa"), &char_embedder(), &cancel).await.unwrap();

        let results = store.search(&[1.0, 0.0], &relevance(3), &cancel).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].score, 0.0);
    }

    #[tokio::test]
    async fn embed_failure_leaves_store_untouched() {
        let (_dir, store) = test_store().await;
        let cancel = CancellationToken::new();
        store.add_document(doc("d1", "aaaa"), &char_embedder(), &cancel).await.unwrap();

        let failing = embed_fn(|_chunks: Vec<String>, _cancel| async move {
            Err(RagError::Remote("rate limited".to_string()))
        });
        let err = store
            .add_document(doc("d1", "bbbb"), &failing, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::Remote(_)));

        let texts: Vec<String> = store.records().await.into_iter().map(|r| r.text).collect();
        assert_eq!(texts, vec!["aaaa"]);
    }

    #[tokio::test]
    async fn cancelled_token_aborts_operations() {
        let (_dir, store) = test_store().await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = store
            .add_document(doc("d1", "aaaa"), &char_embedder(), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(store
            .search(&[1.0, 0.0, 0.0], &relevance(1), &cancel)
            .await
            .unwrap_err()
            .is_cancelled());
    }

    #[tokio::test]
    async fn cancellation_during_embedding_is_honored() {
        let (_dir, store) = test_store().await;
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();

        let slow = embed_fn(move |_chunks: Vec<String>, token: CancellationToken| {
            let trigger = trigger.clone();
            async move {
                trigger.cancel();
                token.cancelled().await;
                Ok(Vec::new())
            }
        });
        let err = store
            .add_document(doc("d1", "aaaa"), &slow, &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(store.count(&CancellationToken::new()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn cancellation_after_embedding_writes_nothing() {
        let (_dir, store) = test_store().await;
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();

        let cancelling = embed_fn(move |chunks: Vec<String>, _token: CancellationToken| {
            trigger.cancel();
            async move { Ok(chunks.iter().map(|_| vec![1.0, 0.0]).collect()) }
        });
        let err = store
            .add_document(doc("d1", "aaaa"), &cancelling, &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(store.count(&CancellationToken::new()).await.unwrap(), 0);
        assert!(!store.path().exists());
    }

    #[tokio::test]
    async fn null_metadata_in_existing_file_loads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(
            &path,
            r#"[{"doc_id":"sample.txt","hash":"h","text":"aaaa","embedding":[1.0,0.0],"metadata":null,"created_at":1700000000,"date":"2023-11-15T07:13:20+09:00"}]"#,
        )
        .unwrap();

        let store = JsonRagStore::open(&path).await.unwrap();
        let records = store.records().await;
        assert_eq!(records.len(), 1);
        assert!(records[0].metadata.is_empty());

        let hits = store
            .search(&[1.0, 0.0], &relevance(1), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(hits[0].text, "aaaa");
    }

    #[tokio::test]
    async fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = JsonRagStore::open(&path).await.err().unwrap();
        assert!(matches!(err, RagError::Backend(_)));
    }

    #[tokio::test]
    async fn invalid_options_are_rejected() {
        let (_dir, store) = test_store().await;
        let options = SearchOptions {
            top_k: 0,
            ..SearchOptions::default()
        };
        let err = store
            .search(&[1.0], &options, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::InvalidInput(_)));
    }

    fn record(text: &str, embedding: Vec<f32>, created_at: i64) -> Record {
        Record {
            doc_id: format!("doc-{text}"),
            hash: calculate_hash(text),
            text: text.to_string(),
            embedding,
            metadata: Metadata::new(),
            created_at,
            date: None,
        }
    }

    async fn store_with(records: Vec<Record>) -> (tempfile::TempDir, JsonRagStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(&path, serde_json::to_vec(&records).unwrap()).unwrap();
        let store = JsonRagStore::open(&path).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn recency_without_weight_matches_relevance_search() {
        let (_dir, store) = store_with(vec![
            record("old-close", vec![1.0, 0.1], 100),
            record("new-far", vec![0.2, 1.0], 300),
            record("mid", vec![1.0, 0.6], 200),
        ])
        .await;
        let cancel = CancellationToken::new();
        let query = [1.0, 0.0];

        let plain = store.search(&query, &relevance(3), &cancel).await.unwrap();
        let recent = store.recency_search(&query, &relevance(3), &cancel).await.unwrap();
        assert_eq!(plain, recent);
    }

    #[tokio::test]
    async fn full_recency_weight_orders_by_creation_time() {
        let (_dir, store) = store_with(vec![
            record("old-close", vec![1.0, 0.1], 100),
            record("new-far", vec![0.2, 1.0], 300),
            record("mid", vec![1.0, 0.6], 200),
        ])
        .await;
        let options = SearchOptions {
            recency_weight: 1.0,
            ..relevance(3)
        };

        let results = store
            .recency_search(&[1.0, 0.0], &options, &CancellationToken::new())
            .await
            .unwrap();
        let texts: Vec<&str> = results.iter().map(|r| r.text.as_str()).collect();
        assert_eq!(texts, vec!["new-far", "mid", "old-close"]);
    }

    #[tokio::test]
    async fn recency_handles_duplicate_texts_by_position() {
        let (_dir, store) = store_with(vec![
            record("same", vec![1.0, 0.0], 100),
            record("same", vec![0.0, 1.0], 300),
        ])
        .await;
        let options = SearchOptions {
            recency_weight: 0.5,
            ..relevance(2)
        };

        let results = store
            .recency_search(&[1.0, 0.0], &options, &CancellationToken::new())
            .await
            .unwrap();
        // (1.0, t=0) and (0.0, t=1) blend to 0.5 each; the stable sort keeps
        // relevance order, and each entry keeps its own timestamp.
        assert_eq!(results.len(), 2);
        assert!((results[0].score - 0.5).abs() < 1e-6);
        assert!((results[1].score - 0.5).abs() < 1e-6);
    }
}
