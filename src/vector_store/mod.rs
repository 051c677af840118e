pub mod qdrant;
pub mod sqlite;

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{AppConfig, QueryBackend};
use crate::db::Database;
use crate::error::{bounded, GloveboxError, Result};
use crate::models::{DocumentChunk, DocumentType, IndexState};

pub use qdrant::QdrantBackend;
pub use sqlite::SqliteVectorBackend;

#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: DocumentChunk,
    pub score: f32,
}

#[derive(Debug, Clone, Default)]
pub struct QueryFilter {
    pub document_type: Option<DocumentType>,
    pub min_score: Option<f32>,
}

/// One physical place vectors live. Both implementations score with cosine
/// similarity, so scores are comparable across a fallback.
#[async_trait]
pub trait VectorBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Replaces the document's whole chunk set.
    async fn upsert(&self, document_name: &str, chunks: &[DocumentChunk]) -> Result<()>;

    async fn delete_document(&self, document_name: &str) -> Result<()>;

    async fn query(
        &self,
        vector: &[f32],
        limit: usize,
        filter: &QueryFilter,
    ) -> Result<Vec<ScoredChunk>>;

    async fn count_document(&self, document_name: &str) -> Result<usize>;

    async fn ping(&self) -> Result<()>;

    /// Chunks with embeddings, ordered by chunk index.
    async fn fetch_document(&self, document_name: &str) -> Result<Vec<DocumentChunk>> {
        Err(GloveboxError::vector_store(
            self.name(),
            format!("cannot read back chunks for {document_name}"),
        ))
    }
}

#[derive(Debug, Clone)]
pub enum QueryOutcome {
    Ok(Vec<ScoredChunk>),
    Degraded {
        hits: Vec<ScoredChunk>,
        reason: String,
    },
}

impl QueryOutcome {
    pub fn hits(&self) -> &[ScoredChunk] {
        match self {
            QueryOutcome::Ok(hits) => hits,
            QueryOutcome::Degraded { hits, .. } => hits,
        }
    }

    pub fn into_parts(self) -> (Vec<ScoredChunk>, Option<String>) {
        match self {
            QueryOutcome::Ok(hits) => (hits, None),
            QueryOutcome::Degraded { hits, reason } => (hits, Some(reason)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WriteReport {
    pub chunk_count: usize,
    pub index_state: IndexState,
    pub index_error: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct BackendHealth {
    pub name: &'static str,
    pub ok: bool,
    pub error: Option<String>,
}

/// Relational backend is the source of truth; the dedicated index is an
/// optional accelerator that may lag behind (index state `degraded`).
#[derive(Clone)]
pub struct VectorStore {
    relational: Arc<dyn VectorBackend>,
    index: Option<Arc<dyn VectorBackend>>,
    prefer_index: bool,
    timeout: Duration,
    /// Document index states; lets queries notice an index that lags.
    catalog: Option<Database>,
}

impl VectorStore {
    pub fn new(
        relational: Arc<dyn VectorBackend>,
        index: Option<Arc<dyn VectorBackend>>,
        prefer_index: bool,
        timeout: Duration,
    ) -> Self {
        let prefer_index = prefer_index && index.is_some();
        Self {
            relational,
            index,
            prefer_index,
            timeout,
            catalog: None,
        }
    }

    pub fn with_catalog(mut self, db: Database) -> Self {
        self.catalog = Some(db);
        self
    }

    pub fn from_config(config: &AppConfig, db: &Database) -> Self {
        let relational: Arc<dyn VectorBackend> =
            Arc::new(SqliteVectorBackend::new(db.pool().clone()));
        let index: Option<Arc<dyn VectorBackend>> = if config.retrieval.use_qdrant {
            Some(Arc::new(QdrantBackend::new(
                config.qdrant_base_url.clone(),
                config.qdrant_collection.clone(),
            )))
        } else {
            None
        };

        Self::new(
            relational,
            index,
            config.retrieval.query_backend == QueryBackend::Qdrant,
            config.timeouts.vector_store,
        )
        .with_catalog(db.clone())
    }

    pub fn has_index(&self) -> bool {
        self.index.is_some()
    }

    /// Relational write must succeed; an index failure downgrades the
    /// document to `degraded` instead of failing ingestion.
    pub async fn replace_document(
        &self,
        document_name: &str,
        chunks: &[DocumentChunk],
    ) -> Result<WriteReport> {
        bounded(
            "vector_store",
            self.timeout,
            self.relational.upsert(document_name, chunks),
        )
        .await?;

        let mut report = WriteReport {
            chunk_count: chunks.len(),
            index_state: IndexState::Indexed,
            index_error: None,
        };

        if let Some(index) = &self.index {
            if let Err(err) = bounded(
                "vector_store",
                self.timeout,
                index.upsert(document_name, chunks),
            )
            .await
            {
                tracing::warn!(
                    document = document_name,
                    backend = index.name(),
                    error = %err,
                    "index write failed; document marked degraded"
                );
                report.index_state = IndexState::Degraded;
                report.index_error = Some(err.to_string());
            }
        }

        Ok(report)
    }

    pub async fn delete_document(&self, document_name: &str) -> Result<()> {
        bounded(
            "vector_store",
            self.timeout,
            self.relational.delete_document(document_name),
        )
        .await?;

        if let Some(index) = &self.index {
            if let Err(err) = bounded(
                "vector_store",
                self.timeout,
                index.delete_document(document_name),
            )
            .await
            {
                tracing::warn!(
                    document = document_name,
                    backend = index.name(),
                    error = %err,
                    "index delete failed; stale points may remain until reconcile"
                );
            }
        }

        Ok(())
    }

    /// Queries the preferred backend, falling back to the other on failure.
    /// While any matching document is `degraded` the index is incomplete, so
    /// the relational backend answers and the outcome is marked degraded.
    pub async fn query(&self, vector: &[f32], limit: usize, filter: &QueryFilter) -> QueryOutcome {
        if self.prefer_index {
            let lagging = self.lagging_documents(filter).await;
            if !lagging.is_empty() {
                match bounded(
                    "vector_store",
                    self.timeout,
                    self.relational.query(vector, limit, filter),
                )
                .await
                {
                    Ok(hits) => {
                        tracing::warn!(
                            phase = "retrieval",
                            lagging = lagging.len(),
                            "vector index is missing degraded documents; served from relational backend"
                        );
                        return QueryOutcome::Degraded {
                            hits,
                            reason: format!(
                                "vector index missing {} degraded document(s) ({}); results from {}",
                                lagging.len(),
                                lagging.join(", "),
                                self.relational.name()
                            ),
                        };
                    }
                    Err(err) => tracing::warn!(
                        phase = "retrieval",
                        backend = self.relational.name(),
                        error = %err,
                        "relational query failed; trying the index anyway"
                    ),
                }
            }
        }

        let (primary, secondary) = match (&self.index, self.prefer_index) {
            (Some(index), true) => (index.clone(), Some(self.relational.clone())),
            (Some(index), false) => (self.relational.clone(), Some(index.clone())),
            (None, _) => (self.relational.clone(), None),
        };

        let primary_err = match bounded(
            "vector_store",
            self.timeout,
            primary.query(vector, limit, filter),
        )
        .await
        {
            Ok(hits) => return QueryOutcome::Ok(hits),
            Err(err) => err,
        };

        let Some(secondary) = secondary else {
            tracing::warn!(
                phase = "retrieval",
                backend = primary.name(),
                error = %primary_err,
                "vector query failed with no fallback backend"
            );
            return QueryOutcome::Degraded {
                hits: vec![],
                reason: format!("{} unavailable: {primary_err}", primary.name()),
            };
        };

        match bounded(
            "vector_store",
            self.timeout,
            secondary.query(vector, limit, filter),
        )
        .await
        {
            Ok(hits) => {
                tracing::warn!(
                    phase = "retrieval",
                    primary = primary.name(),
                    fallback = secondary.name(),
                    error = %primary_err,
                    "preferred vector backend failed; served from fallback"
                );
                QueryOutcome::Degraded {
                    hits,
                    reason: format!(
                        "{} unavailable ({primary_err}); results from {}",
                        primary.name(),
                        secondary.name()
                    ),
                }
            }
            Err(secondary_err) => {
                tracing::error!(
                    phase = "retrieval",
                    primary_error = %primary_err,
                    fallback_error = %secondary_err,
                    "all vector backends failed"
                );
                QueryOutcome::Degraded {
                    hits: vec![],
                    reason: format!(
                        "{} unavailable ({primary_err}); {} unavailable ({secondary_err})",
                        primary.name(),
                        secondary.name()
                    ),
                }
            }
        }
    }

    async fn lagging_documents(&self, filter: &QueryFilter) -> Vec<String> {
        let Some(catalog) = &self.catalog else {
            return vec![];
        };
        match tokio::time::timeout(self.timeout, catalog.documents_in_state(IndexState::Degraded)).await {
            Ok(Ok(docs)) => docs
                .into_iter()
                .filter(|doc| filter.document_type.map_or(true, |t| t == doc.document_type))
                .map(|doc| doc.document_name)
                .collect(),
            Ok(Err(err)) => {
                tracing::warn!(error = %format!("{err:#}"), "could not read index states");
                vec![]
            }
            Err(_) => {
                tracing::warn!("timed out reading index states");
                vec![]
            }
        }
    }

    pub async fn count_document(&self, document_name: &str) -> Result<usize> {
        bounded(
            "vector_store",
            self.timeout,
            self.relational.count_document(document_name),
        )
        .await
    }

    /// Re-pushes a document's chunks from the relational backend into the index.
    pub async fn resync_index(&self, document_name: &str) -> Result<usize> {
        let Some(index) = &self.index else {
            return Err(GloveboxError::Config(
                "no dedicated vector index configured".to_string(),
            ));
        };

        let chunks = bounded(
            "vector_store",
            self.timeout,
            self.relational.fetch_document(document_name),
        )
        .await?;
        bounded(
            "vector_store",
            self.timeout,
            index.upsert(document_name, &chunks),
        )
        .await?;

        let indexed = bounded(
            "vector_store",
            self.timeout,
            index.count_document(document_name),
        )
        .await?;
        if indexed != chunks.len() {
            return Err(GloveboxError::vector_store(
                index.name(),
                format!(
                    "count mismatch for {document_name}: relational={} index={indexed}",
                    chunks.len()
                ),
            ));
        }

        Ok(indexed)
    }

    pub async fn health(&self) -> Vec<BackendHealth> {
        let mut backends = vec![self.relational.clone()];
        backends.extend(self.index.clone());

        let mut out = Vec::with_capacity(backends.len());
        for backend in backends {
            let result = bounded("vector_store", self.timeout, backend.ping()).await;
            out.push(BackendHealth {
                name: backend.name(),
                ok: result.is_ok(),
                error: result.err().map(|err| err.to_string()),
            });
        }
        out
    }
}

/// Score desc, then lower chunk index, then document name.
pub(crate) fn rank_order(a: &ScoredChunk, b: &ScoredChunk) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.chunk.chunk_index.cmp(&b.chunk.chunk_index))
        .then_with(|| a.chunk.document_name.cmp(&b.chunk.document_name))
}

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::Utc;

    use crate::embedder::HashingEmbedder;
    use crate::models::{DocumentChunk, DocumentType};

    pub fn chunk(
        embedder: &HashingEmbedder,
        document: &str,
        index: i64,
        page: i64,
        content: &str,
    ) -> DocumentChunk {
        DocumentChunk {
            document_name: document.to_string(),
            document_type: DocumentType::Manual,
            chunk_index: index,
            content: content.to_string(),
            page_number: Some(page),
            token_count: content.split_whitespace().count() as i64,
            chapter: None,
            section: None,
            topics: vec!["general".to_string()],
            embedding: embedder.embed_sync(content).expect("embed"),
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::chunk;
    use super::*;
    use crate::db::test_support::temp_database;
    use crate::embedder::{cosine_similarity, HashingEmbedder};

    fn store_with_dead_index(db: &Database, prefer_index: bool) -> VectorStore {
        VectorStore::new(
            Arc::new(SqliteVectorBackend::new(db.pool().clone())),
            Some(Arc::new(QdrantBackend::new("http://127.0.0.1:9", "test"))),
            prefer_index,
            Duration::from_secs(2),
        )
    }

    #[tokio::test]
    async fn preferred_index_down_falls_back_to_relational_results() {
        let (_dir, _config, db) = temp_database().await;
        let embedder = HashingEmbedder::new(128);
        let store = store_with_dead_index(&db, true);

        let chunks = vec![
            chunk(&embedder, "manual.pdf", 0, 1, "check brake fluid level"),
            chunk(&embedder, "manual.pdf", 1, 2, "pair bluetooth audio"),
        ];
        let report = store.replace_document("manual.pdf", &chunks).await.unwrap();
        assert_eq!(report.index_state, IndexState::Degraded);
        assert!(report.index_error.is_some());

        let query = embedder.embed_sync("brake fluid").unwrap();
        let outcome = store.query(&query, 5, &QueryFilter::default()).await;
        match outcome {
            QueryOutcome::Degraded { hits, reason } => {
                assert_eq!(hits.len(), 2);
                assert_eq!(hits[0].chunk.chunk_index, 0);
                assert!(reason.contains("qdrant"));
            }
            QueryOutcome::Ok(_) => panic!("expected degraded outcome"),
        }
    }

    /// In-memory index that holds whatever it was seeded with.
    struct SeededIndex {
        chunks: Vec<DocumentChunk>,
    }

    #[async_trait]
    impl VectorBackend for SeededIndex {
        fn name(&self) -> &'static str {
            "seeded"
        }

        async fn upsert(&self, _document_name: &str, _chunks: &[DocumentChunk]) -> Result<()> {
            Err(GloveboxError::vector_store("seeded", "read only"))
        }

        async fn delete_document(&self, _document_name: &str) -> Result<()> {
            Ok(())
        }

        async fn query(
            &self,
            vector: &[f32],
            limit: usize,
            _filter: &QueryFilter,
        ) -> Result<Vec<ScoredChunk>> {
            let mut hits: Vec<ScoredChunk> = self
                .chunks
                .iter()
                .map(|chunk| ScoredChunk {
                    score: cosine_similarity(vector, &chunk.embedding),
                    chunk: chunk.clone(),
                })
                .collect();
            hits.sort_by(rank_order);
            hits.truncate(limit);
            Ok(hits)
        }

        async fn count_document(&self, document_name: &str) -> Result<usize> {
            Ok(self
                .chunks
                .iter()
                .filter(|chunk| chunk.document_name == document_name)
                .count())
        }

        async fn ping(&self) -> Result<()> {
            Ok(())
        }
    }

    /// Backend whose every call outlives any reasonable deadline.
    struct StalledBackend;

    #[async_trait]
    impl VectorBackend for StalledBackend {
        fn name(&self) -> &'static str {
            "stalled"
        }

        async fn upsert(&self, _document_name: &str, _chunks: &[DocumentChunk]) -> Result<()> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }

        async fn delete_document(&self, _document_name: &str) -> Result<()> {
            Ok(())
        }

        async fn query(
            &self,
            _vector: &[f32],
            _limit: usize,
            _filter: &QueryFilter,
        ) -> Result<Vec<ScoredChunk>> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(vec![])
        }

        async fn count_document(&self, _document_name: &str) -> Result<usize> {
            Ok(0)
        }

        async fn ping(&self) -> Result<()> {
            Ok(())
        }
    }

    fn record(name: &str, state: IndexState) -> crate::models::DocumentRecord {
        crate::models::DocumentRecord {
            document_name: name.to_string(),
            document_type: DocumentType::Manual,
            file_path: format!("/docs/{name}"),
            content_hash: "h".to_string(),
            page_count: 1,
            chunk_count: 1,
            index_state: state,
            message: None,
            ingested_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn degraded_documents_route_preferred_queries_to_relational() {
        let (_dir, _config, db) = temp_database().await;
        let embedder = HashingEmbedder::new(128);
        let indexed = chunk(&embedder, "manual.pdf", 0, 1, "tire rotation interval");
        let missing = chunk(&embedder, "qrg.pdf", 0, 4, "brake fluid reservoir level");

        let relational = Arc::new(SqliteVectorBackend::new(db.pool().clone()));
        relational.upsert("manual.pdf", &[indexed.clone()]).await.unwrap();
        relational.upsert("qrg.pdf", &[missing.clone()]).await.unwrap();
        db.upsert_document(&record("manual.pdf", IndexState::Indexed)).await.unwrap();
        db.upsert_document(&record("qrg.pdf", IndexState::Degraded)).await.unwrap();

        let store = VectorStore::new(
            relational,
            Some(Arc::new(SeededIndex {
                chunks: vec![indexed],
            })),
            true,
            Duration::from_secs(2),
        )
        .with_catalog(db.clone());

        let query = embedder.embed_sync("brake fluid").unwrap();
        match store.query(&query, 5, &QueryFilter::default()).await {
            QueryOutcome::Degraded { hits, reason } => {
                assert_eq!(hits[0].chunk.document_name, "qrg.pdf");
                assert!(reason.contains("qrg.pdf"));
            }
            QueryOutcome::Ok(_) => panic!("a lagging index must not look healthy"),
        }

        // Other document types are not affected by a lagging manual.
        let receipts = QueryFilter {
            document_type: Some(DocumentType::Receipt),
            min_score: None,
        };
        assert!(matches!(
            store.query(&query, 5, &receipts).await,
            QueryOutcome::Ok(_)
        ));

        db.set_index_state("qrg.pdf", IndexState::Indexed, None).await.unwrap();
        match store.query(&query, 5, &QueryFilter::default()).await {
            QueryOutcome::Ok(hits) => {
                assert!(hits.iter().all(|hit| hit.chunk.document_name == "manual.pdf"))
            }
            QueryOutcome::Degraded { reason, .. } => panic!("unexpected degradation: {reason}"),
        }
    }

    #[tokio::test]
    async fn stalled_index_times_out_and_serves_relational_hits() {
        let (_dir, _config, db) = temp_database().await;
        let embedder = HashingEmbedder::new(128);
        let relational = Arc::new(SqliteVectorBackend::new(db.pool().clone()));
        relational
            .upsert("manual.pdf", &[chunk(&embedder, "manual.pdf", 0, 3, "jump start the battery")])
            .await
            .unwrap();

        let store = VectorStore::new(
            relational,
            Some(Arc::new(StalledBackend)),
            true,
            Duration::from_millis(200),
        );

        let started = std::time::Instant::now();
        let query = embedder.embed_sync("jump start").unwrap();
        let outcome = store.query(&query, 3, &QueryFilter::default()).await;
        assert!(started.elapsed() < Duration::from_secs(2));
        match outcome {
            QueryOutcome::Degraded { hits, reason } => {
                assert_eq!(hits.len(), 1);
                assert!(reason.contains("stalled"));
                assert!(reason.contains("timed out"));
            }
            QueryOutcome::Ok(_) => panic!("expected degraded outcome"),
        }

        // A stalled index write degrades the document instead of hanging ingestion.
        let report = store
            .replace_document("manual.pdf", &[chunk(&embedder, "manual.pdf", 0, 3, "jump start")])
            .await
            .unwrap();
        assert_eq!(report.index_state, IndexState::Degraded);
    }

    #[tokio::test]
    async fn relational_primary_answers_without_touching_index() {
        let (_dir, _config, db) = temp_database().await;
        let embedder = HashingEmbedder::new(128);
        let store = store_with_dead_index(&db, false);

        store
            .replace_document(
                "manual.pdf",
                &[chunk(&embedder, "manual.pdf", 0, 1, "tire pressure placard")],
            )
            .await
            .unwrap();

        let query = embedder.embed_sync("tire pressure").unwrap();
        let outcome = store.query(&query, 3, &QueryFilter::default()).await;
        assert!(matches!(outcome, QueryOutcome::Ok(ref hits) if hits.len() == 1));
    }

    #[tokio::test]
    async fn reupsert_replaces_previous_chunk_set() {
        let (_dir, _config, db) = temp_database().await;
        let embedder = HashingEmbedder::new(64);
        let store = VectorStore::new(
            Arc::new(SqliteVectorBackend::new(db.pool().clone())),
            None,
            false,
            Duration::from_secs(2),
        );

        let first: Vec<_> = (0..4)
            .map(|i| chunk(&embedder, "qrg.pdf", i, 1, &format!("first version part {i}")))
            .collect();
        store.replace_document("qrg.pdf", &first).await.unwrap();
        assert_eq!(store.count_document("qrg.pdf").await.unwrap(), 4);

        let second: Vec<_> = (0..2)
            .map(|i| chunk(&embedder, "qrg.pdf", i, 1, &format!("second version part {i}")))
            .collect();
        store.replace_document("qrg.pdf", &second).await.unwrap();
        assert_eq!(store.count_document("qrg.pdf").await.unwrap(), 2);

        let query = embedder.embed_sync("version part").unwrap();
        let hits = store
            .query(&query, 10, &QueryFilter::default())
            .await
            .into_parts()
            .0;
        assert!(hits.iter().all(|hit| hit.chunk.content.starts_with("second")));

        store.delete_document("qrg.pdf").await.unwrap();
        assert_eq!(store.count_document("qrg.pdf").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn resync_without_index_is_a_config_error() {
        let (_dir, _config, db) = temp_database().await;
        let store = VectorStore::new(
            Arc::new(SqliteVectorBackend::new(db.pool().clone())),
            None,
            true,
            Duration::from_secs(1),
        );
        assert!(!store.has_index());
        assert!(matches!(
            store.resync_index("x.pdf").await,
            Err(GloveboxError::Config(_))
        ));
    }
}
