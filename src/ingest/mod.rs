pub mod pdf;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::chunker::{Chunker, PageText};
use crate::config::AppConfig;
use crate::db::Database;
use crate::embedder::Embedder;
use crate::error::GloveboxError;
use crate::models::{
    DocumentListing, DocumentRecord, DocumentType, IndexState, IngestRequest, IngestStatus,
};
use crate::page_images::PageImages;
use crate::vector_store::VectorStore;

const EMBED_BATCH: usize = 16;
const EMBED_CONCURRENCY: usize = 4;

#[derive(Clone)]
pub struct Ingestor {
    config: AppConfig,
    db: Database,
    embedder: Arc<dyn Embedder>,
    store: VectorStore,
    pages: PageImages,
    chunker: Arc<Chunker>,
    permits: Arc<Semaphore>,
}

#[derive(Debug, Clone)]
pub struct IngestResult {
    pub document_name: String,
    pub chunk_count: i64,
    pub page_count: i64,
    pub index_state: IndexState,
    pub skipped: bool,
}

/// Identity of one document version, known before its text is indexed.
#[derive(Debug, Clone)]
pub(crate) struct DocumentSource {
    pub document_name: String,
    pub document_type: DocumentType,
    pub file_path: String,
    pub content_hash: String,
    pub page_count: i64,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ReconcileReport {
    pub repaired: Vec<String>,
    pub still_degraded: Vec<String>,
}

impl Ingestor {
    pub fn new(
        config: AppConfig,
        db: Database,
        embedder: Arc<dyn Embedder>,
        store: VectorStore,
        pages: PageImages,
    ) -> Self {
        let chunker = Chunker::new(
            config.tokens.chunk_target_tokens,
            config.tokens.chunk_overlap_tokens,
        );
        let permits = Arc::new(Semaphore::new(config.max_concurrent_ingestions.max(1)));
        Self {
            config,
            db,
            embedder,
            store,
            pages,
            chunker: Arc::new(chunker),
            permits,
        }
    }

    /// Ingests one PDF. Failures are recorded on the job and the document
    /// before being returned; other documents are unaffected.
    pub async fn ingest<F>(
        &self,
        job_id: &str,
        request: IngestRequest,
        mut progress: F,
    ) -> Result<IngestResult>
    where
        F: FnMut(IngestStatus) + Send,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .context("ingestion queue closed")?;

        let path = Path::new(&request.path).to_path_buf();
        let document_name = request.document_name.clone().unwrap_or_else(|| {
            path.file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_else(|| request.path.clone())
        });
        let document_type = request
            .document_type
            .unwrap_or_else(|| DocumentType::guess_from_filename(&document_name));

        let now = Utc::now();
        let mut status = IngestStatus {
            job_id: job_id.to_string(),
            document_name: document_name.clone(),
            status: "running".to_string(),
            stage: "hashing_source".to_string(),
            message: None,
            chunk_count: 0,
            page_count: 0,
            started_at: now,
            updated_at: now,
        };
        progress(status.clone());
        self.db.upsert_ingest_status(&status).await?;

        let outcome = self
            .ingest_file(&path, &document_name, document_type, request.rebuild, &mut status, &mut progress)
            .await;

        if let Err(err) = &outcome {
            self.record_failure(&document_name, document_type, &request.path, err, &mut status, &mut progress)
                .await;
        }
        outcome
    }

    async fn ingest_file<F>(
        &self,
        path: &Path,
        document_name: &str,
        document_type: DocumentType,
        rebuild: bool,
        status: &mut IngestStatus,
        progress: &mut F,
    ) -> Result<IngestResult>
    where
        F: FnMut(IngestStatus) + Send,
    {
        let content_hash = file_sha256(path).await?;

        if !rebuild {
            if let Some(result) = self.skip_if_unchanged(document_name, &content_hash, status, progress).await? {
                return Ok(result);
            }
        }

        self.advance(status, "extracting_text", progress).await?;
        let pages = pdf::extract_pages(path).await?;
        let page_count = match pdf::page_count(path).await {
            Ok(count) => count as i64,
            Err(_) => pages
                .iter()
                .filter_map(|page| page.page_number)
                .max()
                .unwrap_or(pages.len() as i64),
        };
        status.page_count = page_count;

        self.advance(status, "rendering_pages", progress).await?;
        match self.pages.render(path, document_name, page_count.max(0) as usize).await {
            Ok(rendered) => {
                tracing::info!(document = document_name, rendered, "rendered page images")
            }
            Err(err) => {
                tracing::warn!(document = document_name, error = %err, "page rendering failed; sources will omit images")
            }
        }

        let source = DocumentSource {
            document_name: document_name.to_string(),
            document_type,
            file_path: path.display().to_string(),
            content_hash,
            page_count,
        };
        self.index_pages(&source, &pages, status, progress).await
    }

    /// Chunk, embed and write already-extracted pages. Skips the work when
    /// the same content is already indexed and `rebuild` is false.
    #[cfg(test)]
    pub(crate) async fn ingest_pages(
        &self,
        job_id: &str,
        source: DocumentSource,
        pages: &[PageText],
        rebuild: bool,
    ) -> Result<IngestResult> {
        let now = Utc::now();
        let mut status = IngestStatus {
            job_id: job_id.to_string(),
            document_name: source.document_name.clone(),
            status: "running".to_string(),
            stage: "chunking".to_string(),
            message: None,
            chunk_count: 0,
            page_count: source.page_count,
            started_at: now,
            updated_at: now,
        };
        let mut progress = |_status: IngestStatus| {};

        if !rebuild {
            if let Some(result) = self
                .skip_if_unchanged(&source.document_name, &source.content_hash, &mut status, &mut progress)
                .await?
            {
                return Ok(result);
            }
        }

        let outcome = self.index_pages(&source, pages, &mut status, &mut progress).await;
        if let Err(err) = &outcome {
            self.record_failure(
                &source.document_name,
                source.document_type,
                &source.file_path,
                err,
                &mut status,
                &mut progress,
            )
            .await;
        }
        outcome
    }

    async fn index_pages<F>(
        &self,
        source: &DocumentSource,
        pages: &[PageText],
        status: &mut IngestStatus,
        progress: &mut F,
    ) -> Result<IngestResult>
    where
        F: FnMut(IngestStatus) + Send,
    {
        let name = source.document_name.as_str();

        self.advance(status, "chunking", progress).await?;
        let drafts = self.chunker.chunk_pages(pages);
        if drafts.is_empty() {
            return Err(GloveboxError::Ingestion {
                document: name.to_string(),
                message: "no extractable text".to_string(),
            }
            .into());
        }
        status.chunk_count = drafts.len() as i64;

        self.advance(status, "embedding", progress).await?;
        let texts: Vec<String> = drafts.iter().map(|draft| draft.content.clone()).collect();
        let vectors = self.embed_all(name, &texts).await?;

        let created_at = Utc::now();
        let chunks: Vec<_> = drafts
            .into_iter()
            .zip(vectors)
            .map(|(draft, embedding)| draft.into_chunk(name, source.document_type, embedding, created_at))
            .collect();

        self.advance(status, "indexing", progress).await?;
        let report = self.store.replace_document(name, &chunks).await?;
        let message = report
            .index_error
            .as_ref()
            .map(|err| format!("stored in sqlite only; vector index write failed: {err}"));

        self.db
            .upsert_document(&DocumentRecord {
                document_name: name.to_string(),
                document_type: source.document_type,
                file_path: source.file_path.clone(),
                content_hash: source.content_hash.clone(),
                page_count: source.page_count,
                chunk_count: chunks.len() as i64,
                index_state: report.index_state,
                message: message.clone(),
                ingested_at: Utc::now(),
            })
            .await?;

        status.status = "completed".to_string();
        status.message = message;
        self.advance(status, "done", progress).await?;

        tracing::info!(
            document = name,
            chunks = chunks.len(),
            pages = source.page_count,
            index_state = report.index_state.as_str(),
            "ingestion complete"
        );

        Ok(IngestResult {
            document_name: name.to_string(),
            chunk_count: chunks.len() as i64,
            page_count: source.page_count,
            index_state: report.index_state,
            skipped: false,
        })
    }

    /// Embeds in concurrent batches; output order matches `texts`. Any
    /// failed item fails the whole document so nothing is half-written.
    async fn embed_all(&self, document_name: &str, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut vectors: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        let per_batch_timeout = self.config.timeouts.embedding * EMBED_BATCH as u32;

        for (wave_no, wave) in texts.chunks(EMBED_BATCH * EMBED_CONCURRENCY).enumerate() {
            let wave_offset = wave_no * EMBED_BATCH * EMBED_CONCURRENCY;
            let mut set = JoinSet::new();

            for (batch_no, batch) in wave.chunks(EMBED_BATCH).enumerate() {
                let embedder = self.embedder.clone();
                let batch = batch.to_vec();
                let offset = wave_offset + batch_no * EMBED_BATCH;
                set.spawn(async move {
                    let results =
                        tokio::time::timeout(per_batch_timeout, embedder.embed_batch(&batch)).await;
                    (offset, batch.len(), results)
                });
            }

            while let Some(joined) = set.join_next().await {
                let (offset, len, results) = joined.context("embedding task panicked")?;
                let results = results.map_err(|_| GloveboxError::Ingestion {
                    document: document_name.to_string(),
                    message: format!("embedding timed out for chunks {offset}..{}", offset + len),
                })?;

                for (idx, result) in results.into_iter().enumerate() {
                    let vector = result.map_err(|err| GloveboxError::Ingestion {
                        document: document_name.to_string(),
                        message: format!("chunk {} failed to embed: {err}", offset + idx),
                    })?;
                    vectors[offset + idx] = Some(vector);
                }
            }
        }

        vectors
            .into_iter()
            .enumerate()
            .map(|(idx, vector)| {
                vector.ok_or_else(|| {
                    anyhow::Error::from(GloveboxError::Ingestion {
                        document: document_name.to_string(),
                        message: format!("chunk {idx} has no embedding"),
                    })
                })
            })
            .collect()
    }

    async fn skip_if_unchanged<F>(
        &self,
        document_name: &str,
        content_hash: &str,
        status: &mut IngestStatus,
        progress: &mut F,
    ) -> Result<Option<IngestResult>>
    where
        F: FnMut(IngestStatus) + Send,
    {
        let Some(existing) = self.db.get_document(document_name).await? else {
            return Ok(None);
        };
        if existing.content_hash != content_hash || existing.index_state != IndexState::Indexed {
            return Ok(None);
        }

        status.status = "completed".to_string();
        status.message = Some("Source unchanged; skipped re-ingest.".to_string());
        status.chunk_count = existing.chunk_count;
        status.page_count = existing.page_count;
        self.advance(status, "skipped_unchanged", progress).await?;

        Ok(Some(IngestResult {
            document_name: existing.document_name,
            chunk_count: existing.chunk_count,
            page_count: existing.page_count,
            index_state: existing.index_state,
            skipped: true,
        }))
    }

    async fn advance<F>(&self, status: &mut IngestStatus, stage: &str, progress: &mut F) -> Result<()>
    where
        F: FnMut(IngestStatus) + Send,
    {
        status.stage = stage.to_string();
        status.updated_at = Utc::now();
        progress(status.clone());
        self.db.upsert_ingest_status(status).await
    }

    async fn record_failure<F>(
        &self,
        document_name: &str,
        document_type: DocumentType,
        file_path: &str,
        err: &anyhow::Error,
        status: &mut IngestStatus,
        progress: &mut F,
    ) where
        F: FnMut(IngestStatus) + Send,
    {
        tracing::error!(phase = "ingestion", document = document_name, error = %format!("{err:#}"), "ingestion failed");

        status.status = "failed".to_string();
        status.message = Some(format!("{err:#}"));
        status.updated_at = Utc::now();
        progress(status.clone());
        if let Err(db_err) = self.db.upsert_ingest_status(status).await {
            tracing::warn!(error = %db_err, "failed to persist ingest failure status");
        }

        // A failed re-ingest leaves the previous chunk set serving queries.
        let result = match self.db.get_document(document_name).await {
            Ok(Some(_)) => {
                self.db
                    .set_index_state(document_name, IndexState::Failed, status.message.as_deref())
                    .await
            }
            Ok(None) => {
                self.db
                    .upsert_document(&DocumentRecord {
                        document_name: document_name.to_string(),
                        document_type,
                        file_path: file_path.to_string(),
                        content_hash: String::new(),
                        page_count: status.page_count,
                        chunk_count: 0,
                        index_state: IndexState::Failed,
                        message: status.message.clone(),
                        ingested_at: Utc::now(),
                    })
                    .await
            }
            Err(err) => Err(err),
        };
        if let Err(db_err) = result {
            tracing::warn!(document = document_name, error = %db_err, "failed to record document failure");
        }
    }

    /// Removes vectors, page images, the stored file and the record.
    pub async fn delete_document(&self, document_name: &str) -> Result<bool> {
        let record = self.db.get_document(document_name).await?;
        let chunks = self.store.count_document(document_name).await?;
        if record.is_none() && chunks == 0 {
            return Ok(false);
        }

        self.store.delete_document(document_name).await?;
        let removed_images = self.pages.remove(document_name).await?;

        if let Some(record) = &record {
            let file = Path::new(&record.file_path);
            if file.starts_with(&self.config.docs_dir) && file.is_file() {
                tokio::fs::remove_file(file)
                    .await
                    .with_context(|| format!("failed removing {}", file.display()))?;
            }
        }
        self.db.delete_document(document_name).await?;

        tracing::info!(document = document_name, chunks, removed_images, "deleted document");
        Ok(true)
    }

    /// Re-pushes every `degraded` document from sqlite into the vector index.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        if !self.store.has_index() {
            return Ok(report);
        }

        for doc in self.db.documents_in_state(IndexState::Degraded).await? {
            match self.store.resync_index(&doc.document_name).await {
                Ok(count) => {
                    self.db
                        .set_index_state(&doc.document_name, IndexState::Indexed, None)
                        .await?;
                    tracing::info!(document = %doc.document_name, chunks = count, "reconciled vector index");
                    report.repaired.push(doc.document_name);
                }
                Err(err) => {
                    let message = format!("reconcile failed: {err}");
                    self.db
                        .set_index_state(&doc.document_name, IndexState::Degraded, Some(&message))
                        .await?;
                    tracing::warn!(document = %doc.document_name, error = %err, "reconcile failed");
                    report.still_degraded.push(doc.document_name);
                }
            }
        }

        Ok(report)
    }

    pub async fn listings(&self) -> Result<Vec<DocumentListing>> {
        Ok(self
            .db
            .list_documents()
            .await?
            .into_iter()
            .map(|doc| DocumentListing {
                file_present: Path::new(&doc.file_path).is_file(),
                document_name: doc.document_name,
                document_type: doc.document_type,
                chunk_count: doc.chunk_count,
                page_count: doc.page_count,
                index_state: doc.index_state,
                message: doc.message,
                ingested_at: doc.ingested_at,
            })
            .collect())
    }
}

async fn file_sha256(path: &Path) -> Result<String> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed reading file for hash: {}", path.display()))?;

    let mut hasher = Sha256::new();
    hasher.update(bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::time::Duration;

    use super::*;
    use crate::embedder::HashingEmbedder;
    use crate::vector_store::SqliteVectorBackend;

    pub fn ingestor(config: &AppConfig, db: &Database, embedder: Arc<dyn Embedder>) -> Ingestor {
        let store = VectorStore::new(
            Arc::new(SqliteVectorBackend::new(db.pool().clone())),
            None,
            false,
            Duration::from_secs(5),
        );
        Ingestor::new(
            config.clone(),
            db.clone(),
            embedder,
            store,
            PageImages::new(config.page_image_dir()),
        )
    }

    pub fn hashing_ingestor(config: &AppConfig, db: &Database) -> Ingestor {
        ingestor(config, db, Arc::new(HashingEmbedder::new(config.models.embedding_dim)))
    }

    pub fn text_sha256(pages: &[PageText]) -> String {
        let mut hasher = Sha256::new();
        for page in pages {
            hasher.update(page.page_number.unwrap_or(-1).to_le_bytes());
            hasher.update(page.text.as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }

    pub fn source(name: &str, pages: &[PageText]) -> DocumentSource {
        DocumentSource {
            document_name: name.to_string(),
            document_type: DocumentType::Manual,
            file_path: format!("/nonexistent/{name}"),
            content_hash: text_sha256(pages),
            page_count: pages.len() as i64,
        }
    }
}
