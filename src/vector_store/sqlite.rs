use anyhow::Context;
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use super::{rank_order, QueryFilter, ScoredChunk, VectorBackend};
use crate::db::parse_timestamp;
use crate::embedder::cosine_similarity;
use crate::error::{GloveboxError, Result};
use crate::models::{DocumentChunk, DocumentType};

const BACKEND: &str = "sqlite";
const DIM_KEY: &str = "embedding_dim";

/// Chunks and embeddings in the `document_chunks` table. Similarity is
/// computed in-process over a full scan, which is fine at owner's-manual scale.
#[derive(Clone)]
pub struct SqliteVectorBackend {
    pool: SqlitePool,
}

impl SqliteVectorBackend {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn upsert_inner(
        &self,
        document_name: &str,
        chunks: &[DocumentChunk],
    ) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;

        if let Some(first) = chunks.first() {
            let dimension = first.embedding.len();
            if let Some(bad) = chunks.iter().find(|c| c.embedding.len() != dimension) {
                anyhow::bail!(
                    "chunk {} has {} dimensions, expected {dimension}",
                    bad.chunk_index,
                    bad.embedding.len()
                );
            }

            let stored: Option<String> =
                sqlx::query_scalar("SELECT value FROM store_meta WHERE key = ?")
                    .bind(DIM_KEY)
                    .fetch_optional(&mut *tx)
                    .await?;
            match stored.and_then(|v| v.parse::<usize>().ok()) {
                Some(existing) if existing != dimension => {
                    anyhow::bail!(
                        "embedding dimension mismatch: store holds {existing}, got {dimension}"
                    );
                }
                Some(_) => {}
                None => {
                    sqlx::query("INSERT OR REPLACE INTO store_meta (key, value) VALUES (?, ?)")
                        .bind(DIM_KEY)
                        .bind(dimension.to_string())
                        .execute(&mut *tx)
                        .await?;
                }
            }
        }

        sqlx::query("DELETE FROM document_chunks WHERE document_name = ?")
            .bind(document_name)
            .execute(&mut *tx)
            .await?;

        for chunk in chunks {
            sqlx::query(
                r#"
                INSERT INTO document_chunks (document_name, chunk_index, document_type, content, page_number, token_count, chapter, section, topics, embedding, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(document_name)
            .bind(chunk.chunk_index)
            .bind(chunk.document_type.as_str())
            .bind(&chunk.content)
            .bind(chunk.page_number)
            .bind(chunk.token_count)
            .bind(&chunk.chapter)
            .bind(&chunk.section)
            .bind(serde_json::to_string(&chunk.topics)?)
            .bind(encode_embedding(&chunk.embedding))
            .bind(chunk.created_at.to_rfc3339())
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed inserting chunk {}", chunk.chunk_index))?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn query_inner(
        &self,
        vector: &[f32],
        limit: usize,
        filter: &QueryFilter,
    ) -> anyhow::Result<Vec<ScoredChunk>> {
        let rows = match filter.document_type {
            Some(doc_type) => {
                sqlx::query(&select_sql("WHERE document_type = ?"))
                    .bind(doc_type.as_str())
                    .fetch_all(&self.pool)
                    .await?
            }
            None => sqlx::query(&select_sql("")).fetch_all(&self.pool).await?,
        };

        let mut scored: Vec<ScoredChunk> = rows
            .into_iter()
            .filter_map(|row| {
                let embedding = decode_embedding(&row.get::<Vec<u8>, _>("embedding"));
                let score = cosine_similarity(vector, &embedding);
                if filter.min_score.is_some_and(|min| score < min) {
                    return None;
                }
                Some(ScoredChunk {
                    chunk: row_to_chunk(&row, Vec::new()),
                    score,
                })
            })
            .collect();

        scored.sort_by(rank_order);
        scored.truncate(limit);
        Ok(scored)
    }
}

#[async_trait]
impl VectorBackend for SqliteVectorBackend {
    fn name(&self) -> &'static str {
        BACKEND
    }

    async fn upsert(&self, document_name: &str, chunks: &[DocumentChunk]) -> Result<()> {
        self.upsert_inner(document_name, chunks)
            .await
            .map_err(|err| GloveboxError::vector_store(BACKEND, format!("{err:#}")))
    }

    async fn delete_document(&self, document_name: &str) -> Result<()> {
        sqlx::query("DELETE FROM document_chunks WHERE document_name = ?")
            .bind(document_name)
            .execute(&self.pool)
            .await
            .map_err(|err| GloveboxError::vector_store(BACKEND, err))?;
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        limit: usize,
        filter: &QueryFilter,
    ) -> Result<Vec<ScoredChunk>> {
        self.query_inner(vector, limit, filter)
            .await
            .map_err(|err| GloveboxError::vector_store(BACKEND, format!("{err:#}")))
    }

    async fn count_document(&self, document_name: &str) -> Result<usize> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM document_chunks WHERE document_name = ?")
                .bind(document_name)
                .fetch_one(&self.pool)
                .await
                .map_err(|err| GloveboxError::vector_store(BACKEND, err))?;
        Ok(count as usize)
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|err| GloveboxError::vector_store(BACKEND, err))?;
        Ok(())
    }

    async fn fetch_document(&self, document_name: &str) -> Result<Vec<DocumentChunk>> {
        let rows = sqlx::query(&select_sql("WHERE document_name = ? ORDER BY chunk_index ASC"))
            .bind(document_name)
            .fetch_all(&self.pool)
            .await
            .map_err(|err| GloveboxError::vector_store(BACKEND, err))?;

        Ok(rows
            .iter()
            .map(|row| {
                let embedding = decode_embedding(&row.get::<Vec<u8>, _>("embedding"));
                row_to_chunk(row, embedding)
            })
            .collect())
    }
}

fn select_sql(tail: &str) -> String {
    format!(
        "SELECT document_name, chunk_index, document_type, content, page_number, token_count, \
         chapter, section, topics, embedding, created_at FROM document_chunks {tail}"
    )
}

fn row_to_chunk(row: &SqliteRow, embedding: Vec<f32>) -> DocumentChunk {
    DocumentChunk {
        document_name: row.get("document_name"),
        document_type: DocumentType::from_db(&row.get::<String, _>("document_type")),
        chunk_index: row.get("chunk_index"),
        content: row.get("content"),
        page_number: row.get("page_number"),
        token_count: row.get("token_count"),
        chapter: row.get("chapter"),
        section: row.get("section"),
        topics: serde_json::from_str(&row.get::<String, _>("topics")).unwrap_or_default(),
        embedding,
        created_at: parse_timestamp(&row.get::<String, _>("created_at")),
    }
}

fn encode_embedding(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::temp_database;
    use crate::embedder::HashingEmbedder;
    use crate::vector_store::test_support::chunk;

    #[tokio::test]
    async fn rejects_dimension_mismatch_across_documents() {
        let (_dir, _config, db) = temp_database().await;
        let backend = SqliteVectorBackend::new(db.pool().clone());

        let small = HashingEmbedder::new(32);
        let large = HashingEmbedder::new(64);
        backend
            .upsert("a.pdf", &[chunk(&small, "a.pdf", 0, 1, "oil change")])
            .await
            .unwrap();

        let err = backend
            .upsert("b.pdf", &[chunk(&large, "b.pdf", 0, 1, "oil change")])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("dimension mismatch"));
        assert_eq!(backend.count_document("b.pdf").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn query_filters_by_type_and_min_score_and_round_trips_fields() {
        let (_dir, _config, db) = temp_database().await;
        let backend = SqliteVectorBackend::new(db.pool().clone());
        let embedder = HashingEmbedder::new(256);

        let mut manual = chunk(&embedder, "manual.pdf", 0, 4, "engine oil capacity");
        manual.chapter = Some("8-1 - Maintenance".to_string());
        manual.topics = vec!["maintenance".to_string(), "technical".to_string()];
        let mut receipt = chunk(&embedder, "receipt.pdf", 0, 1, "engine oil capacity");
        receipt.document_type = DocumentType::Receipt;

        backend.upsert("manual.pdf", &[manual.clone()]).await.unwrap();
        backend.upsert("receipt.pdf", &[receipt]).await.unwrap();

        let query = embedder.embed_sync("engine oil capacity").unwrap();
        let hits = backend
            .query(
                &query,
                10,
                &QueryFilter {
                    document_type: Some(DocumentType::Manual),
                    min_score: Some(0.5),
                },
            )
            .await
            .unwrap();

        assert_eq!(hits.len(), 1);
        assert!((hits[0].score - 1.0).abs() < 1e-4);
        assert_eq!(hits[0].chunk.chapter, manual.chapter);
        assert_eq!(hits[0].chunk.topics, manual.topics);
        assert!(hits[0].chunk.embedding.is_empty());

        let fetched = backend.fetch_document("manual.pdf").await.unwrap();
        assert_eq!(fetched[0].embedding, manual.embedding);
    }

    #[test]
    fn embedding_blob_round_trips() {
        let vector = vec![0.25f32, -1.5, 3.0e-7];
        assert_eq!(decode_embedding(&encode_embedding(&vector)), vector);
    }
}
