use std::sync::Arc;

use anyhow::{Context, Result as AnyResult};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{rank_order, QueryFilter, ScoredChunk, VectorBackend};
use crate::error::{GloveboxError, Result};
use crate::models::DocumentChunk;

const BACKEND: &str = "qdrant";
const UPSERT_BATCH: usize = 64;

/// Dedicated vector index over Qdrant's REST API. The full chunk rides in
/// the point payload so hits need no relational lookup.
#[derive(Clone)]
pub struct QdrantBackend {
    client: Client,
    base_url: String,
    collection: String,
    known_vector_size: Arc<RwLock<Option<usize>>>,
}

#[derive(Debug, Serialize)]
struct QdrantPoint<'a> {
    id: String,
    vector: &'a [f32],
    payload: &'a DocumentChunk,
}

#[derive(Debug, Deserialize)]
struct QdrantSearchResponse {
    result: Vec<QdrantResultPoint>,
}

#[derive(Debug, Deserialize)]
struct QdrantResultPoint {
    score: f32,
    payload: Option<DocumentChunk>,
}

#[derive(Debug, Deserialize)]
struct QdrantCountResponse {
    result: QdrantCount,
}

#[derive(Debug, Deserialize)]
struct QdrantCount {
    count: usize,
}

impl QdrantBackend {
    pub fn new(base_url: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            collection: collection.into(),
            known_vector_size: Arc::new(RwLock::new(None)),
        }
    }

    /// Stable point id so re-ingesting a document overwrites rather than duplicates.
    pub fn point_id(document_name: &str, chunk_index: i64) -> String {
        Uuid::new_v5(
            &Uuid::NAMESPACE_OID,
            format!("{document_name}#{chunk_index}").as_bytes(),
        )
        .to_string()
    }

    fn collection_url(&self) -> String {
        format!("{}/collections/{}", self.base_url, self.collection)
    }

    async fn ensure_collection(&self, vector_size: usize) -> AnyResult<()> {
        {
            let known = self.known_vector_size.read().await;
            if let Some(existing) = *known {
                if existing == vector_size {
                    return Ok(());
                }
                anyhow::bail!(
                    "collection {} holds {existing}-dim vectors, got {vector_size}",
                    self.collection
                );
            }
        }

        let response = self
            .client
            .get(self.collection_url())
            .send()
            .await
            .context("failed to contact qdrant while reading collection")?;

        if response.status() == StatusCode::OK {
            let info = response
                .json::<Value>()
                .await
                .context("failed to decode qdrant collection info")?;
            let existing = info
                .pointer("/result/config/params/vectors/size")
                .and_then(Value::as_u64)
                .map(|size| size as usize);
            if let Some(existing) = existing {
                if existing != vector_size {
                    anyhow::bail!(
                        "collection {} holds {existing}-dim vectors, got {vector_size}",
                        self.collection
                    );
                }
            }
        } else if response.status() == StatusCode::NOT_FOUND {
            let payload = json!({
                "vectors": {
                    "size": vector_size,
                    "distance": "Cosine"
                }
            });

            self.client
                .put(self.collection_url())
                .json(&payload)
                .send()
                .await
                .context("failed to contact qdrant while creating collection")?
                .error_for_status()
                .context("qdrant failed to create collection")?;

            tracing::info!(
                collection = %self.collection,
                vector_size,
                "created qdrant collection"
            );
        } else {
            anyhow::bail!("qdrant collection lookup returned {}", response.status());
        }

        *self.known_vector_size.write().await = Some(vector_size);
        Ok(())
    }

    async fn delete_inner(&self, document_name: &str) -> AnyResult<()> {
        let url = format!("{}/points/delete?wait=true", self.collection_url());
        let response = self
            .client
            .post(url)
            .json(&json!({ "filter": document_filter(document_name) }))
            .send()
            .await
            .context("failed to contact qdrant during delete")?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        response
            .error_for_status()
            .context("qdrant delete returned non-success status")?;
        Ok(())
    }

    async fn upsert_inner(&self, document_name: &str, chunks: &[DocumentChunk]) -> AnyResult<()> {
        if let Some(first) = chunks.first() {
            self.ensure_collection(first.embedding.len()).await?;
        }

        self.delete_inner(document_name).await?;

        let url = format!("{}/points?wait=true", self.collection_url());
        for batch in chunks.chunks(UPSERT_BATCH) {
            let points: Vec<QdrantPoint<'_>> = batch
                .iter()
                .map(|chunk| QdrantPoint {
                    id: Self::point_id(document_name, chunk.chunk_index),
                    vector: &chunk.embedding,
                    payload: chunk,
                })
                .collect();

            self.client
                .put(&url)
                .json(&json!({ "points": points }))
                .send()
                .await
                .context("failed to contact qdrant during upsert")?
                .error_for_status()
                .context("qdrant upsert returned non-success status")?;
        }

        Ok(())
    }

    async fn search_inner(
        &self,
        vector: &[f32],
        limit: usize,
        filter: &QueryFilter,
    ) -> AnyResult<Vec<ScoredChunk>> {
        if vector.is_empty() || limit == 0 {
            return Ok(vec![]);
        }

        let mut body = json!({
            "vector": vector,
            "limit": limit,
            "with_payload": true,
        });
        if let Some(doc_type) = filter.document_type {
            body["filter"] = json!({
                "must": [{ "key": "document_type", "match": { "value": doc_type.as_str() } }]
            });
        }
        if let Some(min) = filter.min_score {
            body["score_threshold"] = json!(min);
        }

        let url = format!("{}/points/search", self.collection_url());
        let response = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .context("failed to contact qdrant during search")?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(vec![]);
        }

        let response = response
            .error_for_status()
            .context("qdrant search returned non-success status")?
            .json::<QdrantSearchResponse>()
            .await
            .context("failed to decode qdrant search response")?;

        let mut hits: Vec<ScoredChunk> = response
            .result
            .into_iter()
            .filter_map(|point| {
                Some(ScoredChunk {
                    chunk: point.payload?,
                    score: point.score,
                })
            })
            .collect();
        hits.sort_by(rank_order);
        Ok(hits)
    }

    async fn count_inner(&self, document_name: &str) -> AnyResult<usize> {
        let url = format!("{}/points/count", self.collection_url());
        let response = self
            .client
            .post(url)
            .json(&json!({
                "filter": document_filter(document_name),
                "exact": true,
            }))
            .send()
            .await
            .context("failed to contact qdrant during count")?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(0);
        }

        let response = response
            .error_for_status()
            .context("qdrant count returned non-success status")?
            .json::<QdrantCountResponse>()
            .await
            .context("failed to decode qdrant count response")?;
        Ok(response.result.count)
    }
}

fn document_filter(document_name: &str) -> Value {
    json!({
        "must": [{ "key": "document_name", "match": { "value": document_name } }]
    })
}

fn qdrant_err(err: anyhow::Error) -> GloveboxError {
    GloveboxError::vector_store(BACKEND, format!("{err:#}"))
}

#[async_trait]
impl VectorBackend for QdrantBackend {
    fn name(&self) -> &'static str {
        BACKEND
    }

    async fn upsert(&self, document_name: &str, chunks: &[DocumentChunk]) -> Result<()> {
        self.upsert_inner(document_name, chunks)
            .await
            .map_err(qdrant_err)
    }

    async fn delete_document(&self, document_name: &str) -> Result<()> {
        self.delete_inner(document_name).await.map_err(qdrant_err)
    }

    async fn query(
        &self,
        vector: &[f32],
        limit: usize,
        filter: &QueryFilter,
    ) -> Result<Vec<ScoredChunk>> {
        self.search_inner(vector, limit, filter)
            .await
            .map_err(qdrant_err)
    }

    async fn count_document(&self, document_name: &str) -> Result<usize> {
        self.count_inner(document_name).await.map_err(qdrant_err)
    }

    async fn ping(&self) -> Result<()> {
        self.client
            .get(format!("{}/collections", self.base_url))
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|err| GloveboxError::vector_store(BACKEND, err))?;
        Ok(())
    }
}
