use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::sync::Semaphore;

use crate::chat::ChatService;
use crate::config::AppConfig;
use crate::db::Database;
use crate::embedder::{build_embedder, Embedder};
use crate::feedback::ExpertFeedback;
use crate::ingest::Ingestor;
use crate::ollama::OllamaClient;
use crate::page_images::PageImages;
use crate::retrieval::{Retriever, Scoring};
use crate::router::KeywordRouter;
use crate::session::SessionStore;
use crate::synthesizer::{AnswerSynthesizer, OllamaChatModel};
use crate::vector_store::{BackendHealth, VectorStore};

/// Every long-lived handle, built once per process and cloned into tasks.
#[derive(Clone)]
pub struct Services {
    pub config: AppConfig,
    pub db: Database,
    pub embedder: Arc<dyn Embedder>,
    pub store: VectorStore,
    pub pages: PageImages,
    pub retriever: Retriever,
    pub sessions: SessionStore,
    pub chat: ChatService,
    pub ingestor: Ingestor,
    pub ollama: OllamaClient,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub ok: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub sqlite: ComponentHealth,
    pub vector_backends: Vec<BackendHealth>,
    pub ollama: ComponentHealth,
    pub embedding_model: String,
    pub answer_model: String,
}

impl Services {
    pub async fn build(config: AppConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir)
            .await
            .with_context(|| format!("failed creating {}", config.data_dir.display()))?;
        tokio::fs::create_dir_all(&config.docs_dir)
            .await
            .with_context(|| format!("failed creating {}", config.docs_dir.display()))?;

        let db = Database::new(&config).await?;
        let embedder = build_embedder(&config);
        let store = VectorStore::from_config(&config, &db);
        let pages = PageImages::new(config.page_image_dir());
        let ollama = OllamaClient::new(config.ollama_base_url.clone());

        let retriever = Retriever::new(
            store.clone(),
            embedder.clone(),
            pages.clone(),
            config.retrieval.oversample,
            Scoring::from_config(&config.retrieval),
            config.timeouts.embedding,
        );

        let generation_limit = Arc::new(Semaphore::new(config.max_concurrent_generations));
        let model = Arc::new(OllamaChatModel::new(
            ollama.clone(),
            config.models.answer_model.clone(),
        ));
        let synthesizer = AnswerSynthesizer::new(&config, model, generation_limit);

        let sessions = SessionStore::new(&db, config.session_ttl_secs, config.timeouts.session);
        let chat = ChatService::new(
            retriever.clone(),
            Arc::new(KeywordRouter::new()),
            synthesizer,
            sessions.clone(),
            ExpertFeedback::new(db.clone()),
            config.retrieval.default_k,
        );

        let ingestor = Ingestor::new(
            config.clone(),
            db.clone(),
            embedder.clone(),
            store.clone(),
            pages.clone(),
        );

        tracing::info!(
            embedder = embedder.model_id(),
            dimension = embedder.dimension(),
            qdrant = store.has_index(),
            "services ready"
        );

        Ok(Self {
            config,
            db,
            embedder,
            store,
            pages,
            retriever,
            sessions,
            chat,
            ingestor,
            ollama,
        })
    }

    pub async fn health(&self) -> HealthReport {
        let sqlite = component(self.db.ping().await);
        let vector_backends = self.store.health().await;
        let ollama = component(self.ollama.ping().await);

        let healthy = sqlite.ok && ollama.ok && vector_backends.iter().all(|b| b.ok);
        HealthReport {
            status: if healthy { "ok" } else { "degraded" },
            sqlite,
            vector_backends,
            ollama,
            embedding_model: self.embedder.model_id().to_string(),
            answer_model: self.chat.model_id().to_string(),
        }
    }
}

fn component(result: Result<()>) -> ComponentHealth {
    match result {
        Ok(()) => ComponentHealth { ok: true, error: None },
        Err(err) => ComponentHealth {
            ok: false,
            error: Some(format!("{err:#}")),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EmbeddingBackend, QueryBackend};

    #[tokio::test]
    async fn health_reports_unreachable_model_server_as_degraded() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::from_env();
        config.data_dir = dir.path().to_path_buf();
        config.docs_dir = dir.path().join("docs");
        config.ollama_base_url = "http://127.0.0.1:9".to_string();
        config.models.embedding_backend = EmbeddingBackend::Hashing;
        config.retrieval.use_qdrant = false;
        config.retrieval.query_backend = QueryBackend::Sqlite;

        let services = Services::build(config).await.unwrap();
        let report = services.health().await;

        assert_eq!(report.status, "degraded");
        assert!(report.sqlite.ok);
        assert!(!report.ollama.ok);
        assert_eq!(report.vector_backends.len(), 1);
        assert!(report.vector_backends[0].ok);
        assert!(report.embedding_model.starts_with("hashing-"));
    }
}
