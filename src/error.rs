use std::future::Future;
use std::time::Duration;

use thiserror::Error;

/// Failures raised at the pipeline seams (ingestion, retrieval, generation, sessions).
///
/// Plumbing code (database access, HTTP clients, binaries) keeps using `anyhow`;
/// these variants exist so callers can tell which phase failed and pick the
/// matching fallback.
#[derive(Debug, Error)]
pub enum GloveboxError {
    #[error("ingestion failed for {document}: {message}")]
    Ingestion { document: String, message: String },

    #[error("embedding error ({provider}): {message}")]
    Embedding { provider: String, message: String },

    #[error("vector store error ({backend}): {message}")]
    VectorStore { backend: String, message: String },

    #[error("retrieval failed: {0}")]
    Retrieval(String),

    #[error("generation failed: {0}")]
    Generation(String),

    #[error("session store unavailable: {0}")]
    Session(String),

    #[error("{boundary} call timed out after {millis}ms")]
    Timeout { boundary: &'static str, millis: u64 },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl GloveboxError {
    pub fn vector_store(backend: &str, err: impl std::fmt::Display) -> Self {
        Self::VectorStore {
            backend: backend.to_string(),
            message: err.to_string(),
        }
    }

    pub fn embedding(provider: &str, err: impl std::fmt::Display) -> Self {
        Self::Embedding {
            provider: provider.to_string(),
            message: err.to_string(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, GloveboxError>;

/// Runs `fut` under an external-call deadline. The future is dropped on expiry,
/// so only wrap calls whose partial completion is harmless.
pub async fn bounded<T, F>(boundary: &'static str, limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(GloveboxError::Timeout {
            boundary,
            millis: limit.as_millis() as u64,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bounded_reports_timeout_with_boundary_name() {
        let err = bounded("generation", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, GloveboxError>(())
        })
        .await
        .unwrap_err();

        assert!(err.is_timeout());
        assert!(err.to_string().contains("generation"));
    }

    #[tokio::test]
    async fn bounded_passes_through_inner_errors() {
        let err = bounded("embedding", Duration::from_secs(1), async {
            Err::<(), _>(GloveboxError::InvalidInput("empty".to_string()))
        })
        .await
        .unwrap_err();

        assert!(matches!(err, GloveboxError::InvalidInput(_)));
    }
}
