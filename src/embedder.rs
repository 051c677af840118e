use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{AppConfig, EmbeddingBackend};
use crate::error::{GloveboxError, Result};
use crate::ollama::OllamaClient;

/// Text to fixed-dimension vector. One model per store: vectors from
/// different `model_id`s must never be compared.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn model_id(&self) -> &str;

    fn dimension(&self) -> usize;

    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Per-item results so one bad input does not poison the batch.
    async fn embed_batch(&self, texts: &[String]) -> Vec<Result<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await);
        }
        out
    }
}

pub fn build_embedder(config: &AppConfig) -> Arc<dyn Embedder> {
    match config.models.embedding_backend {
        EmbeddingBackend::Hashing => Arc::new(HashingEmbedder::new(config.models.embedding_dim)),
        EmbeddingBackend::Ollama => Arc::new(OllamaEmbedder::new(
            OllamaClient::new(config.ollama_base_url.clone()),
            config.models.embedding_model.clone(),
            config.models.embedding_dim,
        )),
    }
}

pub struct OllamaEmbedder {
    client: OllamaClient,
    model: String,
    dimension: usize,
}

impl OllamaEmbedder {
    pub fn new(client: OllamaClient, model: impl Into<String>, dimension: usize) -> Self {
        Self {
            client,
            model: model.into(),
            dimension,
        }
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if text.trim().is_empty() {
            return Err(GloveboxError::InvalidInput(
                "cannot embed empty text".to_string(),
            ));
        }

        let mut vector = self
            .client
            .embed(&self.model, text)
            .await
            .map_err(|err| GloveboxError::embedding("ollama", format!("{err:#}")))?;

        if vector.len() != self.dimension {
            return Err(GloveboxError::embedding(
                "ollama",
                format!(
                    "model {} returned {} dimensions, expected {}",
                    self.model,
                    vector.len(),
                    self.dimension
                ),
            ));
        }

        normalize(&mut vector);
        Ok(vector)
    }
}

/// Feature-hashing bag of words. Deterministic and offline; used for tests
/// and air-gapped installs where no embedding server is reachable.
pub struct HashingEmbedder {
    dimension: usize,
    model_id: String,
}

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "do", "does", "for", "from", "how", "i",
    "in", "is", "it", "my", "of", "on", "or", "should", "that", "the", "this", "to", "what",
    "when", "where", "which", "with", "you", "your",
];

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        let dimension = dimension.max(8);
        Self {
            dimension,
            model_id: format!("hashing-{dimension}"),
        }
    }

    pub fn embed_sync(&self, text: &str) -> Result<Vec<f32>> {
        let mut vector = vec![0.0f32; self.dimension];
        let mut seen = 0usize;

        for token in hash_tokens(text) {
            let hash = fnv1a(token.as_bytes());
            let idx = (hash % self.dimension as u64) as usize;
            let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
            vector[idx] += sign;
            seen += 1;
        }

        if seen == 0 {
            return Err(GloveboxError::InvalidInput(
                "cannot embed text without indexable terms".to_string(),
            ));
        }

        normalize(&mut vector);
        Ok(vector)
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_sync(text)
    }
}

fn hash_tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|raw| !raw.is_empty())
        .map(|raw| raw.to_lowercase())
        .filter(|token| !STOPWORDS.contains(&token.as_str()))
        .map(|token| {
            if token.len() > 3 && token.ends_with('s') && !token.ends_with("ss") {
                token[..token.len() - 1].to_string()
            } else {
                token
            }
        })
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

pub fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for value in vector.iter_mut() {
            *value /= norm;
        }
    }
}

/// Cosine similarity; zero for mismatched lengths or zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a <= f32::EPSILON || norm_b <= f32::EPSILON {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hashing_embedder_is_deterministic_and_unit_length() {
        let embedder = HashingEmbedder::new(256);
        let a = embedder.embed("Check the brake fluid level").await.unwrap();
        let b = embedder.embed("Check the brake fluid level").await.unwrap();

        assert_eq!(a, b);
        assert_eq!(a.len(), 256);
        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[tokio::test]
    async fn related_text_scores_above_unrelated_text() {
        let embedder = HashingEmbedder::new(1024);
        let query = embedder.embed("brake fluid").await.unwrap();
        let related = embedder
            .embed("Inspect the brake fluid reservoir; brake fluids absorb moisture.")
            .await
            .unwrap();
        let unrelated = embedder
            .embed("Pair your phone over Bluetooth from the audio menu.")
            .await
            .unwrap();

        assert!(cosine_similarity(&query, &related) > cosine_similarity(&query, &unrelated));
    }

    #[tokio::test]
    async fn stopword_only_text_is_rejected() {
        let embedder = HashingEmbedder::new(64);
        assert!(embedder.embed("  ").await.is_err());
        assert!(embedder.embed("what is the").await.is_err());
    }

    #[tokio::test]
    async fn batch_keeps_per_item_failures() {
        let embedder = HashingEmbedder::new(64);
        let results = embedder
            .embed_batch(&["tire pressure".to_string(), "".to_string()])
            .await;
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
    }

    #[test]
    fn cosine_handles_degenerate_inputs() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert!((cosine_similarity(&[1.0, 0.0], &[2.0, 0.0]) - 1.0).abs() < 1e-6);
    }
}
