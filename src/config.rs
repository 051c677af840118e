use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EmbeddingBackend {
    Ollama,
    Hashing,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryBackend {
    Sqlite,
    Qdrant,
}

#[derive(Clone, Debug)]
pub struct ModelConfig {
    pub answer_model: String,
    pub embedding_model: String,
    pub embedding_backend: EmbeddingBackend,
    pub embedding_dim: usize,
}

#[derive(Clone, Debug)]
pub struct TokenConfig {
    pub max_context_tokens: usize,
    pub max_output_tokens: usize,
    pub chunk_target_tokens: usize,
    pub chunk_overlap_tokens: usize,
    pub history_token_budget: usize,
}

#[derive(Clone, Debug)]
pub struct RetrievalConfig {
    pub default_k: usize,
    pub oversample: usize,
    pub min_similarity: f32,
    /// Blend weights for ranking; the similarity floor applies to the
    /// semantic score alone.
    pub semantic_weight: f32,
    pub keyword_weight: f32,
    pub use_qdrant: bool,
    pub query_backend: QueryBackend,
}

#[derive(Clone, Debug)]
pub struct TimeoutConfig {
    pub embedding: Duration,
    pub vector_store: Duration,
    pub generation: Duration,
    pub session: Duration,
}

/// Stand-in for the vehicle record; expert prompts are filled from it.
#[derive(Clone, Debug)]
pub struct VehicleProfile {
    pub year: String,
    pub make: String,
    pub model: String,
    pub trim: String,
    pub vin: String,
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub bind_addr: String,
    pub data_dir: PathBuf,
    pub docs_dir: PathBuf,
    pub ollama_base_url: String,
    pub qdrant_base_url: String,
    pub qdrant_collection: String,
    pub models: ModelConfig,
    pub tokens: TokenConfig,
    pub retrieval: RetrievalConfig,
    pub timeouts: TimeoutConfig,
    pub vehicle: VehicleProfile,
    pub session_ttl_secs: i64,
    pub max_upload_bytes: usize,
    pub max_concurrent_ingestions: usize,
    pub max_concurrent_generations: usize,
    pub session_purge_interval: Duration,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let data_dir = env::var("GLOVEBOX_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data"));
        let docs_dir = env::var("GLOVEBOX_DOCS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("docs"));

        Self {
            bind_addr: env::var("GLOVEBOX_BIND").unwrap_or_else(|_| "127.0.0.1:8080".to_string()),
            data_dir,
            docs_dir,
            ollama_base_url: env::var("OLLAMA_BASE_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:11434".to_string()),
            qdrant_base_url: env::var("QDRANT_BASE_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:6333".to_string()),
            qdrant_collection: env::var("QDRANT_COLLECTION")
                .unwrap_or_else(|_| "document_chunks".to_string()),
            models: ModelConfig {
                answer_model: env::var("ANSWER_MODEL")
                    .unwrap_or_else(|_| "qwen2.5:7b-instruct".to_string()),
                embedding_model: env::var("EMBEDDING_MODEL")
                    .unwrap_or_else(|_| "all-minilm".to_string()),
                embedding_backend: match env::var("EMBEDDING_BACKEND")
                    .unwrap_or_default()
                    .to_ascii_lowercase()
                    .as_str()
                {
                    "hashing" => EmbeddingBackend::Hashing,
                    _ => EmbeddingBackend::Ollama,
                },
                embedding_dim: env_parse("EMBEDDING_DIM", 384),
            },
            tokens: TokenConfig {
                max_context_tokens: env_parse("MAX_CONTEXT_TOKENS", 2_400),
                max_output_tokens: env_parse("MAX_OUTPUT_TOKENS", 600),
                chunk_target_tokens: env_parse("CHUNK_TARGET_TOKENS", 180),
                chunk_overlap_tokens: env_parse("CHUNK_OVERLAP_TOKENS", 36),
                history_token_budget: env_parse("HISTORY_TOKEN_BUDGET", 1_200),
            },
            retrieval: RetrievalConfig {
                default_k: env_parse("RETRIEVAL_K", 3),
                oversample: env_parse("RETRIEVAL_OVERSAMPLE", 4),
                min_similarity: env_parse("MIN_SIMILARITY", 0.2),
                semantic_weight: env_parse("SEMANTIC_WEIGHT", 0.7),
                keyword_weight: env_parse("KEYWORD_WEIGHT", 0.3),
                use_qdrant: env_parse("USE_QDRANT", false),
                query_backend: match env::var("VECTOR_QUERY_BACKEND")
                    .unwrap_or_default()
                    .to_ascii_lowercase()
                    .as_str()
                {
                    "qdrant" => QueryBackend::Qdrant,
                    _ => QueryBackend::Sqlite,
                },
            },
            timeouts: TimeoutConfig {
                embedding: Duration::from_millis(env_parse("EMBED_TIMEOUT_MS", 10_000)),
                vector_store: Duration::from_millis(env_parse("VECTOR_TIMEOUT_MS", 5_000)),
                generation: Duration::from_millis(env_parse("GENERATION_TIMEOUT_MS", 60_000)),
                session: Duration::from_millis(env_parse("SESSION_TIMEOUT_MS", 2_000)),
            },
            vehicle: VehicleProfile {
                year: env::var("VEHICLE_YEAR").unwrap_or_else(|_| "2018".to_string()),
                make: env::var("VEHICLE_MAKE").unwrap_or_else(|_| "Toyota".to_string()),
                model: env::var("VEHICLE_MODEL").unwrap_or_else(|_| "4Runner".to_string()),
                trim: env::var("VEHICLE_TRIM").unwrap_or_else(|_| "SR5 Premium".to_string()),
                vin: env::var("VEHICLE_VIN").unwrap_or_default(),
            },
            session_ttl_secs: env_parse("SESSION_TTL_SECS", 86_400),
            max_upload_bytes: env_parse("MAX_UPLOAD_BYTES", 50 * 1024 * 1024),
            max_concurrent_ingestions: env_parse("MAX_CONCURRENT_INGESTIONS", 2),
            max_concurrent_generations: env_parse::<usize>("MAX_CONCURRENT_GENERATIONS", 1).max(1),
            session_purge_interval: Duration::from_secs(env_parse(
                "SESSION_PURGE_INTERVAL_SECS",
                900,
            )),
        }
    }

    pub fn page_image_dir(&self) -> PathBuf {
        self.data_dir.join("page_images")
    }

    pub fn sqlite_dsn(&self) -> String {
        format!("sqlite://{}", self.data_dir.join("glovebox.sqlite3").display())
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}
