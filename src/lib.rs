pub mod app;
pub mod chat;
pub mod chunker;
pub mod config;
pub mod db;
pub mod embedder;
pub mod error;
pub mod feedback;
pub mod ingest;
pub mod models;
pub mod ollama;
pub mod page_images;
pub mod retrieval;
pub mod router;
pub mod server;
pub mod session;
pub mod synthesizer;
pub mod vector_store;

pub use app::Services;
pub use config::AppConfig;
pub use error::GloveboxError;
pub use server::run_server;
