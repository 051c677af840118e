use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::router::{ExpertKind, QueryIntent};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    Manual,
    QuickReference,
    Receipt,
    Other,
}

impl DocumentType {
    pub fn as_str(self) -> &'static str {
        match self {
            DocumentType::Manual => "manual",
            DocumentType::QuickReference => "quick_reference",
            DocumentType::Receipt => "receipt",
            DocumentType::Other => "other",
        }
    }

    pub fn from_db(value: &str) -> Self {
        match value {
            "manual" => DocumentType::Manual,
            "quick_reference" | "qrg" => DocumentType::QuickReference,
            "receipt" | "maintenance_report" => DocumentType::Receipt,
            _ => DocumentType::Other,
        }
    }

    pub fn guess_from_filename(filename: &str) -> Self {
        let lower = filename.to_ascii_lowercase();
        if lower.contains("qrg") || lower.contains("quick") {
            DocumentType::QuickReference
        } else if lower.contains("receipt")
            || lower.contains("invoice")
            || lower.contains("maintenance")
        {
            DocumentType::Receipt
        } else if lower.contains("manual") || lower.contains("owner") {
            DocumentType::Manual
        } else {
            DocumentType::Other
        }
    }
}

/// One indexed span of a document.
///
/// `embedding` is populated on the ingestion path; chunks read back from a
/// similarity query leave it empty since callers only need the score.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentChunk {
    pub document_name: String,
    pub document_type: DocumentType,
    pub chunk_index: i64,
    pub content: String,
    pub page_number: Option<i64>,
    pub token_count: i64,
    pub chapter: Option<String>,
    pub section: Option<String>,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(skip)]
    pub embedding: Vec<f32>,
    pub created_at: DateTime<Utc>,
}

/// Chunker output, before a document name and embedding are attached.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkDraft {
    pub chunk_index: i64,
    pub content: String,
    pub page_number: Option<i64>,
    pub token_count: i64,
    pub chapter: Option<String>,
    pub section: Option<String>,
    pub topics: Vec<String>,
}

impl ChunkDraft {
    pub fn into_chunk(
        self,
        document_name: &str,
        document_type: DocumentType,
        embedding: Vec<f32>,
        created_at: DateTime<Utc>,
    ) -> DocumentChunk {
        DocumentChunk {
            document_name: document_name.to_string(),
            document_type,
            chunk_index: self.chunk_index,
            content: self.content,
            page_number: self.page_number,
            token_count: self.token_count,
            chapter: self.chapter,
            section: self.section,
            topics: self.topics,
            embedding,
            created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceReference {
    pub document: String,
    pub page: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chapter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub topics: Vec<String>,
    pub relevance: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fullsize_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub highlighted_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RetrievalHit {
    pub chunk: DocumentChunk,
    pub score: f32,
    pub source: SourceReference,
}

#[derive(Debug, Clone)]
pub struct RetrievalResult {
    pub hits: Vec<RetrievalHit>,
    pub query_vector: Vec<f32>,
    pub k: usize,
    pub degraded: Option<String>,
}

impl RetrievalResult {
    pub fn empty(k: usize) -> Self {
        Self {
            hits: vec![],
            query_vector: vec![],
            k,
            degraded: None,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.is_some()
    }

    pub fn sources(&self) -> Vec<SourceReference> {
        self.hits.iter().map(|hit| hit.source.clone()).collect()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn from_db(value: &str) -> Self {
        match value {
            "assistant" => Role::Assistant,
            _ => Role::User,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<SourceReference>,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            sources: vec![],
        }
    }

    pub fn assistant(content: impl Into<String>, sources: Vec<SourceReference>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            sources,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IndexState {
    Pending,
    Indexed,
    Degraded,
    Failed,
}

impl IndexState {
    pub fn as_str(self) -> &'static str {
        match self {
            IndexState::Pending => "pending",
            IndexState::Indexed => "indexed",
            IndexState::Degraded => "degraded",
            IndexState::Failed => "failed",
        }
    }

    pub fn from_db(value: &str) -> Self {
        match value {
            "indexed" => IndexState::Indexed,
            "degraded" => IndexState::Degraded,
            "failed" => IndexState::Failed,
            _ => IndexState::Pending,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub document_name: String,
    pub document_type: DocumentType,
    pub file_path: String,
    pub content_hash: String,
    pub page_count: i64,
    pub chunk_count: i64,
    pub index_state: IndexState,
    pub message: Option<String>,
    pub ingested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentListing {
    pub document_name: String,
    pub document_type: DocumentType,
    pub chunk_count: i64,
    pub page_count: i64,
    pub index_state: IndexState,
    pub file_present: bool,
    pub message: Option<String>,
    pub ingested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestRequest {
    pub path: String,
    #[serde(default)]
    pub document_name: Option<String>,
    #[serde(default)]
    pub document_type: Option<DocumentType>,
    #[serde(default)]
    pub rebuild: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestStatus {
    pub job_id: String,
    pub document_name: String,
    pub status: String,
    pub stage: String,
    pub message: Option<String>,
    pub chunk_count: i64,
    pub page_count: i64,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResponse {
    pub accepted: bool,
    pub document_name: String,
    pub job_id: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default = "default_search_limit")]
    pub limit: usize,
    #[serde(default)]
    pub document_type: Option<DocumentType>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchPassage {
    pub document_name: String,
    pub page_number: Option<i64>,
    pub chapter: Option<String>,
    pub section: Option<String>,
    pub score: f32,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub results: Vec<SearchPassage>,
    pub degraded: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AskRequest {
    pub question: String,
    #[serde(default)]
    pub document_type: Option<DocumentType>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AskResponse {
    pub answer: String,
    pub sources: Vec<SourceReference>,
    #[serde(default)]
    pub key_terms: Vec<String>,
    pub model: String,
    pub expert: ExpertKind,
    pub response_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub message: String,
    pub sources: Vec<SourceReference>,
    /// Only set when the turn was stored under it, or echoed from the request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub model: String,
    pub query_intent: QueryIntent,
    pub expert: ExpertKind,
    pub response_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackRequest {
    pub response_id: String,
    pub helpful: bool,
    #[serde(default)]
    pub comment: Option<String>,
}

fn default_search_limit() -> usize {
    5
}
