use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post};
use axum::Router;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::app::{HealthReport, Services};
use crate::error::GloveboxError;
use crate::feedback::FeedbackStats;
use crate::ingest::ReconcileReport;
use crate::models::{
    AskRequest, AskResponse, ChatRequest, ChatResponse, DocumentListing, DocumentType,
    FeedbackRequest, IngestRequest, IngestStatus, SearchRequest, SearchResponse, UploadResponse,
};
use crate::page_images::{ImageVariant, PageImages};
use crate::router::ExpertKind;

#[derive(Clone)]
struct AppState {
    services: Services,
    jobs: Arc<Mutex<HashMap<String, IngestStatus>>>,
}

pub async fn run_server(services: Services) -> Result<()> {
    let addr: SocketAddr = services.config.bind_addr.parse()?;
    let app = router(services);

    tracing::info!("listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

pub fn router(services: Services) -> Router {
    // Multipart framing rides on top of the file itself.
    let body_limit = services.config.max_upload_bytes + 1024 * 1024;
    let state = AppState {
        services,
        jobs: Arc::new(Mutex::new(HashMap::new())),
    };

    Router::new()
        .route("/api/documents", post(upload_document).get(list_documents))
        .route("/api/documents/reconcile", post(reconcile_documents))
        .route("/api/documents/:name", delete(delete_document))
        .route("/api/ingest/:job_id", get(get_ingest_status))
        .route("/api/search", post(search_handler))
        .route("/api/ask", post(ask_handler))
        .route("/api/chat", post(chat_handler))
        .route("/api/chat/:session_id", delete(clear_session))
        .route("/api/experts", get(list_experts))
        .route("/api/experts/stats", get(expert_stats))
        .route("/api/experts/feedback", post(expert_feedback))
        .route("/api/pages/:slug/:page/:variant", get(page_image))
        .route("/api/health", get(health))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn upload_document(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    let config = &state.services.config;
    let mut upload: Option<(String, Vec<u8>)> = None;
    let mut document_type: Option<DocumentType> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::bad_request(format!("invalid multipart body: {err}")))?
    {
        let field_name = field.name().unwrap_or_default().to_string();
        match field_name.as_str() {
            "file" => {
                let file_name = field.file_name().unwrap_or_default().to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|err| ApiError::bad_request(format!("failed reading upload: {err}")))?;
                upload = Some((file_name, bytes.to_vec()));
            }
            "document_type" => {
                let value = field
                    .text()
                    .await
                    .map_err(|err| ApiError::bad_request(format!("invalid document_type: {err}")))?;
                if !value.trim().is_empty() {
                    document_type = Some(DocumentType::from_db(value.trim()));
                }
            }
            _ => {}
        }
    }

    let Some((file_name, bytes)) = upload else {
        return Err(ApiError::bad_request("missing `file` field".to_string()));
    };
    let document_name = validate_upload(&file_name, &bytes, config.max_upload_bytes)?;
    let document_type =
        document_type.unwrap_or_else(|| DocumentType::guess_from_filename(&document_name));

    tokio::fs::create_dir_all(&config.docs_dir).await?;
    let path = config.docs_dir.join(&document_name);
    tokio::fs::write(&path, &bytes).await?;

    let job_id = Uuid::new_v4().to_string();
    let now = Utc::now();
    let initial = IngestStatus {
        job_id: job_id.clone(),
        document_name: document_name.clone(),
        status: "queued".to_string(),
        stage: "queued".to_string(),
        message: None,
        chunk_count: 0,
        page_count: 0,
        started_at: now,
        updated_at: now,
    };
    {
        let mut jobs = state
            .jobs
            .lock()
            .map_err(|_| ApiError::from(anyhow::anyhow!("lock poisoned")))?;
        jobs.insert(job_id.clone(), initial.clone());
    }
    state.services.db.upsert_ingest_status(&initial).await?;

    let request = IngestRequest {
        path: path.display().to_string(),
        document_name: Some(document_name.clone()),
        document_type: Some(document_type),
        rebuild: false,
    };
    let state_for_task = state.clone();
    let job_id_for_task = job_id.clone();
    tokio::spawn(async move {
        let jobs = state_for_task.jobs.clone();
        let callback = |status: IngestStatus| track_job(&jobs, status);

        // Failures are already recorded on the job and the document.
        if let Err(err) = state_for_task
            .services
            .ingestor
            .ingest(&job_id_for_task, request, callback)
            .await
        {
            tracing::error!("ingest job {} failed: {:#}", job_id_for_task, err);
        }
    });

    Ok(Json(UploadResponse {
        accepted: true,
        document_name,
        job_id: Some(job_id),
        message: "Upload accepted; ingestion started.".to_string(),
    }))
}

/// Keeps live jobs in memory; finished jobs are served from the database.
fn track_job(jobs: &Mutex<HashMap<String, IngestStatus>>, status: IngestStatus) {
    let Ok(mut guard) = jobs.lock() else {
        return;
    };
    if matches!(status.status.as_str(), "completed" | "failed") {
        guard.remove(&status.job_id);
    } else {
        guard.insert(status.job_id.clone(), status);
    }
}

/// Checks extension, size and PDF magic; returns the sanitized file name.
fn validate_upload(file_name: &str, bytes: &[u8], max_bytes: usize) -> Result<String, ApiError> {
    let name = sanitize_filename(file_name);
    if !name.to_ascii_lowercase().ends_with(".pdf") || name.len() <= ".pdf".len() {
        return Err(ApiError::bad_request(
            "only PDF files are accepted".to_string(),
        ));
    }
    if bytes.len() > max_bytes {
        return Err(ApiError {
            status: StatusCode::PAYLOAD_TOO_LARGE,
            message: format!(
                "file is {} bytes; the limit is {} bytes",
                bytes.len(),
                max_bytes
            ),
        });
    }
    if !bytes.starts_with(b"%PDF") {
        return Err(ApiError::bad_request(
            "file content is not a PDF".to_string(),
        ));
    }
    Ok(name)
}

/// Base name only, with anything outside `[A-Za-z0-9._ -]` replaced.
fn sanitize_filename(file_name: &str) -> String {
    let base = file_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | ' ') {
                c
            } else {
                '_'
            }
        })
        .collect();
    cleaned.trim_start_matches('.').to_string()
}

async fn list_documents(
    State(state): State<AppState>,
) -> Result<Json<Vec<DocumentListing>>, ApiError> {
    Ok(Json(state.services.ingestor.listings().await?))
}

async fn delete_document(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if state.services.ingestor.delete_document(&name).await? {
        Ok(Json(json!({ "deleted": true, "document_name": name })))
    } else {
        Err(GloveboxError::NotFound(format!("document {name}")).into())
    }
}

async fn reconcile_documents(
    State(state): State<AppState>,
) -> Result<Json<ReconcileReport>, ApiError> {
    if !state.services.store.has_index() {
        return Err(ApiError::bad_request(
            "no vector index is configured".to_string(),
        ));
    }
    Ok(Json(state.services.ingestor.reconcile().await?))
}

async fn get_ingest_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<IngestStatus>, ApiError> {
    if let Some(status) = state
        .jobs
        .lock()
        .map_err(|_| ApiError::from(anyhow::anyhow!("lock poisoned")))?
        .get(&job_id)
        .cloned()
    {
        return Ok(Json(status));
    }

    match state.services.db.get_ingest_status(&job_id).await? {
        Some(status) => Ok(Json(status)),
        None => Err(GloveboxError::NotFound(format!("ingest job {job_id}")).into()),
    }
}

async fn search_handler(
    State(state): State<AppState>,
    Json(request): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, ApiError> {
    let chat = state.services.chat.clone();
    detached(async move { chat.search(request).await }).await
}

async fn ask_handler(
    State(state): State<AppState>,
    Json(request): Json<AskRequest>,
) -> Result<Json<AskResponse>, ApiError> {
    let chat = state.services.chat.clone();
    detached(async move { chat.ask(request).await }).await
}

async fn chat_handler(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    let chat = state.services.chat.clone();
    detached(async move { chat.chat(request).await }).await
}

/// Runs a query pipeline on its own task so a dropped request lets
/// in-flight model and store calls finish.
async fn detached<T, F>(pipeline: F) -> Result<Json<T>, ApiError>
where
    T: Send + 'static,
    F: Future<Output = crate::error::Result<T>> + Send + 'static,
{
    let result = tokio::spawn(pipeline)
        .await
        .map_err(|err| ApiError::from(anyhow::anyhow!("pipeline task failed: {err}")))?;
    Ok(Json(result?))
}

async fn clear_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let cleared = state.services.chat.clear_session(&session_id).await?;
    Ok(Json(json!({ "session_id": session_id, "cleared": cleared })))
}

async fn list_experts() -> Json<Value> {
    let experts: Vec<Value> = ExpertKind::ALL
        .iter()
        .map(|kind| {
            let profile = kind.profile();
            json!({
                "expert": kind,
                "name": profile.name,
                "description": profile.description,
                "keywords": profile.keywords,
            })
        })
        .collect();
    Json(json!({ "experts": experts }))
}

async fn expert_stats(State(state): State<AppState>) -> Result<Json<FeedbackStats>, ApiError> {
    Ok(Json(state.services.chat.feedback().stats().await?))
}

async fn expert_feedback(
    State(state): State<AppState>,
    Json(request): Json<FeedbackRequest>,
) -> Result<Json<Value>, ApiError> {
    let recorded = state
        .services
        .chat
        .feedback()
        .record_feedback(&request.response_id, request.helpful, request.comment.as_deref())
        .await?;

    match recorded {
        Some(expert) => Ok(Json(json!({
            "recorded": true,
            "response_id": request.response_id,
            "expert": expert,
        }))),
        None => Err(GloveboxError::NotFound(format!("response {}", request.response_id)).into()),
    }
}

#[derive(Debug, Default, Deserialize)]
struct HighlightQuery {
    #[serde(default)]
    terms: Option<String>,
}

async fn page_image(
    State(state): State<AppState>,
    Path((slug, page, variant)): Path<(String, i64, String)>,
    Query(query): Query<HighlightQuery>,
) -> Result<Response, ApiError> {
    let Some(variant) = ImageVariant::parse(&variant) else {
        return Err(ApiError::bad_request(format!(
            "unknown image variant: {}",
            variant
        )));
    };
    let terms = split_terms(query.terms.as_deref());

    let path = if variant == ImageVariant::Highlighted && !terms.is_empty() {
        let document = state
            .services
            .db
            .list_documents()
            .await?
            .into_iter()
            .find(|doc| PageImages::slug(&doc.document_name) == slug)
            .ok_or_else(|| GloveboxError::NotFound(format!("document for {slug}")))?;
        state
            .services
            .pages
            .highlighted(&slug, page, std::path::Path::new(&document.file_path), &terms)
            .await?
    } else {
        state.services.pages.variant_path(&slug, page, variant)
    };
    let Some(path) = path else {
        return Err(GloveboxError::NotFound(format!("image for {slug} page {page}")).into());
    };

    let bytes = tokio::fs::read(&path).await?;
    Ok(([(header::CONTENT_TYPE, "image/png")], bytes).into_response())
}

/// Comma-separated terms from a highlighted locator.
fn split_terms(raw: Option<&str>) -> Vec<String> {
    raw.unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .map(str::to_string)
        .collect()
}

async fn health(State(state): State<AppState>) -> Json<HealthReport> {
    Json(state.services.health().await)
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: String) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message,
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(value: anyhow::Error) -> Self {
        // Typed pipeline errors keep their status through anyhow plumbing.
        match value.downcast::<GloveboxError>() {
            Ok(err) => err.into(),
            Err(value) => Self {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                message: format!("{value:#}"),
            },
        }
    }
}

impl From<GloveboxError> for ApiError {
    fn from(value: GloveboxError) -> Self {
        let status = match &value {
            GloveboxError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            GloveboxError::NotFound(_) => StatusCode::NOT_FOUND,
            GloveboxError::Timeout { .. } | GloveboxError::Session(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: value.to_string(),
        }
    }
}

impl From<std::io::Error> for ApiError {
    fn from(value: std::io::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: value.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let body = json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}
