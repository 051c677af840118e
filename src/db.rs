use std::str::FromStr;

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};

use crate::config::AppConfig;
use crate::models::{DocumentRecord, DocumentType, IndexState, IngestStatus};
use crate::router::{ExpertKind, QueryIntent};

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

#[derive(Debug, Clone)]
pub struct DecisionRecord {
    pub response_id: String,
    pub expert: ExpertKind,
    pub query_intent: Option<QueryIntent>,
    pub question: String,
}

#[derive(Debug, Clone, Default)]
pub struct ExpertCounts {
    pub total_queries: i64,
    pub positive_feedback: i64,
    pub negative_feedback: i64,
}

impl Database {
    pub async fn new(config: &AppConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir).await?;

        let options = SqliteConnectOptions::from_str(&config.sqlite_dsn())?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS store_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS document_chunks (
                document_name TEXT NOT NULL,
                chunk_index INTEGER NOT NULL,
                document_type TEXT NOT NULL,
                content TEXT NOT NULL,
                page_number INTEGER,
                token_count INTEGER NOT NULL,
                chapter TEXT,
                section TEXT,
                topics TEXT NOT NULL,
                embedding BLOB NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (document_name, chunk_index)
            );

            CREATE INDEX IF NOT EXISTS idx_chunks_document_type
                ON document_chunks (document_type);

            CREATE TABLE IF NOT EXISTS documents (
                document_name TEXT PRIMARY KEY,
                document_type TEXT NOT NULL,
                file_path TEXT NOT NULL,
                content_hash TEXT NOT NULL,
                page_count INTEGER NOT NULL,
                chunk_count INTEGER NOT NULL,
                index_state TEXT NOT NULL,
                message TEXT,
                ingested_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                created_at TEXT NOT NULL,
                last_active_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                sources TEXT NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS ingest_jobs (
                job_id TEXT PRIMARY KEY,
                document_name TEXT NOT NULL,
                status TEXT NOT NULL,
                stage TEXT NOT NULL,
                message TEXT,
                chunk_count INTEGER NOT NULL,
                page_count INTEGER NOT NULL,
                started_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS expert_decisions (
                response_id TEXT PRIMARY KEY,
                expert TEXT NOT NULL,
                query_intent TEXT,
                question TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS expert_feedback (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                response_id TEXT NOT NULL,
                expert TEXT NOT NULL,
                helpful INTEGER NOT NULL,
                comment TEXT,
                created_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn upsert_document(&self, record: &DocumentRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO documents (document_name, document_type, file_path, content_hash, page_count, chunk_count, index_state, message, ingested_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(document_name) DO UPDATE SET
                document_type = excluded.document_type,
                file_path = excluded.file_path,
                content_hash = excluded.content_hash,
                page_count = excluded.page_count,
                chunk_count = excluded.chunk_count,
                index_state = excluded.index_state,
                message = excluded.message,
                ingested_at = excluded.ingested_at
            "#,
        )
        .bind(&record.document_name)
        .bind(record.document_type.as_str())
        .bind(&record.file_path)
        .bind(&record.content_hash)
        .bind(record.page_count)
        .bind(record.chunk_count)
        .bind(record.index_state.as_str())
        .bind(&record.message)
        .bind(record.ingested_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn set_index_state(
        &self,
        document_name: &str,
        state: IndexState,
        message: Option<&str>,
    ) -> Result<()> {
        sqlx::query("UPDATE documents SET index_state = ?, message = ? WHERE document_name = ?")
            .bind(state.as_str())
            .bind(message)
            .bind(document_name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_document(&self, document_name: &str) -> Result<Option<DocumentRecord>> {
        let row = sqlx::query(
            r#"
            SELECT document_name, document_type, file_path, content_hash, page_count, chunk_count, index_state, message, ingested_at
            FROM documents
            WHERE document_name = ?
            "#,
        )
        .bind(document_name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(row_to_document))
    }

    pub async fn list_documents(&self) -> Result<Vec<DocumentRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT document_name, document_type, file_path, content_hash, page_count, chunk_count, index_state, message, ingested_at
            FROM documents
            ORDER BY document_name ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(row_to_document).collect())
    }

    pub async fn documents_in_state(&self, state: IndexState) -> Result<Vec<DocumentRecord>> {
        Ok(self
            .list_documents()
            .await?
            .into_iter()
            .filter(|doc| doc.index_state == state)
            .collect())
    }

    pub async fn delete_document(&self, document_name: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM documents WHERE document_name = ?")
            .bind(document_name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn upsert_ingest_status(&self, status: &IngestStatus) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ingest_jobs (job_id, document_name, status, stage, message, chunk_count, page_count, started_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(job_id) DO UPDATE SET
                status = excluded.status,
                stage = excluded.stage,
                message = excluded.message,
                chunk_count = excluded.chunk_count,
                page_count = excluded.page_count,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&status.job_id)
        .bind(&status.document_name)
        .bind(&status.status)
        .bind(&status.stage)
        .bind(&status.message)
        .bind(status.chunk_count)
        .bind(status.page_count)
        .bind(status.started_at.to_rfc3339())
        .bind(status.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_ingest_status(&self, job_id: &str) -> Result<Option<IngestStatus>> {
        let row = sqlx::query(
            r#"
            SELECT job_id, document_name, status, stage, message, chunk_count, page_count, started_at, updated_at
            FROM ingest_jobs
            WHERE job_id = ?
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| IngestStatus {
            job_id: r.get("job_id"),
            document_name: r.get("document_name"),
            status: r.get("status"),
            stage: r.get("stage"),
            message: r.get("message"),
            chunk_count: r.get("chunk_count"),
            page_count: r.get("page_count"),
            started_at: parse_timestamp(&r.get::<String, _>("started_at")),
            updated_at: parse_timestamp(&r.get::<String, _>("updated_at")),
        }))
    }

    pub async fn record_decision(&self, decision: &DecisionRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO expert_decisions (response_id, expert, query_intent, question, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&decision.response_id)
        .bind(decision.expert.as_str())
        .bind(decision.query_intent.map(|intent| intent.as_str()))
        .bind(&decision.question)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn decision_expert(&self, response_id: &str) -> Result<Option<ExpertKind>> {
        let row = sqlx::query("SELECT expert FROM expert_decisions WHERE response_id = ?")
            .bind(response_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.and_then(|r| ExpertKind::from_db(&r.get::<String, _>("expert"))))
    }

    pub async fn record_feedback(
        &self,
        response_id: &str,
        expert: ExpertKind,
        helpful: bool,
        comment: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO expert_feedback (response_id, expert, helpful, comment, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(response_id)
        .bind(expert.as_str())
        .bind(helpful)
        .bind(comment)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn expert_counts(&self, expert: ExpertKind) -> Result<ExpertCounts> {
        let total_queries: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM expert_decisions WHERE expert = ?")
                .bind(expert.as_str())
                .fetch_one(&self.pool)
                .await?;

        let row = sqlx::query(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN helpful = 1 THEN 1 ELSE 0 END), 0) AS positive,
                COALESCE(SUM(CASE WHEN helpful = 0 THEN 1 ELSE 0 END), 0) AS negative
            FROM expert_feedback
            WHERE expert = ?
            "#,
        )
        .bind(expert.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(ExpertCounts {
            total_queries,
            positive_feedback: row.get("positive"),
            negative_feedback: row.get("negative"),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn row_to_document(row: SqliteRow) -> DocumentRecord {
    DocumentRecord {
        document_name: row.get("document_name"),
        document_type: DocumentType::from_db(&row.get::<String, _>("document_type")),
        file_path: row.get("file_path"),
        content_hash: row.get("content_hash"),
        page_count: row.get("page_count"),
        chunk_count: row.get("chunk_count"),
        index_state: IndexState::from_db(&row.get::<String, _>("index_state")),
        message: row.get("message"),
        ingested_at: parse_timestamp(&row.get::<String, _>("ingested_at")),
    }
}

pub(crate) fn parse_timestamp(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
