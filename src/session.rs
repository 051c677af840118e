use std::time::Duration;

use chrono::Utc;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::db::Database;
use crate::error::{bounded, GloveboxError, Result};
use crate::models::{ChatMessage, Role};

/// Chat history keyed by opaque session id with a sliding inactivity window.
#[derive(Clone)]
pub struct SessionStore {
    pool: SqlitePool,
    ttl_secs: i64,
    timeout: Duration,
}

impl SessionStore {
    pub fn new(db: &Database, ttl_secs: i64, timeout: Duration) -> Self {
        Self {
            pool: db.pool().clone(),
            ttl_secs: ttl_secs.max(1),
            timeout,
        }
    }

    /// Appends to a live session, or starts a new one when `session_id` is
    /// absent, unknown or expired. Returns the id the message landed under.
    pub async fn append(&self, session_id: Option<&str>, message: &ChatMessage) -> Result<String> {
        bounded("session", self.timeout, self.append_inner(session_id, message)).await
    }

    pub async fn history(&self, session_id: &str) -> Result<Vec<ChatMessage>> {
        bounded("session", self.timeout, self.history_inner(session_id)).await
    }

    pub async fn clear(&self, session_id: &str) -> Result<bool> {
        bounded("session", self.timeout, async {
            let result = sqlx::query("DELETE FROM sessions WHERE id = ?")
                .bind(session_id)
                .execute(&self.pool)
                .await
                .map_err(session_err)?;
            Ok(result.rows_affected() > 0)
        })
        .await
    }

    pub async fn purge_expired(&self) -> Result<u64> {
        let cutoff = Utc::now().timestamp() - self.ttl_secs;
        let result = sqlx::query("DELETE FROM sessions WHERE last_active_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(session_err)?;
        Ok(result.rows_affected())
    }

    /// Purges expired sessions on a fixed cadence for the life of the process.
    pub fn spawn_purge_task(&self, every: Duration) -> tokio::task::JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every.max(Duration::from_millis(10)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match store.purge_expired().await {
                    Ok(0) => {}
                    Ok(purged) => tracing::info!(purged, "purged expired sessions"),
                    Err(err) => tracing::warn!(error = %err, "session purge failed"),
                }
            }
        })
    }

    async fn append_inner(&self, session_id: Option<&str>, message: &ChatMessage) -> Result<String> {
        let now = Utc::now();
        let cutoff = now.timestamp() - self.ttl_secs;
        let mut tx = self.pool.begin().await.map_err(session_err)?;

        let live_id = match session_id {
            Some(id) => {
                let last_active: Option<i64> =
                    sqlx::query_scalar("SELECT last_active_at FROM sessions WHERE id = ?")
                        .bind(id)
                        .fetch_optional(&mut *tx)
                        .await
                        .map_err(session_err)?;
                match last_active {
                    Some(ts) if ts >= cutoff => Some(id.to_string()),
                    Some(_) => {
                        sqlx::query("DELETE FROM sessions WHERE id = ?")
                            .bind(id)
                            .execute(&mut *tx)
                            .await
                            .map_err(session_err)?;
                        tracing::info!(session_id = id, "session expired; starting a new one");
                        None
                    }
                    None => None,
                }
            }
            None => None,
        };

        let id = match live_id {
            Some(id) => {
                sqlx::query("UPDATE sessions SET last_active_at = ? WHERE id = ?")
                    .bind(now.timestamp())
                    .bind(&id)
                    .execute(&mut *tx)
                    .await
                    .map_err(session_err)?;
                id
            }
            None => {
                let id = Uuid::new_v4().to_string();
                sqlx::query("INSERT INTO sessions (id, created_at, last_active_at) VALUES (?, ?, ?)")
                    .bind(&id)
                    .bind(now.to_rfc3339())
                    .bind(now.timestamp())
                    .execute(&mut *tx)
                    .await
                    .map_err(session_err)?;
                id
            }
        };

        let sources = serde_json::to_string(&message.sources)
            .map_err(|err| GloveboxError::Session(err.to_string()))?;
        sqlx::query(
            "INSERT INTO messages (session_id, role, content, sources, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(sources)
        .bind(now.to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(session_err)?;

        tx.commit().await.map_err(session_err)?;
        Ok(id)
    }

    async fn history_inner(&self, session_id: &str) -> Result<Vec<ChatMessage>> {
        let cutoff = Utc::now().timestamp() - self.ttl_secs;
        let last_active: Option<i64> =
            sqlx::query_scalar("SELECT last_active_at FROM sessions WHERE id = ?")
                .bind(session_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(session_err)?;

        match last_active {
            None => return Ok(vec![]),
            Some(ts) if ts < cutoff => {
                sqlx::query("DELETE FROM sessions WHERE id = ?")
                    .bind(session_id)
                    .execute(&self.pool)
                    .await
                    .map_err(session_err)?;
                return Ok(vec![]);
            }
            Some(_) => {}
        }

        let rows = sqlx::query(
            "SELECT role, content, sources FROM messages WHERE session_id = ? ORDER BY id ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .map_err(session_err)?;

        Ok(rows
            .into_iter()
            .map(|row| ChatMessage {
                role: Role::from_db(&row.get::<String, _>("role")),
                content: row.get("content"),
                sources: serde_json::from_str(&row.get::<String, _>("sources")).unwrap_or_default(),
            })
            .collect())
    }
}

fn session_err(err: sqlx::Error) -> GloveboxError {
    GloveboxError::Session(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::temp_database;
    use crate::models::SourceReference;

    fn store(db: &Database) -> SessionStore {
        SessionStore::new(db, 3_600, Duration::from_secs(2))
    }

    #[tokio::test]
    async fn append_then_history_round_trips_in_order() {
        let (_dir, _config, db) = temp_database().await;
        let sessions = store(&db);

        let id = sessions
            .append(None, &ChatMessage::user("How much oil does it take?"))
            .await
            .unwrap();
        let source = SourceReference {
            document: "manual.pdf".to_string(),
            page: Some(412),
            chapter: None,
            section: None,
            topics: vec![],
            relevance: 0.8,
            thumbnail_url: None,
            fullsize_url: None,
            highlighted_url: None,
        };
        let same = sessions
            .append(
                Some(&id),
                &ChatMessage::assistant("6.2 quarts with filter.", vec![source.clone()]),
            )
            .await
            .unwrap();
        assert_eq!(same, id);

        let history = sessions.history(&id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[1].content, "6.2 quarts with filter.");
        assert_eq!(history[1].sources, vec![source]);
    }

    #[tokio::test]
    async fn clear_removes_history() {
        let (_dir, _config, db) = temp_database().await;
        let sessions = store(&db);

        let id = sessions.append(None, &ChatMessage::user("hi")).await.unwrap();
        assert!(sessions.clear(&id).await.unwrap());
        assert!(sessions.history(&id).await.unwrap().is_empty());
        assert!(!sessions.clear(&id).await.unwrap());
    }

    #[tokio::test]
    async fn expired_sessions_read_empty_and_restart_under_new_id() {
        let (_dir, _config, db) = temp_database().await;
        let sessions = store(&db);

        let id = sessions.append(None, &ChatMessage::user("first")).await.unwrap();
        sqlx::query("UPDATE sessions SET last_active_at = ? WHERE id = ?")
            .bind(Utc::now().timestamp() - 7_200)
            .bind(&id)
            .execute(db.pool())
            .await
            .unwrap();

        let fresh = sessions
            .append(Some(&id), &ChatMessage::user("second"))
            .await
            .unwrap();
        assert_ne!(fresh, id);
        assert!(sessions.history(&id).await.unwrap().is_empty());
        assert_eq!(sessions.history(&fresh).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_sessions_do_not_share_history() {
        let (_dir, _config, db) = temp_database().await;
        let sessions = store(&db);

        let tire = ChatMessage::user("tire pressure");
        let bluetooth = ChatMessage::user("bluetooth pairing");
        let (a, b) = tokio::join!(
            sessions.append(None, &tire),
            sessions.append(None, &bluetooth),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_ne!(a, b);

        sessions
            .append(Some(&a), &ChatMessage::assistant("35 psi", vec![]))
            .await
            .unwrap();

        let history_a = sessions.history(&a).await.unwrap();
        let history_b = sessions.history(&b).await.unwrap();
        assert_eq!(history_a.len(), 2);
        assert_eq!(history_b.len(), 1);
        assert_eq!(history_b[0].content, "bluetooth pairing");
    }

    #[tokio::test]
    async fn purge_drops_only_stale_sessions() {
        let (_dir, _config, db) = temp_database().await;
        let sessions = store(&db);

        let stale = sessions.append(None, &ChatMessage::user("old")).await.unwrap();
        let live = sessions.append(None, &ChatMessage::user("new")).await.unwrap();
        sqlx::query("UPDATE sessions SET last_active_at = 0 WHERE id = ?")
            .bind(&stale)
            .execute(db.pool())
            .await
            .unwrap();

        assert_eq!(sessions.purge_expired().await.unwrap(), 1);
        assert_eq!(sessions.history(&live).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn background_purge_removes_stale_sessions_periodically() {
        let (_dir, _config, db) = temp_database().await;
        let sessions = store(&db);
        let task = sessions.spawn_purge_task(Duration::from_millis(20));

        let stale = sessions.append(None, &ChatMessage::user("old")).await.unwrap();
        sqlx::query("UPDATE sessions SET last_active_at = 0 WHERE id = ?")
            .bind(&stale)
            .execute(db.pool())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        task.abort();

        let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sessions WHERE id = ?")
            .bind(&stale)
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(remaining, 0);
    }
}
