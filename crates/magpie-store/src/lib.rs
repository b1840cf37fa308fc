use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use uuid::Uuid;

use magpie_types::{
    Citation, Report, ReportDraft, ResearchData, ResearchDataDraft, ResearchDataType,
    ResearchSession, ResearchSummary, ResearchSummaryEntry, SessionStatus, Source,
};

mod rows;
use rows::{citation_from_row, report_from_row, research_data_from_row, session_from_row, source_from_row};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("illegal status transition {from:?} -> {to:?}")]
    IllegalTransition {
        from: SessionStatus,
        to: SessionStatus,
    },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Fields accompanying a status update. Timestamps are stamped by the
/// store: entering Processing sets `started_at`, entering a terminal state
/// sets `completed_at`.
#[derive(Debug, Clone, Default)]
pub struct StatusUpdate {
    pub error_message: Option<String>,
    pub report_id: Option<String>,
}

pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub async fn open(db_path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(db_path)?;
        Self::from_connection(conn).await
    }

    pub async fn in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn).await
    }

    async fn from_connection(conn: Connection) -> StoreResult<Self> {
        conn.busy_timeout(Duration::from_secs(10))?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(())).ok();
        conn.execute("PRAGMA synchronous = NORMAL", []).ok();
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                email TEXT NOT NULL UNIQUE,
                role TEXT NOT NULL DEFAULT 'user',
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS research_sessions (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                topic TEXT NOT NULL,
                status TEXT NOT NULL,
                parameters TEXT NOT NULL,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                error_message TEXT,
                report_id TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_sessions_user
                ON research_sessions(user_id, created_at);
            CREATE TABLE IF NOT EXISTS reports (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL UNIQUE
                    REFERENCES research_sessions(id) ON DELETE CASCADE,
                content TEXT NOT NULL,
                summary TEXT NOT NULL,
                key_findings TEXT NOT NULL,
                word_count INTEGER NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS sources (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL
                    REFERENCES research_sessions(id) ON DELETE CASCADE,
                url TEXT NOT NULL,
                title TEXT NOT NULL DEFAULT '',
                content TEXT NOT NULL DEFAULT '',
                summary TEXT NOT NULL DEFAULT '',
                relevance_score REAL NOT NULL DEFAULT 0.5,
                accessed_at TEXT NOT NULL,
                metadata TEXT,
                UNIQUE(session_id, url)
            );
            CREATE TABLE IF NOT EXISTS citations (
                id TEXT PRIMARY KEY,
                report_id TEXT NOT NULL
                    REFERENCES reports(id) ON DELETE CASCADE,
                source_id TEXT,
                quote TEXT NOT NULL,
                context TEXT,
                position INTEGER NOT NULL,
                UNIQUE(report_id, position)
            );
            CREATE TABLE IF NOT EXISTS research_data (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL
                    REFERENCES research_sessions(id) ON DELETE CASCADE,
                data_type TEXT NOT NULL,
                query TEXT,
                title TEXT,
                content TEXT NOT NULL,
                metadata TEXT,
                relevance_score REAL NOT NULL DEFAULT 0.5,
                content_hash TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE(session_id, data_type, content_hash)
            );
            CREATE INDEX IF NOT EXISTS idx_research_data_session
                ON research_data(session_id, data_type);
            CREATE TABLE IF NOT EXISTS research_queries (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL
                    REFERENCES research_sessions(id) ON DELETE CASCADE,
                query TEXT NOT NULL,
                result_count INTEGER NOT NULL DEFAULT 0,
                executed_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS search_history (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                query TEXT NOT NULL,
                result_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS user_settings (
                user_id TEXT PRIMARY KEY,
                preferences TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );",
        )?;
        Ok(())
    }

    // ----- users -----

    pub async fn ensure_user(&self, id: &str, email: &str, role: &str) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO users (id, email, role, created_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO NOTHING",
            params![id, email, role, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub async fn user_role(&self, user_id: &str) -> StoreResult<Option<String>> {
        let conn = self.conn.lock().await;
        let role = conn
            .query_row(
                "SELECT role FROM users WHERE id = ?1",
                params![user_id],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(role)
    }

    // ----- sessions -----

    pub async fn create_session(&self, session: &ResearchSession) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO research_sessions
                (id, user_id, topic, status, parameters, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                session.id,
                session.user_id,
                session.topic,
                session.status.as_str(),
                serde_json::to_string(&session.parameters)?,
                session.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub async fn get_session(&self, id: &str) -> StoreResult<Option<ResearchSession>> {
        let conn = self.conn.lock().await;
        let session = conn
            .query_row(
                "SELECT id, user_id, topic, status, parameters, created_at,
                        started_at, completed_at, error_message, report_id
                 FROM research_sessions WHERE id = ?1",
                params![id],
                session_from_row,
            )
            .optional()?;
        Ok(session)
    }

    pub async fn list_sessions(
        &self,
        user_id: &str,
        status: Option<SessionStatus>,
        page: u32,
        limit: u32,
    ) -> StoreResult<(Vec<ResearchSession>, u64)> {
        let limit = limit.clamp(1, 100);
        let offset = u64::from(page.saturating_sub(1)) * u64::from(limit);
        let conn = self.conn.lock().await;

        let (total, sessions) = match status {
            Some(status) => {
                let total: u64 = conn.query_row(
                    "SELECT COUNT(*) FROM research_sessions WHERE user_id = ?1 AND status = ?2",
                    params![user_id, status.as_str()],
                    |row| row.get(0),
                )?;
                let mut stmt = conn.prepare(
                    "SELECT id, user_id, topic, status, parameters, created_at,
                            started_at, completed_at, error_message, report_id
                     FROM research_sessions
                     WHERE user_id = ?1 AND status = ?2
                     ORDER BY created_at DESC LIMIT ?3 OFFSET ?4",
                )?;
                let rows = stmt
                    .query_map(
                        params![user_id, status.as_str(), limit, offset],
                        session_from_row,
                    )?
                    .collect::<Result<Vec<_>, _>>()?;
                (total, rows)
            }
            None => {
                let total: u64 = conn.query_row(
                    "SELECT COUNT(*) FROM research_sessions WHERE user_id = ?1",
                    params![user_id],
                    |row| row.get(0),
                )?;
                let mut stmt = conn.prepare(
                    "SELECT id, user_id, topic, status, parameters, created_at,
                            started_at, completed_at, error_message, report_id
                     FROM research_sessions
                     WHERE user_id = ?1
                     ORDER BY created_at DESC LIMIT ?2 OFFSET ?3",
                )?;
                let rows = stmt
                    .query_map(params![user_id, limit, offset], session_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                (total, rows)
            }
        };
        Ok((sessions, total))
    }

    /// Status-machine-enforced update. Same-status updates are accepted as
    /// no-ops so crash-requeued workers stay idempotent.
    pub async fn update_status(
        &self,
        id: &str,
        next: SessionStatus,
        update: StatusUpdate,
    ) -> StoreResult<ResearchSession> {
        let conn = self.conn.lock().await;
        let current = conn
            .query_row(
                "SELECT status FROM research_sessions WHERE id = ?1",
                params![id],
                |row| row.get::<_, String>(0),
            )
            .optional()?
            .and_then(|s| SessionStatus::parse(&s))
            .ok_or_else(|| StoreError::NotFound(format!("session {id}")))?;

        if current != next {
            if !current.can_transition_to(next) {
                return Err(StoreError::IllegalTransition {
                    from: current,
                    to: next,
                });
            }
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "UPDATE research_sessions SET status = ?2,
                    started_at = CASE WHEN ?3 THEN COALESCE(started_at, ?4) ELSE started_at END,
                    completed_at = CASE WHEN ?5 THEN ?4 ELSE completed_at END,
                    error_message = COALESCE(?6, error_message),
                    report_id = COALESCE(?7, report_id)
                 WHERE id = ?1",
                params![
                    id,
                    next.as_str(),
                    next == SessionStatus::Processing,
                    now,
                    next.is_terminal(),
                    update.error_message,
                    update.report_id,
                ],
            )?;
        } else if update.error_message.is_some() || update.report_id.is_some() {
            conn.execute(
                "UPDATE research_sessions SET
                    error_message = COALESCE(?2, error_message),
                    report_id = COALESCE(?3, report_id)
                 WHERE id = ?1",
                params![id, update.error_message, update.report_id],
            )?;
        }

        let session = conn
            .query_row(
                "SELECT id, user_id, topic, status, parameters, created_at,
                        started_at, completed_at, error_message, report_id
                 FROM research_sessions WHERE id = ?1",
                params![id],
                session_from_row,
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("session {id}")))?;
        Ok(session)
    }

    pub async fn delete_session(&self, id: &str) -> StoreResult<bool> {
        let conn = self.conn.lock().await;
        let removed = conn.execute(
            "DELETE FROM research_sessions WHERE id = ?1",
            params![id],
        )?;
        Ok(removed > 0)
    }

    // ----- reports -----

    /// Persist the finished report with its sources and citations in one
    /// transaction. Idempotent: a report already stored for the session is
    /// returned unchanged, which is what makes crash-requeue completion
    /// safe.
    pub async fn save_report(&self, session_id: &str, draft: &ReportDraft) -> StoreResult<Report> {
        let mut guard = self.conn.lock().await;
        let tx = guard.transaction()?;

        if let Some(existing) = tx
            .query_row(
                "SELECT id, session_id, content, summary, key_findings, word_count, created_at
                 FROM reports WHERE session_id = ?1",
                params![session_id],
                report_from_row,
            )
            .optional()?
        {
            tx.finish()?;
            return Ok(existing);
        }

        let report = Report {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            content: draft.content.clone(),
            summary: draft.summary.clone(),
            key_findings: draft.key_findings.clone(),
            word_count: draft.word_count(),
            created_at: Utc::now(),
        };
        tx.execute(
            "INSERT INTO reports (id, session_id, content, summary, key_findings, word_count, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                report.id,
                report.session_id,
                report.content,
                report.summary,
                serde_json::to_string(&report.key_findings)?,
                report.word_count,
                report.created_at.to_rfc3339(),
            ],
        )?;

        for source in &draft.sources {
            tx.execute(
                "INSERT INTO sources
                    (id, session_id, url, title, content, summary, relevance_score, accessed_at, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(session_id, url) DO UPDATE SET
                    title = excluded.title,
                    summary = excluded.summary,
                    relevance_score = excluded.relevance_score",
                params![
                    Uuid::new_v4().to_string(),
                    session_id,
                    source.url,
                    source.title,
                    source.content,
                    source.summary,
                    source.relevance_score.clamp(0.0, 1.0),
                    Utc::now().to_rfc3339(),
                    source
                        .metadata
                        .as_ref()
                        .map(serde_json::to_string)
                        .transpose()?,
                ],
            )?;
        }

        // Citations are reindexed from zero in draft order so positions stay
        // contiguous no matter what the writer produced.
        for (position, citation) in draft.citations.iter().enumerate() {
            let source_id: Option<String> = match citation.source_url.as_deref() {
                Some(url) => tx
                    .query_row(
                        "SELECT id FROM sources WHERE session_id = ?1 AND url = ?2",
                        params![session_id, url],
                        |row| row.get(0),
                    )
                    .optional()?,
                None => None,
            };
            tx.execute(
                "INSERT INTO citations (id, report_id, source_id, quote, context, position)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    Uuid::new_v4().to_string(),
                    report.id,
                    source_id,
                    citation.quote,
                    citation.context,
                    position as i64,
                ],
            )?;
        }

        tx.commit()?;
        Ok(report)
    }

    pub async fn get_report(&self, id: &str) -> StoreResult<Option<Report>> {
        let conn = self.conn.lock().await;
        let report = conn
            .query_row(
                "SELECT id, session_id, content, summary, key_findings, word_count, created_at
                 FROM reports WHERE id = ?1",
                params![id],
                report_from_row,
            )
            .optional()?;
        Ok(report)
    }

    pub async fn get_report_by_session(&self, session_id: &str) -> StoreResult<Option<Report>> {
        let conn = self.conn.lock().await;
        let report = conn
            .query_row(
                "SELECT id, session_id, content, summary, key_findings, word_count, created_at
                 FROM reports WHERE session_id = ?1",
                params![session_id],
                report_from_row,
            )
            .optional()?;
        Ok(report)
    }

    pub async fn list_sources(&self, session_id: &str) -> StoreResult<Vec<Source>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, session_id, url, title, content, summary, relevance_score, accessed_at, metadata
             FROM sources WHERE session_id = ?1
             ORDER BY relevance_score DESC, accessed_at DESC",
        )?;
        let sources = stmt
            .query_map(params![session_id], source_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(sources)
    }

    pub async fn list_citations(&self, report_id: &str) -> StoreResult<Vec<Citation>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, report_id, source_id, quote, context, position
             FROM citations WHERE report_id = ?1 ORDER BY position ASC",
        )?;
        let citations = stmt
            .query_map(params![report_id], citation_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(citations)
    }

    // ----- research data (scratchpad) -----

    /// Insert a scratchpad row; duplicate content for the same session and
    /// type is silently dropped and `None` returned.
    pub async fn append_research_data(
        &self,
        session_id: &str,
        data_type: ResearchDataType,
        draft: &ResearchDataDraft,
    ) -> StoreResult<Option<ResearchData>> {
        let hash = content_hash(&draft.content);
        let record = ResearchData {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            data_type,
            query: draft.query.clone(),
            title: draft.title.clone(),
            content: draft.content.clone(),
            metadata: draft.metadata.clone(),
            relevance_score: draft.relevance_or_default().clamp(0.0, 1.0),
            created_at: Utc::now(),
        };
        let conn = self.conn.lock().await;
        let inserted = conn.execute(
            "INSERT INTO research_data
                (id, session_id, data_type, query, title, content, metadata,
                 relevance_score, content_hash, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(session_id, data_type, content_hash) DO NOTHING",
            params![
                record.id,
                record.session_id,
                data_type.as_str(),
                record.query,
                record.title,
                record.content,
                record
                    .metadata
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                record.relevance_score,
                hash,
                record.created_at.to_rfc3339(),
            ],
        )?;
        Ok(if inserted > 0 { Some(record) } else { None })
    }

    pub async fn get_research_data(
        &self,
        session_id: &str,
        data_type: Option<ResearchDataType>,
        limit: Option<u32>,
    ) -> StoreResult<Vec<ResearchData>> {
        let limit = i64::from(limit.unwrap_or(200).clamp(1, 1000));
        let conn = self.conn.lock().await;
        let rows = match data_type {
            Some(data_type) => {
                let mut stmt = conn.prepare(
                    "SELECT id, session_id, data_type, query, title, content, metadata,
                            relevance_score, created_at
                     FROM research_data
                     WHERE session_id = ?1 AND data_type = ?2
                     ORDER BY relevance_score DESC, created_at DESC LIMIT ?3",
                )?;
                let result = stmt
                    .query_map(
                        params![session_id, data_type.as_str(), limit],
                        research_data_from_row,
                    )?
                    .collect::<Result<Vec<_>, _>>()?;
                result
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT id, session_id, data_type, query, title, content, metadata,
                            relevance_score, created_at
                     FROM research_data
                     WHERE session_id = ?1
                     ORDER BY relevance_score DESC, created_at DESC LIMIT ?2",
                )?;
                let result = stmt
                    .query_map(params![session_id, limit], research_data_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                result
            }
        };
        Ok(rows)
    }

    pub async fn count_research_data(
        &self,
        session_id: &str,
        data_type: ResearchDataType,
    ) -> StoreResult<u64> {
        let conn = self.conn.lock().await;
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM research_data WHERE session_id = ?1 AND data_type = ?2",
            params![session_id, data_type.as_str()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub async fn research_summary(&self, session_id: &str) -> StoreResult<ResearchSummary> {
        let conn = self.conn.lock().await;
        let total_sources: u64 = conn.query_row(
            "SELECT COUNT(*) FROM research_data
             WHERE session_id = ?1 AND data_type IN ('extracted_content', 'source_content')",
            params![session_id],
            |row| row.get(0),
        )?;
        let distinct_queries: u64 = conn.query_row(
            "SELECT COUNT(DISTINCT query) FROM research_data
             WHERE session_id = ?1 AND query IS NOT NULL",
            params![session_id],
            |row| row.get(0),
        )?;
        let mut stmt = conn.prepare(
            "SELECT title, metadata, relevance_score FROM research_data
             WHERE session_id = ?1 AND data_type IN ('extracted_content', 'source_content')
             ORDER BY relevance_score DESC, created_at DESC LIMIT 10",
        )?;
        let top_sources = stmt
            .query_map(params![session_id], |row| {
                let title: Option<String> = row.get(0)?;
                let metadata: Option<String> = row.get(1)?;
                let relevance_score: f64 = row.get(2)?;
                Ok((title, metadata, relevance_score))
            })?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(|(title, metadata, relevance_score)| {
                let url = metadata
                    .as_deref()
                    .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
                    .and_then(|value| {
                        value
                            .get("url")
                            .and_then(|v| v.as_str())
                            .map(str::to_string)
                    });
                ResearchSummaryEntry {
                    title,
                    url,
                    relevance_score,
                }
            })
            .collect();
        Ok(ResearchSummary {
            total_sources,
            distinct_queries,
            top_sources,
        })
    }

    /// Evict scratchpad rows of sessions that reached a terminal status at
    /// least `grace` ago. Rows of failed sessions inside the grace window
    /// stay available for diagnosis.
    pub async fn purge_research_data(&self, grace: chrono::Duration) -> StoreResult<u64> {
        let cutoff = (Utc::now() - grace).to_rfc3339();
        let conn = self.conn.lock().await;
        let removed = conn.execute(
            "DELETE FROM research_data WHERE session_id IN (
                SELECT id FROM research_sessions
                WHERE status IN ('completed', 'failed', 'cancelled')
                  AND completed_at IS NOT NULL AND completed_at < ?1
            )",
            params![cutoff],
        )?;
        Ok(removed as u64)
    }

    // ----- queries & history -----

    pub async fn record_research_query(
        &self,
        session_id: &str,
        query: &str,
        result_count: u64,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO research_queries (id, session_id, query, result_count, executed_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                Uuid::new_v4().to_string(),
                session_id,
                query,
                result_count,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub async fn list_research_queries(
        &self,
        session_id: &str,
    ) -> StoreResult<Vec<(String, u64)>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT query, result_count FROM research_queries
             WHERE session_id = ?1 ORDER BY executed_at ASC",
        )?;
        let rows = stmt
            .query_map(params![session_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub async fn record_search_history(
        &self,
        user_id: &str,
        query: &str,
        result_count: u64,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO search_history (id, user_id, query, result_count, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                Uuid::new_v4().to_string(),
                user_id,
                query,
                result_count,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub async fn list_search_history(
        &self,
        user_id: &str,
        limit: u32,
    ) -> StoreResult<Vec<(String, u64, DateTime<Utc>)>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT query, result_count, created_at FROM search_history
             WHERE user_id = ?1 ORDER BY created_at DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![user_id, limit.clamp(1, 200)], |row| {
                let query: String = row.get(0)?;
                let count: u64 = row.get(1)?;
                let created: String = row.get(2)?;
                Ok((query, count, created))
            })?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(|(query, count, created)| {
                let created = DateTime::parse_from_rfc3339(&created)
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now());
                (query, count, created)
            })
            .collect();
        Ok(rows)
    }

    // ----- user settings -----

    pub async fn get_user_settings(&self, user_id: &str) -> StoreResult<Option<Value>> {
        let conn = self.conn.lock().await;
        let raw = conn
            .query_row(
                "SELECT preferences FROM user_settings WHERE user_id = ?1",
                params![user_id],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(raw.map(|raw| serde_json::from_str(&raw)).transpose()?)
    }

    pub async fn put_user_settings(&self, user_id: &str, preferences: &Value) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO user_settings (user_id, preferences, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(user_id) DO UPDATE SET
                preferences = excluded.preferences,
                updated_at = excluded.updated_at",
            params![user_id, serde_json::to_string(preferences)?, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }
}

pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests;
