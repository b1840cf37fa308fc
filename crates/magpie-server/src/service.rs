use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use magpie_core::Services;
use magpie_extract::{SearchHit, SearchQuery};
use magpie_queue::{JobQueue, RemoveOutcome};
use magpie_store::StatusUpdate;
use magpie_types::{
    validate_topic, EnqueueOptions, JobData, ResearchParameters, ResearchSession,
    SessionStatus,
};

use crate::error::ApiError;

pub const RESEARCH_SUBMITS_PER_MINUTE: usize = 10;
pub const GENERAL_REQUESTS_PER_MINUTE: usize = 30;

/// Sliding-window in-memory rate limiter keyed by user and request class.
#[derive(Clone, Default)]
pub struct RateLimiter {
    hits: Arc<Mutex<HashMap<String, Vec<Instant>>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn allow(&self, key: &str, limit: usize, window: Duration) -> bool {
        let now = Instant::now();
        let mut hits = self.hits.lock().await;
        let bucket = hits.entry(key.to_string()).or_default();
        bucket.retain(|stamp| now.duration_since(*stamp) < window);
        if bucket.len() >= limit {
            return false;
        }
        bucket.push(now);
        true
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmitReceipt {
    pub session_id: String,
    pub status: SessionStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionProgress {
    pub session_id: String,
    pub status: SessionStatus,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Public façade over sessions: submit, list, cancel, retry, progress. All
/// rules about dangling state live here, not in the HTTP handlers.
#[derive(Clone)]
pub struct SessionService {
    services: Services,
    queue: JobQueue,
    limiter: RateLimiter,
}

impl SessionService {
    pub fn new(services: Services, queue: JobQueue) -> Self {
        Self {
            services,
            queue,
            limiter: RateLimiter::new(),
        }
    }

    async fn is_admin(&self, user_id: &str) -> bool {
        matches!(
            self.services.store.user_role(user_id).await,
            Ok(Some(role)) if role == "admin"
        )
    }

    async fn check_rate(&self, user_id: &str, class: &str, limit: usize) -> Result<(), ApiError> {
        if self.is_admin(user_id).await {
            return Ok(());
        }
        let key = format!("{class}:{user_id}");
        if self
            .limiter
            .allow(&key, limit, Duration::from_secs(60))
            .await
        {
            Ok(())
        } else {
            Err(ApiError::RateLimited)
        }
    }

    /// Submit a new research session. A session row is only allowed to
    /// exist in PENDING with a queued job behind it; if the enqueue fails
    /// the session is immediately marked FAILED.
    pub async fn submit(
        &self,
        user_id: &str,
        topic: &str,
        parameters: ResearchParameters,
    ) -> Result<SubmitReceipt, ApiError> {
        self.check_rate(user_id, "research", RESEARCH_SUBMITS_PER_MINUTE)
            .await?;
        validate_topic(topic).map_err(|err| ApiError::Validation(err.message))?;
        parameters
            .validate()
            .map_err(|err| ApiError::Validation(err.message))?;
        if parameters.max_sources > self.services.config.max_sources_ceiling {
            return Err(ApiError::Validation(format!(
                "max_sources exceeds the configured ceiling of {}",
                self.services.config.max_sources_ceiling
            )));
        }

        let session = ResearchSession::new(user_id, topic.trim(), parameters.clone());
        self.services
            .store
            .create_session(&session)
            .await
            .map_err(ApiError::from)?;

        let enqueue_result = self
            .queue
            .enqueue(
                &session.id,
                JobData {
                    topic: session.topic.clone(),
                    parameters,
                    user_id: user_id.to_string(),
                },
                EnqueueOptions::default(),
            )
            .await;

        if let Err(err) = enqueue_result {
            tracing::error!(session_id = %session.id, "enqueue failed: {err}");
            let _ = self
                .services
                .store
                .update_status(
                    &session.id,
                    SessionStatus::Failed,
                    StatusUpdate {
                        error_message: Some(format!("failed to queue research job: {err}")),
                        report_id: None,
                    },
                )
                .await;
            return Err(ApiError::Internal(err));
        }

        tracing::info!(session_id = %session.id, user_id, "research session submitted");
        Ok(SubmitReceipt {
            session_id: session.id,
            status: SessionStatus::Pending,
        })
    }

    pub async fn list(
        &self,
        user_id: &str,
        status: Option<&str>,
        page: u32,
        limit: u32,
    ) -> Result<(Vec<ResearchSession>, u64), ApiError> {
        self.check_rate(user_id, "general", GENERAL_REQUESTS_PER_MINUTE)
            .await?;
        let status = match status {
            Some(raw) => Some(
                SessionStatus::parse(raw)
                    .ok_or_else(|| ApiError::Validation(format!("unknown status `{raw}`")))?,
            ),
            None => None,
        };
        let (sessions, total) = self
            .services
            .store
            .list_sessions(user_id, status, page.max(1), limit)
            .await?;
        Ok((sessions, total))
    }

    /// Fetch a session, scoped to its owner; admin identities see all.
    pub async fn get(&self, session_id: &str, user_id: &str) -> Result<ResearchSession, ApiError> {
        let session = self
            .services
            .store
            .get_session(session_id)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("session {session_id}")))?;
        if session.user_id != user_id && !self.is_admin(user_id).await {
            return Err(ApiError::NotFound(format!("session {session_id}")));
        }
        Ok(session)
    }

    pub async fn progress(
        &self,
        session_id: &str,
        user_id: &str,
    ) -> Result<SessionProgress, ApiError> {
        let session = self.get(session_id, user_id).await?;
        let job = self.queue.get_job(session_id).await.ok().flatten();
        let (progress, phase) = match (&session.status, job) {
            (SessionStatus::Completed, _) => (100, Some("complete".to_string())),
            (_, Some(job)) => (job.progress, job.phase),
            (SessionStatus::Pending, None) => (0, None),
            _ => (0, None),
        };
        Ok(SessionProgress {
            session_id: session.id,
            status: session.status,
            progress,
            phase,
            error_message: session.error_message,
        })
    }

    /// Cancel from PENDING or PROCESSING. Idempotent: cancelling an
    /// already-cancelled session succeeds without any state change.
    pub async fn cancel(&self, session_id: &str, user_id: &str) -> Result<SessionStatus, ApiError> {
        let session = self.get(session_id, user_id).await?;
        match session.status {
            SessionStatus::Cancelled => return Ok(SessionStatus::Cancelled),
            SessionStatus::Pending | SessionStatus::Processing => {}
            other => {
                return Err(ApiError::Conflict(format!(
                    "cannot cancel a session in status {}",
                    other.as_str()
                )))
            }
        }

        self.services
            .store
            .update_status(session_id, SessionStatus::Cancelled, StatusUpdate::default())
            .await?;
        match self.queue.remove_job(session_id).await {
            Ok(RemoveOutcome::Removed) => {
                tracing::info!(session_id, "queued job removed on cancel")
            }
            Ok(RemoveOutcome::CancelRequested) => {
                tracing::info!(session_id, "active job flagged for cooperative cancel")
            }
            Ok(_) => {}
            Err(err) => tracing::warn!(session_id, "job removal failed: {err}"),
        }
        self.services.cancellations.cancel(session_id).await;
        self.services
            .bus
            .publish(magpie_types::ResearchEvent::status_change(
                session_id,
                SessionStatus::Cancelled.as_str(),
            ));
        Ok(SessionStatus::Cancelled)
    }

    /// Retry a FAILED session by cloning topic and parameters into a brand
    /// new session; the original row is never mutated.
    pub async fn retry(&self, session_id: &str, user_id: &str) -> Result<SubmitReceipt, ApiError> {
        let session = self.get(session_id, user_id).await?;
        if session.status != SessionStatus::Failed {
            return Err(ApiError::Conflict(format!(
                "only failed sessions can be retried (status is {})",
                session.status.as_str()
            )));
        }
        self.submit(user_id, &session.topic, session.parameters.clone())
            .await
    }

    /// C2 passthrough with history logging.
    pub async fn search(
        &self,
        user_id: &str,
        query: &str,
        max_results: usize,
        language: Option<String>,
        time_range: Option<String>,
    ) -> Result<Vec<SearchHit>, ApiError> {
        self.check_rate(user_id, "general", GENERAL_REQUESTS_PER_MINUTE)
            .await?;
        if query.trim().is_empty() {
            return Err(ApiError::Validation("query must not be empty".to_string()));
        }
        let hits = self
            .services
            .search
            .search(&SearchQuery {
                query: query.to_string(),
                max_results: max_results.clamp(1, 50),
                language,
                time_range,
                allowed_domains: None,
                blocked_domains: None,
            })
            .await
            .map_err(ApiError::Internal)?;
        if let Err(err) = self
            .services
            .store
            .record_search_history(user_id, query, hits.len() as u64)
            .await
        {
            tracing::warn!(user_id, "search history write failed: {err}");
        }
        Ok(hits)
    }

    pub async fn search_history(&self, user_id: &str) -> Result<Value, ApiError> {
        let rows = self.services.store.list_search_history(user_id, 50).await?;
        let entries: Vec<Value> = rows
            .into_iter()
            .map(|(query, result_count, created_at)| {
                json!({
                    "query": query,
                    "result_count": result_count,
                    "created_at": created_at,
                })
            })
            .collect();
        Ok(json!(entries))
    }

    pub fn services(&self) -> &Services {
        &self.services
    }
}
