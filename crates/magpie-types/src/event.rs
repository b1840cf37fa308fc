use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Server-to-client event kinds carried over the progress bus. This is the
/// authoritative set; clients and server share it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResearchEventKind {
    ProgressUpdate,
    StatusChange,
    SourceFound,
    PartialReport,
    ResearchComplete,
    Error,
}

impl ResearchEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ResearchEventKind::ProgressUpdate => "progress_update",
            ResearchEventKind::StatusChange => "status_change",
            ResearchEventKind::SourceFound => "source_found",
            ResearchEventKind::PartialReport => "partial_report",
            ResearchEventKind::ResearchComplete => "research_complete",
            ResearchEventKind::Error => "error",
        }
    }
}

/// One event in a session's room. Delivery is best-effort to currently
/// connected subscribers; reconnecting clients refetch state over REST.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchEvent {
    #[serde(rename = "type")]
    pub kind: ResearchEventKind,
    pub session_id: String,
    pub payload: Value,
    pub emitted_at: DateTime<Utc>,
}

impl ResearchEvent {
    pub fn new(kind: ResearchEventKind, session_id: impl Into<String>, payload: Value) -> Self {
        Self {
            kind,
            session_id: session_id.into(),
            payload,
            emitted_at: Utc::now(),
        }
    }

    pub fn progress(session_id: &str, percent: u8, phase: &str) -> Self {
        Self::new(
            ResearchEventKind::ProgressUpdate,
            session_id,
            json!({"percent": percent, "phase": phase}),
        )
    }

    pub fn status_change(session_id: &str, status: &str) -> Self {
        Self::new(
            ResearchEventKind::StatusChange,
            session_id,
            json!({"status": status}),
        )
    }

    pub fn source_found(session_id: &str, url: &str, title: Option<&str>) -> Self {
        Self::new(
            ResearchEventKind::SourceFound,
            session_id,
            json!({"url": url, "title": title}),
        )
    }

    pub fn room(&self) -> String {
        format!("research:{}", self.session_id)
    }
}
