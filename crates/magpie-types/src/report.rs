use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub const DEFAULT_RELEVANCE_SCORE: f64 = 0.5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub id: String,
    pub session_id: String,
    pub content: String,
    pub summary: String,
    pub key_findings: Vec<String>,
    pub word_count: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub id: String,
    pub session_id: String,
    pub url: String,
    pub title: String,
    pub content: String,
    pub summary: String,
    pub relevance_score: f64,
    pub accessed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl Source {
    pub fn new(session_id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            url: url.into(),
            title: String::new(),
            content: String::new(),
            summary: String::new(),
            relevance_score: DEFAULT_RELEVANCE_SCORE,
            accessed_at: Utc::now(),
            metadata: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Citation {
    pub id: String,
    pub report_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    pub quote: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    pub position: u32,
}

/// Draft payload handed to the store when a session finishes writing.
/// Citations are positioned by their order in `citations`; the store
/// reindexes them contiguously from zero on insert.
#[derive(Debug, Clone, Default)]
pub struct ReportDraft {
    pub content: String,
    pub summary: String,
    pub key_findings: Vec<String>,
    pub sources: Vec<SourceDraft>,
    pub citations: Vec<CitationDraft>,
}

#[derive(Debug, Clone)]
pub struct SourceDraft {
    pub url: String,
    pub title: String,
    pub content: String,
    pub summary: String,
    pub relevance_score: f64,
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct CitationDraft {
    pub quote: String,
    pub context: Option<String>,
    /// Resolved against stored sources by URL when present.
    pub source_url: Option<String>,
}

impl ReportDraft {
    pub fn word_count(&self) -> u64 {
        self.content.split_whitespace().count() as u64
    }
}
