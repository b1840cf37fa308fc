use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::report::DEFAULT_RELEVANCE_SCORE;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ResearchDataType {
    SearchResults,
    ExtractedContent,
    Analysis,
    GamePlan,
    SourceContent,
}

impl ResearchDataType {
    pub fn as_str(self) -> &'static str {
        match self {
            ResearchDataType::SearchResults => "search_results",
            ResearchDataType::ExtractedContent => "extracted_content",
            ResearchDataType::Analysis => "analysis",
            ResearchDataType::GamePlan => "game_plan",
            ResearchDataType::SourceContent => "source_content",
        }
    }

    pub fn parse(value: &str) -> Option<ResearchDataType> {
        match value {
            "search_results" => Some(ResearchDataType::SearchResults),
            "extracted_content" => Some(ResearchDataType::ExtractedContent),
            "analysis" => Some(ResearchDataType::Analysis),
            "game_plan" => Some(ResearchDataType::GamePlan),
            "source_content" => Some(ResearchDataType::SourceContent),
            _ => None,
        }
    }

    /// Row kinds that correspond to a fetched page and should surface a
    /// `source_found` event when first stored.
    pub fn is_source_bearing(self) -> bool {
        matches!(
            self,
            ResearchDataType::ExtractedContent | ResearchDataType::SourceContent
        )
    }
}

/// Per-session scratchpad row. Stages hand off through these rows rather
/// than in-memory state so a later stage can read everything its
/// predecessors produced regardless of context-window limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchData {
    pub id: String,
    pub session_id: String,
    pub data_type: ResearchDataType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    pub relevance_score: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct ResearchDataDraft {
    pub query: Option<String>,
    pub title: Option<String>,
    pub content: String,
    pub metadata: Option<Value>,
    pub relevance_score: Option<f64>,
}

impl ResearchDataDraft {
    pub fn relevance_or_default(&self) -> f64 {
        self.relevance_score.unwrap_or(DEFAULT_RELEVANCE_SCORE)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchSummary {
    pub total_sources: u64,
    pub distinct_queries: u64,
    pub top_sources: Vec<ResearchSummaryEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchSummaryEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub relevance_score: f64,
}
