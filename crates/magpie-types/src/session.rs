use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const TOPIC_MIN_CHARS: usize = 3;
pub const TOPIC_MAX_CHARS: usize = 500;
pub const MAX_SOURCES_CEILING: u32 = 200;
pub const DEFAULT_MAX_SOURCES: u32 = 50;
pub const DEFAULT_MIN_SOURCES: u32 = 3;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    /// Legal transitions: Pending -> Processing -> terminal. Retry never
    /// resurrects a session; it clones into a fresh one.
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        match (self, next) {
            (Pending, Processing) => true,
            (Pending, Failed) | (Pending, Cancelled) => true,
            (Processing, Completed) | (Processing, Failed) | (Processing, Cancelled) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Processing => "processing",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<SessionStatus> {
        match value {
            "pending" => Some(SessionStatus::Pending),
            "processing" => Some(SessionStatus::Processing),
            "completed" => Some(SessionStatus::Completed),
            "failed" => Some(SessionStatus::Failed),
            "cancelled" => Some(SessionStatus::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReportLength {
    Short,
    #[default]
    Medium,
    Long,
    Comprehensive,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ResearchDepth {
    Surface,
    #[default]
    Standard,
    Comprehensive,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResearchParameters {
    #[serde(default = "default_max_sources")]
    pub max_sources: u32,
    #[serde(default = "default_min_sources")]
    pub min_sources: u32,
    #[serde(default)]
    pub report_length: ReportLength,
    #[serde(default)]
    pub depth: ResearchDepth,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_domains: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_domains: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_range: Option<String>,
}

fn default_max_sources() -> u32 {
    DEFAULT_MAX_SOURCES
}

fn default_min_sources() -> u32 {
    DEFAULT_MIN_SOURCES
}

fn default_language() -> String {
    "en".to_string()
}

impl Default for ResearchParameters {
    fn default() -> Self {
        Self {
            max_sources: DEFAULT_MAX_SOURCES,
            min_sources: DEFAULT_MIN_SOURCES,
            report_length: ReportLength::default(),
            depth: ResearchDepth::default(),
            language: default_language(),
            allowed_domains: None,
            blocked_domains: None,
            date_range: None,
        }
    }
}

impl ResearchParameters {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_sources == 0 || self.max_sources > MAX_SOURCES_CEILING {
            return Err(ValidationError::new(format!(
                "max_sources must be between 1 and {}",
                MAX_SOURCES_CEILING
            )));
        }
        if self.min_sources > self.max_sources {
            return Err(ValidationError::new(
                "min_sources must not exceed max_sources",
            ));
        }
        if self.language.trim().is_empty() {
            return Err(ValidationError::new("language must not be empty"));
        }
        if let Some(range) = self.date_range.as_deref() {
            if !is_valid_date_range(range) {
                return Err(ValidationError::new(format!(
                    "unrecognized date_range `{range}` (expected forms like 7d, 1m, 1y)"
                )));
            }
        }
        Ok(())
    }
}

fn is_valid_date_range(range: &str) -> bool {
    let range = range.trim();
    if range.len() < 2 {
        return false;
    }
    let (digits, unit) = range.split_at(range.len() - 1);
    digits.chars().all(|c| c.is_ascii_digit())
        && !digits.is_empty()
        && matches!(unit, "d" | "w" | "m" | "y")
}

pub fn validate_topic(topic: &str) -> Result<(), ValidationError> {
    let len = topic.trim().chars().count();
    if len < TOPIC_MIN_CHARS || len > TOPIC_MAX_CHARS {
        return Err(ValidationError::new(format!(
            "topic must be between {TOPIC_MIN_CHARS} and {TOPIC_MAX_CHARS} characters"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub message: String,
}

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ValidationError {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchSession {
    pub id: String,
    pub user_id: String,
    pub topic: String,
    pub status: SessionStatus,
    pub parameters: ResearchParameters,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report_id: Option<String>,
}

impl ResearchSession {
    pub fn new(user_id: impl Into<String>, topic: impl Into<String>, parameters: ResearchParameters) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            topic: topic.into(),
            status: SessionStatus::Pending,
            parameters,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error_message: None,
            report_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_machine_allows_only_forward_transitions() {
        use SessionStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Failed));
        assert!(Processing.can_transition_to(Cancelled));
        assert!(!Processing.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Processing));
        assert!(!Failed.can_transition_to(Completed));
        assert!(!Cancelled.can_transition_to(Processing));
    }

    #[test]
    fn topic_bounds_are_enforced() {
        assert!(validate_topic("AI").is_err());
        assert!(validate_topic("Impact of AI on healthcare diagnostics").is_ok());
        assert!(validate_topic(&"x".repeat(501)).is_err());
        assert!(validate_topic(&"x".repeat(500)).is_ok());
    }

    #[test]
    fn parameter_ranges_are_enforced() {
        let mut params = ResearchParameters::default();
        assert!(params.validate().is_ok());

        params.max_sources = 500;
        assert!(params.validate().is_err());

        params.max_sources = 10;
        params.min_sources = 20;
        assert!(params.validate().is_err());

        params.min_sources = 5;
        params.date_range = Some("7d".to_string());
        assert!(params.validate().is_ok());

        params.date_range = Some("sometime".to_string());
        assert!(params.validate().is_err());
    }
}
