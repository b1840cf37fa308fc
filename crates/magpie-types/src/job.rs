use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::session::ResearchParameters;

pub const RESEARCH_QUEUE: &str = "research";
pub const JOB_TIMEOUT_MS: u64 = 50 * 60 * 1000;
pub const JOB_MAX_ATTEMPTS: u32 = 3;
pub const JOB_BACKOFF_BASE_MS: u64 = 2_000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Active,
    Delayed,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Delayed => "delayed",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<JobState> {
        match value {
            "waiting" => Some(JobState::Waiting),
            "active" => Some(JobState::Active),
            "delayed" => Some(JobState::Delayed),
            "completed" => Some(JobState::Completed),
            "failed" => Some(JobState::Failed),
            _ => None,
        }
    }
}

/// Payload carried by a research job. The job id doubles as the session id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobData {
    pub topic: String,
    pub parameters: ResearchParameters,
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub data: JobData,
    pub state: JobState,
    pub attempts: u32,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    pub timeout_ms: u64,
    pub priority: i64,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct EnqueueOptions {
    pub attempts: u32,
    pub backoff_base_ms: u64,
    pub timeout_ms: u64,
    pub priority: i64,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            attempts: JOB_MAX_ATTEMPTS,
            backoff_base_ms: JOB_BACKOFF_BASE_MS,
            timeout_ms: JOB_TIMEOUT_MS,
            priority: 0,
        }
    }
}

/// Exponential backoff for the nth retry (1-based), base doubling per step.
pub fn retry_backoff_ms(base_ms: u64, attempt: u32) -> u64 {
    base_ms.saturating_mul(1u64 << attempt.saturating_sub(1).min(16))
}
