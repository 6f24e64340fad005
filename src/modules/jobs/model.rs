use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use utoipa::ToSchema;
use uuid::Uuid;

/// Broker-assigned job identifier, stable for the job's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// What travels through the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub id: JobId,
    pub source_key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobState::Queued),
            "active" => Some(JobState::Active),
            "completed" => Some(JobState::Completed),
            "failed" => Some(JobState::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

/// How a job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Failed { reason: String },
}

impl JobOutcome {
    pub fn state(&self) -> JobState {
        match self {
            JobOutcome::Completed => JobState::Completed,
            JobOutcome::Failed { .. } => JobState::Failed,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            JobOutcome::Completed => None,
            JobOutcome::Failed { reason } => Some(reason),
        }
    }
}

/// Broker-held view of a job.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct JobStatus {
    pub id: JobId,
    pub source_key: String,
    pub state: JobState,
    pub progress: u8,
    pub reason: Option<String>,
    #[serde(with = "time::serde::iso8601")]
    #[schema(value_type = String)]
    pub updated_at: OffsetDateTime,
}

impl JobStatus {
    pub fn queued(id: JobId, source_key: &str) -> Self {
        Self {
            id,
            source_key: source_key.to_string(),
            state: JobState::Queued,
            progress: 0,
            reason: None,
            updated_at: OffsetDateTime::now_utc(),
        }
    }
}

/// Lifecycle event published by the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: JobId,
    #[serde(flatten)]
    pub kind: JobEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum JobEventKind {
    Progress { percent: u8 },
    Completed,
    Failed { reason: String },
}

impl JobEvent {
    pub fn progress(job_id: &JobId, percent: u8) -> Self {
        Self {
            job_id: job_id.clone(),
            kind: JobEventKind::Progress { percent },
        }
    }

    pub fn terminal(job_id: &JobId, outcome: &JobOutcome) -> Self {
        let kind = match outcome {
            JobOutcome::Completed => JobEventKind::Completed,
            JobOutcome::Failed { reason } => JobEventKind::Failed {
                reason: reason.clone(),
            },
        };
        Self {
            job_id: job_id.clone(),
            kind,
        }
    }

    #[cfg(test)]
    pub fn is_terminal(&self) -> bool {
        !matches!(self.kind, JobEventKind::Progress { .. })
    }
}
