use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::JobFailure;
use crate::ids::JobId;
use crate::operation::Operation;

/// A progress report from a running job. Sequence numbers are strictly
/// increasing per job, starting at 1.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub job_id: JobId,
    pub sequence: u64,
    pub stage: String,
    pub percent: u8,
    pub timestamp: DateTime<Utc>,
}

/// Everything a subscriber can receive about a job. The last event of every
/// job is exactly one of `Result`, `Error` or `Cancelled`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum JobEvent {
    #[serde(rename = "progress")]
    Progress(ProgressEvent),

    #[serde(rename = "result")]
    Result {
        job_id: JobId,
        sequence: u64,
        operation: Operation,
        data: serde_json::Value,
        cached: bool,
    },

    #[serde(rename = "error")]
    Error {
        job_id: JobId,
        sequence: u64,
        kind: String,
        message: String,
        retryable: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    #[serde(rename = "cancelled")]
    Cancelled { job_id: JobId, sequence: u64 },
}

impl JobEvent {
    pub fn failure(job_id: JobId, sequence: u64, failure: &JobFailure) -> Self {
        Self::Error {
            job_id,
            sequence,
            kind: failure.kind().to_string(),
            message: failure.to_string(),
            retryable: failure.is_retryable(),
            reason: failure.reason().map(str::to_string),
        }
    }

    pub fn job_id(&self) -> &JobId {
        match self {
            Self::Progress(p) => &p.job_id,
            Self::Result { job_id, .. } | Self::Error { job_id, .. } | Self::Cancelled { job_id, .. } => {
                job_id
            }
        }
    }

    pub fn sequence(&self) -> u64 {
        match self {
            Self::Progress(p) => p.sequence,
            Self::Result { sequence, .. }
            | Self::Error { sequence, .. }
            | Self::Cancelled { sequence, .. } => *sequence,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Progress(_))
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Progress(_) => "progress",
            Self::Result { .. } => "result",
            Self::Error { .. } => "error",
            Self::Cancelled { .. } => "cancelled",
        }
    }
}
