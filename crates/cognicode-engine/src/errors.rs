use cognicode_core::{JobId, SessionId, ValidationError};

/// Rejections returned synchronously by the orchestrator. Job failures are
/// never returned here; they arrive as terminal events.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("unknown job: {0}")]
    UnknownJob(JobId),
    #[error("unknown session: {0}")]
    UnknownSession(SessionId),
    #[error("session {session_id} is not subscribed to job {job_id}")]
    NotSubscribed { session_id: SessionId, job_id: JobId },
    #[error("orchestrator is shutting down")]
    ShuttingDown,
}

impl OrchestratorError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(e) => e.kind(),
            Self::UnknownJob(_) => "unknown_job",
            Self::UnknownSession(_) => "unknown_session",
            Self::NotSubscribed { .. } => "not_subscribed",
            Self::ShuttingDown => "unavailable",
        }
    }

    pub fn is_retryable(&self) -> bool {
        false
    }
}
