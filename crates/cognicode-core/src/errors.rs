use std::time::Duration;

use crate::operation::Operation;

/// A malformed request. Rejected before fingerprinting; never becomes a job.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("no code provided")]
    EmptyCode,
    #[error("code exceeds maximum size: {actual} > {limit} bytes")]
    CodeTooLarge { limit: usize, actual: usize },
    #[error("invalid language: {0:?}")]
    InvalidLanguage(String),
    #[error("unknown operation: {0}")]
    UnknownOperation(String),
    #[error("options must be a JSON object")]
    InvalidOptions,
    #[error("malformed request: {0}")]
    Malformed(String),
}

impl ValidationError {
    pub fn kind(&self) -> &'static str {
        "validation_error"
    }
}

/// Failure reported by an agent's `infer` call.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct InferenceError {
    pub kind: String,
    pub message: String,
}

impl InferenceError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Returned by agents that observe their cancellation token.
    pub fn cancelled() -> Self {
        Self::new("cancelled", "inference cancelled")
    }

    pub fn is_cancellation(&self) -> bool {
        self.kind == "cancelled"
    }
}

/// Terminal failure of a job. None of these are ever cached.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum JobFailure {
    #[error("no {operation} agent became available within {waited:?}")]
    ResourceExhausted {
        operation: Operation,
        waited: Duration,
        estimated_wait_ms: u64,
    },
    #[error("inference failed: {0}")]
    Inference(#[from] InferenceError),
    #[error("execution exceeded {0:?}")]
    Timeout(Duration),
    #[error("agent pool shut down")]
    PoolClosed,
    #[error("internal error: {0}")]
    Internal(String),
}

impl JobFailure {
    /// Stable classification string sent to clients.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ResourceExhausted { .. } => "resource_exhausted",
            Self::Inference(_) => "inference_error",
            Self::Timeout(_) => "timeout",
            Self::PoolClosed => "unavailable",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Failures are assumed transient, so resubmission gets a fresh attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::PoolClosed)
    }

    /// Agent-level reason, when the agent supplied one.
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Inference(e) => Some(&e.kind),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_kinds_are_stable() {
        let exhausted = JobFailure::ResourceExhausted {
            operation: Operation::Analyze,
            waited: Duration::from_secs(30),
            estimated_wait_ms: 1200,
        };
        assert_eq!(exhausted.kind(), "resource_exhausted");
        assert_eq!(
            JobFailure::Inference(InferenceError::new("model", "oom")).kind(),
            "inference_error"
        );
        assert_eq!(JobFailure::Timeout(Duration::from_secs(1)).kind(), "timeout");
        assert_eq!(JobFailure::PoolClosed.kind(), "unavailable");
        assert_eq!(JobFailure::Internal("agent panicked".into()).kind(), "internal_error");
    }

    #[test]
    fn retryable_classification() {
        assert!(JobFailure::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(JobFailure::Inference(InferenceError::new("x", "y")).is_retryable());
        assert!(!JobFailure::PoolClosed.is_retryable());
    }

    #[test]
    fn inference_reason_is_exposed() {
        let failure = JobFailure::from(InferenceError::new("syntax", "unexpected token"));
        assert_eq!(failure.reason(), Some("syntax"));
        assert!(failure.to_string().contains("unexpected token"));
        assert_eq!(JobFailure::Timeout(Duration::from_secs(2)).reason(), None);
    }

    #[test]
    fn validation_kind() {
        assert_eq!(ValidationError::EmptyCode.kind(), "validation_error");
        let err = ValidationError::CodeTooLarge { limit: 10, actual: 12 };
        assert_eq!(err.to_string(), "code exceeds maximum size: 12 > 10 bytes");
    }
}
