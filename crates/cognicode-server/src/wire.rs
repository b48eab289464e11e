//! Wire format for the streaming protocol.
//!
//! Clients speak camelCase; handlers read snake_case. Outbound frames are
//! flat objects keyed by `type`, with `jobId` and `sequence` on every job
//! event.

use cognicode_core::{JobEvent, JobId, Operation, SessionId};
use cognicode_engine::{JobSnapshot, SubmitOutcome};
use serde::Serialize;
use serde_json::{json, Value};

const CAMEL_TO_SNAKE: &[(&str, &str)] = &[
    ("sessionId", "session_id"),
    ("jobId", "job_id"),
    ("afterSequence", "after_sequence"),
    ("lastSequences", "last_sequences"),
];

/// Rename known camelCase keys. An existing snake_case key wins.
pub fn normalize_params(params: &Value) -> Value {
    let Some(obj) = params.as_object() else {
        return params.clone();
    };
    let mut result = obj.clone();
    for &(camel, snake) in CAMEL_TO_SNAKE {
        if !result.contains_key(snake) {
            if let Some(val) = result.remove(camel) {
                result.insert(snake.to_string(), val);
            }
        } else {
            result.remove(camel);
        }
    }
    Value::Object(result)
}

pub fn now_iso8601() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireEvent<'a> {
    #[serde(rename_all = "camelCase")]
    Progress {
        job_id: &'a JobId,
        sequence: u64,
        stage: &'a str,
        percent: u8,
        timestamp: String,
    },
    #[serde(rename_all = "camelCase")]
    Result {
        job_id: &'a JobId,
        sequence: u64,
        operation: Operation,
        data: &'a Value,
        cached: bool,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        job_id: &'a JobId,
        sequence: u64,
        kind: &'a str,
        message: &'a str,
        retryable: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<&'a str>,
    },
    #[serde(rename_all = "camelCase")]
    Cancelled { job_id: &'a JobId, sequence: u64 },
}

impl<'a> From<&'a JobEvent> for WireEvent<'a> {
    fn from(event: &'a JobEvent) -> Self {
        match event {
            JobEvent::Progress(p) => Self::Progress {
                job_id: &p.job_id,
                sequence: p.sequence,
                stage: &p.stage,
                percent: p.percent,
                timestamp: p
                    .timestamp
                    .to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            },
            JobEvent::Result {
                job_id,
                sequence,
                operation,
                data,
                cached,
            } => Self::Result {
                job_id,
                sequence: *sequence,
                operation: *operation,
                data,
                cached: *cached,
            },
            JobEvent::Error {
                job_id,
                sequence,
                kind,
                message,
                retryable,
                reason,
            } => Self::Error {
                job_id,
                sequence: *sequence,
                kind,
                message,
                retryable: *retryable,
                reason: reason.as_deref(),
            },
            JobEvent::Cancelled { job_id, sequence } => Self::Cancelled {
                job_id,
                sequence: *sequence,
            },
        }
    }
}

pub fn event_to_value(event: &JobEvent) -> Value {
    serde_json::to_value(WireEvent::from(event)).unwrap_or(Value::Null)
}

pub fn encode_event(event: &JobEvent) -> Option<String> {
    serde_json::to_string(&WireEvent::from(event)).ok()
}

/// First frame on every connection.
pub fn connected_frame(session_id: &SessionId) -> String {
    json!({
        "type": "connected",
        "sessionId": session_id,
        "serverTime": now_iso8601(),
    })
    .to_string()
}

pub fn submit_outcome(outcome: &SubmitOutcome) -> Value {
    json!({
        "jobId": outcome.job_id,
        "operation": outcome.operation,
        "fingerprint": outcome.fingerprint.to_hex(),
        "state": outcome.state.as_str(),
        "cached": outcome.cached,
        "deduplicated": outcome.deduplicated,
    })
}

pub fn job_snapshot(snapshot: &JobSnapshot) -> Value {
    json!({
        "jobId": snapshot.job_id,
        "operation": snapshot.operation,
        "fingerprint": snapshot.fingerprint.to_hex(),
        "state": snapshot.state.as_str(),
        "cached": snapshot.cached,
        "lastSequence": snapshot.last_sequence,
        "percent": snapshot.percent,
        "stage": snapshot.stage,
        "subscribers": snapshot.subscribers,
        "agentHandle": snapshot.agent_handle,
        "createdAt": snapshot.created_at,
        "startedAt": snapshot.started_at,
        "finishedAt": snapshot.finished_at,
    })
}
