//! A single tracked unit of work and its sequence-numbered event log.
//!
//! All mutation of a job (state, log, subscribers) happens under one mutex,
//! and events are handed to subscribers while that mutex is held. Delivery is
//! a non-blocking enqueue, so this serializes sequence order per job without
//! ever waiting on a client.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use cognicode_core::{
    AgentHandleId, Fingerprint, JobEvent, JobFailure, JobId, Operation, ProgressEvent,
    ProgressReporter, SessionId,
};
use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Anything that can receive a job's events. Jobs only keep weak references
/// to subscribers, so a subscriber going away never affects execution.
pub trait JobSubscriber: Send + Sync {
    fn session_id(&self) -> &SessionId;

    /// Called before replay when the subscriber is attached to a job.
    /// `after_sequence` is the replay offset the caller asked for, if any.
    /// `history_from` is the first sequence still in the job's log.
    fn on_subscribed(&self, _job_id: &JobId, _after_sequence: Option<u64>, _history_from: u64) {}

    /// Hand over one event. Returning `false` drops the subscription.
    fn deliver(&self, event: &JobEvent) -> bool;
}

/// How a job ended.
#[derive(Debug)]
pub enum Outcome {
    Completed(serde_json::Value),
    Failed(JobFailure),
    Cancelled,
}

#[derive(Clone, Debug, Serialize)]
pub struct JobSnapshot {
    pub job_id: JobId,
    pub operation: Operation,
    pub fingerprint: Fingerprint,
    pub state: JobState,
    pub cached: bool,
    pub last_sequence: u64,
    pub percent: u8,
    pub stage: Option<String>,
    pub subscribers: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_handle: Option<AgentHandleId>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

struct JobInner {
    state: JobState,
    log: Vec<JobEvent>,
    next_sequence: u64,
    subscribers: HashMap<SessionId, Weak<dyn JobSubscriber>>,
    agent_handle: Option<AgentHandleId>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    stage: Option<String>,
    percent: u8,
}

impl JobInner {
    fn sequence(&mut self) -> u64 {
        let seq = self.next_sequence;
        self.next_sequence += 1;
        seq
    }

    fn broadcast(&mut self, event: &JobEvent) {
        self.subscribers.retain(|_, weak| match weak.upgrade() {
            Some(subscriber) => subscriber.deliver(event),
            None => false,
        });
    }

    fn record(&mut self, event: JobEvent) {
        self.broadcast(&event);
        self.log.push(event);
    }
}

pub struct Job {
    id: JobId,
    operation: Operation,
    fingerprint: Fingerprint,
    cached: bool,
    created_at: DateTime<Utc>,
    cancel: CancellationToken,
    inner: Mutex<JobInner>,
}

impl Job {
    pub fn new(operation: Operation, fingerprint: Fingerprint) -> Arc<Self> {
        Arc::new(Self::build(operation, fingerprint, false))
    }

    /// An already-completed job whose single event is the cached result.
    pub fn from_cache(operation: Operation, fingerprint: Fingerprint, data: serde_json::Value) -> Arc<Self> {
        let job = Self::build(operation, fingerprint, true);
        {
            let mut inner = job.inner.lock();
            let sequence = inner.sequence();
            inner.state = JobState::Completed;
            inner.percent = 100;
            inner.finished_at = Some(job.created_at);
            inner.log.push(JobEvent::Result {
                job_id: job.id.clone(),
                sequence,
                operation,
                data,
                cached: true,
            });
        }
        Arc::new(job)
    }

    fn build(operation: Operation, fingerprint: Fingerprint, cached: bool) -> Self {
        Self {
            id: JobId::new(),
            operation,
            fingerprint,
            cached,
            created_at: Utc::now(),
            cancel: CancellationToken::new(),
            inner: Mutex::new(JobInner {
                state: JobState::Queued,
                log: Vec::new(),
                next_sequence: 1,
                subscribers: HashMap::new(),
                agent_handle: None,
                started_at: None,
                finished_at: None,
                stage: None,
                percent: 0,
            }),
        }
    }

    pub fn id(&self) -> &JobId {
        &self.id
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// Synthetic job standing in for a cache hit.
    pub fn is_cached(&self) -> bool {
        self.cached
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn state(&self) -> JobState {
        self.inner.lock().state
    }

    /// Attach a subscriber and replay every logged event after
    /// `after_sequence` (from sequence 1 when `None`).
    pub fn subscribe(&self, subscriber: &Arc<dyn JobSubscriber>, after_sequence: Option<u64>) {
        let mut inner = self.inner.lock();
        let history_from = inner.log.first().map_or(inner.next_sequence, JobEvent::sequence);
        subscriber.on_subscribed(&self.id, after_sequence, history_from);
        let after = after_sequence.unwrap_or(0);
        let mut keep = true;
        for event in inner.log.iter().filter(|e| e.sequence() > after) {
            if !subscriber.deliver(event) {
                keep = false;
                break;
            }
        }
        if keep {
            inner
                .subscribers
                .insert(subscriber.session_id().clone(), Arc::downgrade(subscriber));
        }
    }

    pub fn is_subscribed(&self, session_id: &SessionId) -> bool {
        self.inner
            .lock()
            .subscribers
            .get(session_id)
            .is_some_and(|weak| weak.strong_count() > 0)
    }

    pub fn subscriber_count(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.subscribers.retain(|_, weak| weak.strong_count() > 0);
        inner.subscribers.len()
    }

    /// `Queued -> Running`. Fails if the job already left `Queued`.
    pub fn mark_running(&self, handle: AgentHandleId) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != JobState::Queued {
            return false;
        }
        inner.state = JobState::Running;
        inner.agent_handle = Some(handle);
        inner.started_at = Some(Utc::now());
        true
    }

    /// Append a progress event and broadcast it. Ignored unless running.
    pub fn progress(&self, stage: &str, percent: u8) {
        let mut inner = self.inner.lock();
        if inner.state != JobState::Running {
            return;
        }
        let percent = percent.min(100);
        let sequence = inner.sequence();
        inner.stage = Some(stage.to_string());
        inner.percent = percent;
        inner.record(JobEvent::Progress(ProgressEvent {
            job_id: self.id.clone(),
            sequence,
            stage: stage.to_string(),
            percent,
            timestamp: Utc::now(),
        }));
    }

    /// Move to a terminal state and broadcast the terminal event. Returns
    /// `None` when the job was already terminal.
    pub fn finish(&self, outcome: Outcome) -> Option<JobEvent> {
        let mut inner = self.inner.lock();
        if inner.state.is_terminal() {
            return None;
        }
        Some(self.finish_locked(&mut inner, outcome))
    }

    fn finish_locked(&self, inner: &mut JobInner, outcome: Outcome) -> JobEvent {
        let sequence = inner.sequence();
        let (state, event) = match outcome {
            Outcome::Completed(data) => (
                JobState::Completed,
                JobEvent::Result {
                    job_id: self.id.clone(),
                    sequence,
                    operation: self.operation,
                    data,
                    cached: false,
                },
            ),
            Outcome::Failed(failure) => (
                JobState::Failed,
                JobEvent::failure(self.id.clone(), sequence, &failure),
            ),
            Outcome::Cancelled => (
                JobState::Cancelled,
                JobEvent::Cancelled {
                    job_id: self.id.clone(),
                    sequence,
                },
            ),
        };
        inner.state = state;
        inner.finished_at = Some(Utc::now());
        if state == JobState::Completed {
            inner.percent = 100;
        }
        inner.record(event.clone());
        event
    }

    /// Cancel a queued job on the spot, or signal a running one.
    /// Returns the terminal event when the job was still queued.
    pub fn request_cancel(&self) -> Option<JobEvent> {
        let mut inner = self.inner.lock();
        match inner.state {
            JobState::Queued => {
                self.cancel.cancel();
                Some(self.finish_locked(&mut inner, Outcome::Cancelled))
            }
            JobState::Running => {
                self.cancel.cancel();
                None
            }
            _ => None,
        }
    }

    pub fn terminal_event(&self) -> Option<JobEvent> {
        self.inner
            .lock()
            .log
            .last()
            .filter(|e| e.is_terminal())
            .cloned()
    }

    pub fn events_after(&self, after_sequence: u64) -> Vec<JobEvent> {
        self.inner
            .lock()
            .log
            .iter()
            .filter(|e| e.sequence() > after_sequence)
            .cloned()
            .collect()
    }

    /// Drop progress history and subscribers, keeping only the terminal
    /// event. Used when a finished job moves to the retention table.
    pub fn compact(&self) {
        let mut inner = self.inner.lock();
        if !inner.state.is_terminal() {
            return;
        }
        inner.log.retain(JobEvent::is_terminal);
        inner.subscribers.clear();
    }

    pub fn snapshot(&self) -> JobSnapshot {
        let mut inner = self.inner.lock();
        inner.subscribers.retain(|_, weak| weak.strong_count() > 0);
        JobSnapshot {
            job_id: self.id.clone(),
            operation: self.operation,
            fingerprint: self.fingerprint,
            state: inner.state,
            cached: self.cached,
            last_sequence: inner.next_sequence - 1,
            percent: inner.percent,
            stage: inner.stage.clone(),
            subscribers: inner.subscribers.len(),
            agent_handle: inner.agent_handle.clone(),
            created_at: self.created_at,
            started_at: inner.started_at,
            finished_at: inner.finished_at,
        }
    }
}

impl ProgressReporter for Job {
    fn report(&self, stage: &str, percent: u8) {
        self.progress(stage, percent);
    }
}
