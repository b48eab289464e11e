//! Channel sessions: a client's registration with the jobs it follows.
//!
//! A session outlives its transport. Each transport is an [`event_channel`]
//! whose receiving end records which sequence the consumer actually took per
//! job. On reattach the session rewinds its cursors to those receipts, so
//! events that were queued but never read are replayed.
//!
//! Events for a job are only handed over in sequence order. A live event
//! that would skip ahead of the cursor is held back; the replay that follows
//! every reattach fills the gap from the job's log.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use cognicode_core::{JobEvent, JobId, SessionId};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::job::JobSubscriber;

/// Highest sequence per job the consumer has taken off a transport.
#[derive(Debug, Default)]
struct Receipts(Mutex<HashMap<JobId, u64>>);

impl Receipts {
    fn record(&self, event: &JobEvent) {
        let mut marks = self.0.lock();
        let mark = marks.entry(event.job_id().clone()).or_insert(0);
        *mark = (*mark).max(event.sequence());
    }

    fn revoke(&self, event: &JobEvent) {
        if let Some(mark) = self.0.lock().get_mut(event.job_id()) {
            *mark = (*mark).min(event.sequence().saturating_sub(1));
        }
    }

    fn get(&self, job_id: &JobId) -> u64 {
        self.0.lock().get(job_id).copied().unwrap_or(0)
    }

    fn set(&self, job_id: &JobId, sequence: u64) {
        self.0.lock().insert(job_id.clone(), sequence);
    }

    fn remove(&self, job_id: &JobId) {
        self.0.lock().remove(job_id);
    }
}

/// Sending half of a session transport.
#[derive(Clone, Debug)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<JobEvent>,
    receipts: Arc<Receipts>,
}

impl EventSender {
    pub fn send(&self, event: JobEvent) -> Result<(), mpsc::error::SendError<JobEvent>> {
        self.tx.send(event)
    }
}

/// Receiving half of a session transport. Taking an event off the channel
/// counts as delivering it.
#[derive(Debug)]
pub struct EventReceiver {
    rx: mpsc::UnboundedReceiver<JobEvent>,
    receipts: Arc<Receipts>,
}

impl EventReceiver {
    pub async fn recv(&mut self) -> Option<JobEvent> {
        let event = self.rx.recv().await?;
        self.receipts.record(&event);
        Some(event)
    }

    pub fn try_recv(&mut self) -> Option<JobEvent> {
        let event = self.rx.try_recv().ok()?;
        self.receipts.record(&event);
        Some(event)
    }

    /// Highest sequence of `job_id` taken off this transport so far.
    pub fn taken(&self, job_id: &JobId) -> u64 {
        self.receipts.get(job_id)
    }

    /// Withdraw the receipt for an event that could not be passed on, so a
    /// later resume replays it.
    pub fn undeliverable(&self, event: &JobEvent) {
        self.receipts.revoke(event);
    }
}

pub fn event_channel() -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let receipts = Arc::new(Receipts::default());
    (
        EventSender { tx, receipts: receipts.clone() },
        EventReceiver { rx, receipts },
    )
}

#[derive(Debug, Default)]
struct Follow {
    // last sequence handed to the current transport
    sent: u64,
    // sequence of the terminal event, once handed over
    terminal: Option<u64>,
}

struct SessionState {
    outbound: Option<EventSender>,
    // receipts of the most recent transport, kept across detach
    receipts: Arc<Receipts>,
    follows: HashMap<JobId, Follow>,
    // subscription order, for resume
    jobs: Vec<JobId>,
    detached_at: Option<Instant>,
}

impl SessionState {
    /// Drop jobs whose terminal event the consumer has taken.
    fn prune_finished(&mut self) {
        let receipts = self.receipts.clone();
        let finished: Vec<JobId> = self
            .follows
            .iter()
            .filter(|(job_id, f)| f.terminal.is_some_and(|t| receipts.get(job_id) >= t))
            .map(|(job_id, _)| job_id.clone())
            .collect();
        for job_id in finished {
            self.drop_job(&job_id);
        }
    }

    fn drop_job(&mut self, job_id: &JobId) {
        self.follows.remove(job_id);
        self.jobs.retain(|j| j != job_id);
        self.receipts.remove(job_id);
    }
}

pub struct ChannelSession {
    id: SessionId,
    created_at: chrono::DateTime<chrono::Utc>,
    state: Mutex<SessionState>,
}

impl ChannelSession {
    pub fn new(outbound: EventSender) -> Arc<Self> {
        Self::with_id(SessionId::new(), outbound)
    }

    pub fn with_id(id: SessionId, outbound: EventSender) -> Arc<Self> {
        Arc::new(Self {
            id,
            created_at: chrono::Utc::now(),
            state: Mutex::new(SessionState {
                receipts: outbound.receipts.clone(),
                outbound: Some(outbound),
                follows: HashMap::new(),
                jobs: Vec::new(),
                detached_at: None,
            }),
        })
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn created_at(&self) -> chrono::DateTime<chrono::Utc> {
        self.created_at
    }

    pub fn is_attached(&self) -> bool {
        self.state.lock().outbound.is_some()
    }

    /// Swap in a new transport. Cursors rewind to what the consumer of the
    /// previous transport actually took.
    pub fn attach(&self, outbound: EventSender) {
        let mut state = self.state.lock();
        state.prune_finished();
        let previous = std::mem::replace(&mut state.receipts, outbound.receipts.clone());
        for (job_id, follow) in state.follows.iter_mut() {
            let taken = follow.sent.min(previous.get(job_id));
            follow.sent = taken;
            follow.terminal = None;
            outbound.receipts.set(job_id, taken);
        }
        state.outbound = Some(outbound);
        state.detached_at = None;
    }

    pub fn detach(&self) {
        let mut state = self.state.lock();
        if state.outbound.take().is_some() {
            state.detached_at = Some(Instant::now());
        }
    }

    /// How long the session has been detached, if it is.
    pub fn detached_for(&self) -> Option<Duration> {
        self.state.lock().detached_at.map(|at| at.elapsed())
    }

    /// Jobs this session still follows, in subscription order. A job drops
    /// out once its terminal event has been taken by the consumer.
    pub fn subscriptions(&self) -> Vec<JobId> {
        let mut state = self.state.lock();
        state.prune_finished();
        state.jobs.clone()
    }

    /// Last sequence handed to the current transport for `job_id`.
    pub fn cursor(&self, job_id: &JobId) -> u64 {
        self.state.lock().follows.get(job_id).map_or(0, |f| f.sent)
    }

    pub fn forget(&self, job_id: &JobId) {
        self.state.lock().drop_job(job_id);
    }
}

impl JobSubscriber for ChannelSession {
    fn session_id(&self) -> &SessionId {
        &self.id
    }

    fn on_subscribed(&self, job_id: &JobId, after_sequence: Option<u64>, history_from: u64) {
        let mut state = self.state.lock();
        state.prune_finished();
        if !state.jobs.contains(job_id) {
            state.jobs.push(job_id.clone());
        }
        let follow = state.follows.entry(job_id.clone()).or_default();
        if let Some(after) = after_sequence {
            follow.sent = after;
            follow.terminal = None;
        }
        // history before `history_from` is gone; skip straight to it
        follow.sent = follow.sent.max(history_from.saturating_sub(1));
    }

    fn deliver(&self, event: &JobEvent) -> bool {
        let mut state = self.state.lock();
        let job_id = event.job_id();
        let sequence = event.sequence();
        let sent = state.follows.get(job_id).map_or(0, |f| f.sent);
        if sequence != sent + 1 {
            // duplicate, or ahead of a gap the next replay fills
            return true;
        }
        let Some(outbound) = &state.outbound else {
            return true;
        };
        if outbound.send(event.clone()).is_err() {
            debug!(session_id = %self.id, "transport closed, detaching session");
            state.outbound = None;
            state.detached_at = Some(Instant::now());
            return true;
        }
        let follow = state.follows.entry(job_id.clone()).or_default();
        follow.sent = sequence;
        if event.is_terminal() {
            follow.terminal = Some(sequence);
        }
        true
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct SessionCounts {
    pub total: usize,
    pub attached: usize,
}

/// Registry of live sessions.
#[derive(Default)]
pub struct SessionManager {
    sessions: DashMap<SessionId, Arc<ChannelSession>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self, outbound: EventSender) -> Arc<ChannelSession> {
        let session = ChannelSession::new(outbound);
        self.sessions.insert(session.id().clone(), session.clone());
        info!(session_id = %session.id(), "session opened");
        session
    }

    pub fn get(&self, id: &SessionId) -> Option<Arc<ChannelSession>> {
        self.sessions.get(id).map(|s| s.value().clone())
    }

    /// Reattach a lingering session to a new transport.
    pub fn reconnect(&self, id: &SessionId, outbound: EventSender) -> Option<Arc<ChannelSession>> {
        let session = self.get(id)?;
        session.attach(outbound);
        info!(session_id = %id, "session resumed");
        Some(session)
    }

    pub fn detach(&self, id: &SessionId) {
        if let Some(session) = self.get(id) {
            session.detach();
            info!(session_id = %id, "session detached");
        }
    }

    pub fn close(&self, id: &SessionId) -> bool {
        self.sessions.remove(id).is_some()
    }

    /// Drop sessions detached for longer than `linger`. Returns how many.
    pub fn sweep_expired(&self, linger: Duration) -> usize {
        let before = self.sessions.len();
        self.sessions
            .retain(|_, session| !matches!(session.detached_for(), Some(d) if d >= linger));
        let removed = before.saturating_sub(self.sessions.len());
        if removed > 0 {
            debug!(removed, "expired sessions swept");
        }
        removed
    }

    pub fn counts(&self) -> SessionCounts {
        let total = self.sessions.len();
        let attached = self.sessions.iter().filter(|s| s.is_attached()).count();
        SessionCounts { total, attached }
    }

    pub fn clear(&self) {
        self.sessions.clear();
    }
}
