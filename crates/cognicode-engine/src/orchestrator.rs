//! Job admission, de-duplication, scheduling and event fan-out.
//!
//! The cache and the in-flight table are the only state shared between
//! jobs. Both are touched for bookkeeping only; no lock is held while an
//! agent runs.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cognicode_core::{
    Fingerprint, InferenceError, InferenceRequest, JobEvent, JobFailure, JobId, Operation,
    OperationRequest, ProgressReporter, SessionId,
};
use cognicode_telemetry::MetricsRecorder;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

use crate::cache::{hit_rate, CacheStats, FingerprintCache};
use crate::config::{EngineConfig, PerOperation};
use crate::errors::OrchestratorError;
use crate::job::{Job, JobSnapshot, JobState, JobSubscriber, Outcome};
use crate::pool::{AgentFactory, AgentLease, AgentPool, PoolError, PoolStatus};
use crate::session::{ChannelSession, EventSender, SessionCounts, SessionManager};

#[derive(Default)]
struct OperationCounters {
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    executions: AtomicU64,
    deduplicated: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Per-operation view returned by [`Orchestrator::status`].
#[derive(Clone, Debug, Serialize)]
pub struct OperationStatus {
    #[serde(flatten)]
    pub pool: PoolStatus,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub hit_rate: f64,
    pub executions: u64,
    pub deduplicated: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub in_flight: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct EngineStatus {
    pub operations: Vec<OperationStatus>,
    pub cache: CacheStats,
    pub in_flight_jobs: usize,
    pub retained_jobs: usize,
    pub sessions: SessionCounts,
}

/// What `submit` did with a request.
#[derive(Clone, Debug, Serialize)]
pub struct SubmitOutcome {
    pub job_id: JobId,
    pub operation: Operation,
    pub fingerprint: Fingerprint,
    pub state: JobState,
    pub cached: bool,
    pub deduplicated: bool,
}

/// Result of [`Orchestrator::resume_session`].
#[derive(Clone)]
pub struct Resumed {
    pub session: Arc<ChannelSession>,
    /// Jobs re-subscribed and replayed.
    pub replayed: Vec<JobId>,
    /// Followed jobs that fell out of retention. Their final state is gone.
    pub expired: Vec<JobId>,
}

/// Finished jobs, kept for late subscribers. Cache-hit jobs have their own
/// bound so a burst of hits cannot push out real results.
#[derive(Default)]
struct Retained {
    finished: VecDeque<JobId>,
    cache_hits: VecDeque<JobId>,
    jobs: HashMap<JobId, Arc<Job>>,
}

struct Inner {
    config: EngineConfig,
    cache: FingerprintCache,
    pool: AgentPool,
    in_flight: DashMap<Fingerprint, Arc<Job>>,
    jobs: DashMap<JobId, Arc<Job>>,
    retained: Mutex<Retained>,
    counters: PerOperation<OperationCounters>,
    sessions: SessionManager,
    metrics: Arc<MetricsRecorder>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

/// Owns the cache, the agent pools, the in-flight table and the sessions.
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(config: EngineConfig, factory: AgentFactory) -> Self {
        Self::with_metrics(config, factory, Arc::new(MetricsRecorder::new()))
    }

    pub fn with_metrics(
        config: EngineConfig,
        factory: AgentFactory,
        metrics: Arc<MetricsRecorder>,
    ) -> Self {
        let pool = AgentPool::new(&config.pools, config.admission_timeout, &factory);
        let cache = FingerprintCache::new(&config.cache);
        Self {
            inner: Arc::new(Inner {
                config,
                cache,
                pool,
                in_flight: DashMap::new(),
                jobs: DashMap::new(),
                retained: Mutex::new(Retained::default()),
                counters: PerOperation {
                    analyze: OperationCounters::default(),
                    refactor: OperationCounters::default(),
                    generate_tests: OperationCounters::default(),
                },
                sessions: SessionManager::new(),
                metrics,
                shutdown: CancellationToken::new(),
                tasks: TaskTracker::new(),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn cache(&self) -> &FingerprintCache {
        &self.inner.cache
    }

    pub fn pool(&self) -> &AgentPool {
        &self.inner.pool
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.inner.sessions
    }

    pub fn metrics(&self) -> &Arc<MetricsRecorder> {
        &self.inner.metrics
    }

    pub fn open_session(&self, outbound: EventSender) -> Arc<ChannelSession> {
        self.inner.sessions.open(outbound)
    }

    /// Reattach a session and replay every job it still follows, each from
    /// the last sequence its consumer took. `last_seen` overrides that per job
    /// with what the client reports it rendered.
    pub fn resume_session(
        &self,
        session_id: &SessionId,
        outbound: EventSender,
        last_seen: &HashMap<JobId, u64>,
    ) -> Result<Resumed, OrchestratorError> {
        let session = self
            .inner
            .sessions
            .reconnect(session_id, outbound)
            .ok_or_else(|| OrchestratorError::UnknownSession(session_id.clone()))?;
        let subscriber: Arc<dyn JobSubscriber> = session.clone();
        let mut replayed = Vec::new();
        let mut expired = Vec::new();
        for job_id in session.subscriptions() {
            let after = last_seen.get(&job_id).copied();
            if self.subscribe(&subscriber, &job_id, after).is_ok() {
                replayed.push(job_id);
            } else {
                warn!(session_id = %session_id, job_id = %job_id, "followed job expired from retention");
                session.forget(&job_id);
                expired.push(job_id);
            }
        }
        Ok(Resumed {
            session,
            replayed,
            expired,
        })
    }

    pub fn detach_session(&self, session_id: &SessionId) {
        self.inner.sessions.detach(session_id);
    }

    /// Admit a request for `subscriber`: serve it from the cache, join the
    /// in-flight job with the same fingerprint, or queue a new job.
    #[instrument(skip_all, fields(session_id = %subscriber.session_id(), operation = %request.operation))]
    pub fn submit(
        &self,
        subscriber: Arc<dyn JobSubscriber>,
        request: &OperationRequest,
    ) -> Result<SubmitOutcome, OrchestratorError> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(OrchestratorError::ShuttingDown);
        }
        let validated = request.validate(&inner.config.limits)?;
        let fingerprint = validated.fingerprint();
        let operation = validated.operation;
        let counters = inner.counters.get(operation);

        if let Some(outcome) = inner.serve_cached(&subscriber, operation, fingerprint) {
            return Ok(outcome);
        }

        let job = match inner.in_flight.entry(fingerprint) {
            Entry::Occupied(existing) => {
                let job = existing.get().clone();
                drop(existing);
                bump(&counters.cache_misses);
                bump(&counters.deduplicated);
                job.subscribe(&subscriber, None);
                debug!(job_id = %job.id(), fingerprint = %fingerprint.short(), "joined in-flight job");
                return Ok(SubmitOutcome {
                    job_id: job.id().clone(),
                    operation,
                    fingerprint,
                    state: job.state(),
                    cached: false,
                    deduplicated: true,
                });
            }
            Entry::Vacant(slot) => {
                // a job for this fingerprint may have finished since the first lookup
                if let Some(outcome) = inner.serve_cached(&subscriber, operation, fingerprint) {
                    return Ok(outcome);
                }
                let job = Job::new(operation, fingerprint);
                slot.insert(job.clone());
                job
            }
        };

        inner.jobs.insert(job.id().clone(), job.clone());
        bump(&counters.cache_misses);
        job.subscribe(&subscriber, None);
        inner.publish_in_flight();
        info!(job_id = %job.id(), fingerprint = %fingerprint.short(), "job queued");

        inner
            .tasks
            .spawn(inner.clone().run(job.clone(), validated.input));

        Ok(SubmitOutcome {
            job_id: job.id().clone(),
            operation,
            fingerprint,
            state: JobState::Queued,
            cached: false,
            deduplicated: false,
        })
    }

    /// Attach `subscriber` to a job, in flight or retained, and replay its
    /// events after `after_sequence`.
    pub fn subscribe(
        &self,
        subscriber: &Arc<dyn JobSubscriber>,
        job_id: &JobId,
        after_sequence: Option<u64>,
    ) -> Result<JobSnapshot, OrchestratorError> {
        let job = self
            .inner
            .find(job_id)
            .ok_or_else(|| OrchestratorError::UnknownJob(job_id.clone()))?;
        job.subscribe(subscriber, after_sequence);
        Ok(job.snapshot())
    }

    /// Cancel a job on behalf of one of its subscribers. Cancellation applies
    /// to the job itself, so every subscriber sees the `cancelled` event.
    #[instrument(skip_all, fields(session_id = %session_id, job_id = %job_id))]
    pub fn cancel(&self, session_id: &SessionId, job_id: &JobId) -> Result<JobState, OrchestratorError> {
        let inner = &self.inner;
        let job = inner
            .find(job_id)
            .ok_or_else(|| OrchestratorError::UnknownJob(job_id.clone()))?;
        let state = job.state();
        if state.is_terminal() {
            return Ok(state);
        }
        if !job.is_subscribed(session_id) {
            return Err(OrchestratorError::NotSubscribed {
                session_id: session_id.clone(),
                job_id: job_id.clone(),
            });
        }
        match job.request_cancel() {
            Some(event) => {
                inner.record_terminal(&job, &event);
                inner.retire(&job);
            }
            None => info!("cancellation signalled to running agent"),
        }
        Ok(job.state())
    }

    /// Synchronous fallback: submit through the same path as streaming
    /// clients and wait for the terminal event.
    pub async fn submit_and_wait(
        &self,
        request: &OperationRequest,
    ) -> Result<(SubmitOutcome, JobEvent), OrchestratorError> {
        let (tx, rx) = oneshot::channel();
        let waiter: Arc<dyn JobSubscriber> = Arc::new(TerminalWaiter {
            id: SessionId::new(),
            tx: Mutex::new(Some(tx)),
        });
        let outcome = self.submit(waiter.clone(), request)?;
        let event = rx.await.map_err(|_| OrchestratorError::ShuttingDown)?;
        drop(waiter);
        Ok((outcome, event))
    }

    pub fn job(&self, job_id: &JobId) -> Option<Arc<Job>> {
        self.inner.find(job_id)
    }

    pub fn job_status(&self, job_id: &JobId) -> Result<JobSnapshot, OrchestratorError> {
        self.job(job_id)
            .map(|job| job.snapshot())
            .ok_or_else(|| OrchestratorError::UnknownJob(job_id.clone()))
    }

    pub fn status(&self) -> EngineStatus {
        let inner = &self.inner;
        let mut in_flight = PerOperation::uniform(0usize);
        for job in inner.jobs.iter() {
            *in_flight.get_mut(job.operation()) += 1;
        }
        let operations = Operation::ALL
            .into_iter()
            .map(|op| {
                let c = inner.counters.get(op);
                let hits = c.cache_hits.load(Ordering::Relaxed);
                let misses = c.cache_misses.load(Ordering::Relaxed);
                OperationStatus {
                    pool: inner.pool.status(op),
                    cache_hits: hits,
                    cache_misses: misses,
                    hit_rate: hit_rate(hits, misses),
                    executions: c.executions.load(Ordering::Relaxed),
                    deduplicated: c.deduplicated.load(Ordering::Relaxed),
                    completed: c.completed.load(Ordering::Relaxed),
                    failed: c.failed.load(Ordering::Relaxed),
                    cancelled: c.cancelled.load(Ordering::Relaxed),
                    in_flight: *in_flight.get(op),
                }
            })
            .collect();
        EngineStatus {
            operations,
            cache: inner.cache.stats(),
            in_flight_jobs: inner.jobs.len(),
            retained_jobs: inner.retained.lock().jobs.len(),
            sessions: inner.sessions.counts(),
        }
    }

    /// Periodic housekeeping: drop expired sessions and cache entries.
    /// Returns `(sessions, cache_entries)` removed.
    pub fn sweep(&self) -> (usize, usize) {
        let sessions = self
            .inner
            .sessions
            .sweep_expired(self.inner.config.session_linger);
        let entries = self.inner.cache.purge_expired();
        (sessions, entries)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Cancel every in-flight job, close the pools and clear the cache.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return;
        }
        inner.shutdown.cancel();
        info!(in_flight = inner.jobs.len(), "orchestrator shutting down");

        let jobs: Vec<Arc<Job>> = inner.jobs.iter().map(|e| e.value().clone()).collect();
        for job in jobs {
            if let Some(event) = job.request_cancel() {
                inner.record_terminal(&job, &event);
                inner.retire(&job);
            }
        }
        inner.pool.shutdown();
        inner.tasks.close();
        let grace = inner.config.cancel_grace + Duration::from_secs(1);
        if tokio::time::timeout(grace, inner.tasks.wait()).await.is_err() {
            warn!("jobs still running after shutdown grace");
        }
        inner.cache.invalidate_all();
    }
}

impl Inner {
    fn find(&self, job_id: &JobId) -> Option<Arc<Job>> {
        if let Some(job) = self.jobs.get(job_id) {
            return Some(job.value().clone());
        }
        self.retained.lock().jobs.get(job_id).cloned()
    }

    fn serve_cached(
        &self,
        subscriber: &Arc<dyn JobSubscriber>,
        operation: Operation,
        fingerprint: Fingerprint,
    ) -> Option<SubmitOutcome> {
        let entry = self.cache.get(&fingerprint)?;
        let tier = entry.tier;
        bump(&self.counters.get(operation).cache_hits);
        self.metrics.counter_inc(
            "cognicode_cache_hits_total",
            &[("operation", operation.as_str())],
            1,
        );
        let job = Job::from_cache(operation, fingerprint, entry.result);
        self.retain(job.clone());
        job.subscribe(subscriber, None);
        debug!(job_id = %job.id(), tier = ?tier, "served from cache");
        Some(SubmitOutcome {
            job_id: job.id().clone(),
            operation,
            fingerprint,
            state: JobState::Completed,
            cached: true,
            deduplicated: false,
        })
    }

    async fn run(self: Arc<Self>, job: Arc<Job>, input: InferenceRequest) {
        let operation = job.operation();
        let cancel = job.cancel_token().clone();

        let acquired = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            lease = self.pool.acquire(operation) => Some(lease),
        };
        let lease = match acquired {
            Some(Ok(lease)) => lease,
            None => {
                self.conclude(&job, Outcome::Cancelled);
                self.retire(&job);
                return;
            }
            Some(Err(PoolError::Exhausted { estimated_wait_ms })) => {
                let failure = JobFailure::ResourceExhausted {
                    operation,
                    waited: self.pool.admission_timeout(),
                    estimated_wait_ms,
                };
                self.conclude(&job, Outcome::Failed(failure));
                self.retire(&job);
                return;
            }
            Some(Err(PoolError::Closed)) => {
                self.conclude(&job, Outcome::Failed(JobFailure::PoolClosed));
                self.retire(&job);
                return;
            }
        };

        if !job.mark_running(lease.handle().id.clone()) {
            // cancelled while the lease was being granted
            drop(lease);
            self.retire(&job);
            return;
        }
        bump(&self.counters.get(operation).executions);
        info!(job_id = %job.id(), operation = %operation, handle = %lease.handle().id, "job running");

        let started = Instant::now();
        let outcome = self.execute(&job, &lease, &input).await;
        if let Outcome::Completed(data) = &outcome {
            self.cache.put(*job.fingerprint(), data.clone());
        }
        self.conclude(&job, outcome);
        self.metrics.histogram_observe(
            "cognicode_job_duration_ms",
            &[("operation", operation.as_str())],
            started.elapsed().as_secs_f64() * 1000.0,
        );
        drop(lease);
        self.retire(&job);
    }

    async fn execute(&self, job: &Arc<Job>, lease: &AgentLease, input: &InferenceRequest) -> Outcome {
        let operation = job.operation();
        let limit = self.config.pools.get(operation).execution_timeout;
        let cancel = job.cancel_token().clone();
        let agent = lease.agent();
        let reporter: &dyn ProgressReporter = job.as_ref();

        let infer = AssertUnwindSafe(agent.infer(input, reporter, cancel.clone())).catch_unwind();
        tokio::pin!(infer);
        let deadline = tokio::time::sleep(limit);
        tokio::pin!(deadline);

        tokio::select! {
            result = &mut infer => {
                return match result {
                    Ok(Ok(data)) => Outcome::Completed(data),
                    Ok(Err(e)) => classify_failure(job, e, &cancel),
                    Err(_) => {
                        warn!(job_id = %job.id(), agent = agent.name(), "agent panicked");
                        Outcome::Failed(JobFailure::Internal(format!("{} panicked", agent.name())))
                    }
                };
            }
            _ = &mut deadline => {
                warn!(
                    job_id = %job.id(),
                    operation = %operation,
                    limit_ms = limit.as_millis() as u64,
                    "execution timed out, force-releasing agent"
                );
                return Outcome::Failed(JobFailure::Timeout(limit));
            }
            _ = cancel.cancelled() => {}
        }

        let grace = self.config.cancel_grace;
        match tokio::time::timeout(grace, &mut infer).await {
            Ok(_) => debug!(job_id = %job.id(), "agent stopped after cancellation"),
            Err(_) => warn!(
                job_id = %job.id(),
                grace_ms = grace.as_millis() as u64,
                "agent ignored cancellation, force-releasing"
            ),
        }
        Outcome::Cancelled
    }

    fn conclude(&self, job: &Job, outcome: Outcome) {
        if let Some(event) = job.finish(outcome) {
            self.record_terminal(job, &event);
        }
    }

    fn record_terminal(&self, job: &Job, event: &JobEvent) {
        let operation = job.operation();
        let counters = self.counters.get(operation);
        match event {
            JobEvent::Result { .. } => bump(&counters.completed),
            JobEvent::Error { .. } => bump(&counters.failed),
            JobEvent::Cancelled { .. } => bump(&counters.cancelled),
            JobEvent::Progress(_) => return,
        }
        self.metrics.counter_inc(
            "cognicode_jobs_total",
            &[("operation", operation.as_str()), ("outcome", event.event_type())],
            1,
        );
        info!(
            job_id = %job.id(),
            operation = %operation,
            outcome = event.event_type(),
            sequence = event.sequence(),
            "job finished"
        );
    }

    /// Move a terminal job out of the in-flight table into retention.
    fn retire(&self, job: &Arc<Job>) {
        self.retain(job.clone());
        self.in_flight
            .remove_if(job.fingerprint(), |_, current| Arc::ptr_eq(current, job));
        self.jobs.remove(job.id());
        job.compact();
        self.publish_in_flight();
    }

    fn retain(&self, job: Arc<Job>) {
        let limit = self.config.finished_job_retention;
        let mut retained = self.retained.lock();
        let Retained {
            finished,
            cache_hits,
            jobs,
        } = &mut *retained;
        let order = if job.is_cached() { cache_hits } else { finished };
        if jobs.insert(job.id().clone(), job.clone()).is_none() {
            order.push_back(job.id().clone());
        }
        while order.len() > limit {
            if let Some(oldest) = order.pop_front() {
                jobs.remove(&oldest);
            }
        }
    }

    fn publish_in_flight(&self) {
        self.metrics
            .gauge_set("cognicode_in_flight_jobs", &[], self.in_flight.len() as f64);
    }
}

fn classify_failure(job: &Job, error: InferenceError, cancel: &CancellationToken) -> Outcome {
    if error.is_cancellation() && cancel.is_cancelled() {
        return Outcome::Cancelled;
    }
    warn!(job_id = %job.id(), kind = %error.kind, error = %error.message, "inference failed");
    Outcome::Failed(JobFailure::Inference(error))
}

/// One-shot subscriber behind [`Orchestrator::submit_and_wait`].
struct TerminalWaiter {
    id: SessionId,
    tx: Mutex<Option<oneshot::Sender<JobEvent>>>,
}

impl JobSubscriber for TerminalWaiter {
    fn session_id(&self) -> &SessionId {
        &self.id
    }

    fn deliver(&self, event: &JobEvent) -> bool {
        if !event.is_terminal() {
            return true;
        }
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(event.clone());
        }
        false
    }
}
