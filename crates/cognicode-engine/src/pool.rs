//! Fixed-size agent pools, one per operation kind.
//!
//! A pool's semaphore holds exactly one permit per idle handle, so a granted
//! permit always finds a handle in the idle queue. tokio semaphores queue
//! waiters FIFO, which gives arrival-order fairness within a kind; kinds
//! never share a queue.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cognicode_core::{Agent, AgentHandleId, Operation};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::{PerOperation, PoolConfig};

/// Builds the agent behind handle `index` of an operation's pool.
pub type AgentFactory = Arc<dyn Fn(Operation, usize) -> Arc<dyn Agent> + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("no agent available, estimated wait {estimated_wait_ms}ms")]
    Exhausted { estimated_wait_ms: u64 },
    #[error("agent pool is shut down")]
    Closed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AgentHandle {
    pub id: AgentHandleId,
    pub operation: Operation,
    pub busy: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct PoolStatus {
    pub operation: Operation,
    pub size: usize,
    pub busy: usize,
    pub idle: usize,
    pub waiting: usize,
    pub estimated_wait_ms: u64,
    pub handles: Vec<AgentHandle>,
}

struct Slot {
    id: AgentHandleId,
    agent: Arc<dyn Agent>,
}

struct KindPool {
    operation: Operation,
    ids: Vec<AgentHandleId>,
    semaphore: Arc<Semaphore>,
    idle: Mutex<VecDeque<Slot>>,
    waiting: AtomicUsize,
    // exponentially weighted average of how long a lease is held
    avg_hold_ms: AtomicU64,
    closed: AtomicBool,
}

impl KindPool {
    fn new(operation: Operation, size: usize, factory: &AgentFactory) -> Self {
        let slots: VecDeque<Slot> = (0..size)
            .map(|index| Slot {
                id: AgentHandleId::for_slot(operation, index),
                agent: factory(operation, index),
            })
            .collect();
        Self {
            operation,
            ids: slots.iter().map(|s| s.id.clone()).collect(),
            semaphore: Arc::new(Semaphore::new(size)),
            idle: Mutex::new(slots),
            waiting: AtomicUsize::new(0),
            avg_hold_ms: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Expected wait for a caller with `ahead` waiters in front of it.
    fn estimated_wait_ms(&self, ahead: usize) -> u64 {
        let size = self.ids.len().max(1) as u64;
        self.avg_hold_ms.load(Ordering::Relaxed) * (ahead as u64 / size + 1)
    }

    fn record_hold(&self, held: Duration) {
        let sample = held.as_millis() as u64;
        let prev = self.avg_hold_ms.load(Ordering::Relaxed);
        let next = if prev == 0 { sample } else { (prev * 4 + sample) / 5 };
        self.avg_hold_ms.store(next, Ordering::Relaxed);
    }

    fn status(&self) -> PoolStatus {
        let idle_ids: Vec<AgentHandleId> = self.idle.lock().iter().map(|s| s.id.clone()).collect();
        let handles: Vec<AgentHandle> = self
            .ids
            .iter()
            .map(|id| AgentHandle {
                id: id.clone(),
                operation: self.operation,
                busy: !idle_ids.contains(id),
            })
            .collect();
        PoolStatus {
            operation: self.operation,
            size: self.ids.len(),
            busy: self.ids.len() - idle_ids.len(),
            idle: idle_ids.len(),
            waiting: self.waiting.load(Ordering::Relaxed),
            estimated_wait_ms: self.estimated_wait_ms(self.waiting.load(Ordering::Relaxed)),
            handles,
        }
    }
}

struct WaitingGuard<'a>(&'a AtomicUsize);

impl<'a> WaitingGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Exclusive use of one agent handle. Dropping the lease returns the handle
/// to the idle queue, whatever happened to the job that held it.
pub struct AgentLease {
    handle: AgentHandle,
    agent: Arc<dyn Agent>,
    slot: Option<Slot>,
    pool: Arc<KindPool>,
    acquired_at: Instant,
    _permit: OwnedSemaphorePermit,
}

impl AgentLease {
    pub fn handle(&self) -> &AgentHandle {
        &self.handle
    }

    pub fn agent(&self) -> Arc<dyn Agent> {
        self.agent.clone()
    }

    /// Return the handle now. Same as dropping the lease.
    pub fn release(self) {}
}

impl Drop for AgentLease {
    fn drop(&mut self) {
        self.pool.record_hold(self.acquired_at.elapsed());
        if let Some(slot) = self.slot.take() {
            self.pool.idle.lock().push_back(slot);
        }
        debug!(handle = %self.handle.id, "agent handle released");
        // the permit drops after the slot is back in the queue
    }
}

/// Per-operation agent pools sharing one admission timeout.
pub struct AgentPool {
    kinds: PerOperation<Arc<KindPool>>,
    admission_timeout: Duration,
}

impl AgentPool {
    pub fn new(
        configs: &PerOperation<PoolConfig>,
        admission_timeout: Duration,
        factory: &AgentFactory,
    ) -> Self {
        let build = |op: Operation| Arc::new(KindPool::new(op, configs.get(op).size, factory));
        Self {
            kinds: PerOperation {
                analyze: build(Operation::Analyze),
                refactor: build(Operation::Refactor),
                generate_tests: build(Operation::GenerateTests),
            },
            admission_timeout,
        }
    }

    pub fn admission_timeout(&self) -> Duration {
        self.admission_timeout
    }

    /// Wait up to the admission timeout for an idle handle of `operation`.
    pub async fn acquire(&self, operation: Operation) -> Result<AgentLease, PoolError> {
        let pool = self.kinds.get(operation).clone();
        if pool.closed.load(Ordering::Acquire) {
            return Err(PoolError::Closed);
        }

        let permit = {
            let _waiting = WaitingGuard::enter(&pool.waiting);
            let acquire = pool.semaphore.clone().acquire_owned();
            match tokio::time::timeout(self.admission_timeout, acquire).await {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => return Err(PoolError::Closed),
                Err(_) => {
                    let ahead = pool.waiting.load(Ordering::Relaxed).saturating_sub(1);
                    let estimated_wait_ms = pool.estimated_wait_ms(ahead);
                    warn!(
                        operation = %operation,
                        waited_ms = self.admission_timeout.as_millis() as u64,
                        estimated_wait_ms,
                        "agent pool exhausted"
                    );
                    return Err(PoolError::Exhausted { estimated_wait_ms });
                }
            }
        };

        let Some(slot) = pool.idle.lock().pop_front() else {
            return Err(PoolError::Closed);
        };
        debug!(handle = %slot.id, operation = %operation, "agent handle acquired");
        Ok(AgentLease {
            handle: AgentHandle {
                id: slot.id.clone(),
                operation,
                busy: true,
            },
            agent: slot.agent.clone(),
            slot: Some(slot),
            pool,
            acquired_at: Instant::now(),
            _permit: permit,
        })
    }

    /// Return a handle to its pool.
    pub fn release(&self, lease: AgentLease) {
        lease.release();
    }

    pub fn status(&self, operation: Operation) -> PoolStatus {
        self.kinds.get(operation).status()
    }

    /// Fail every pending and future acquisition. Leases already out still
    /// return their handles normally.
    pub fn shutdown(&self) {
        for op in Operation::ALL {
            let pool = self.kinds.get(op);
            pool.closed.store(true, Ordering::Release);
            pool.semaphore.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cognicode_agents::{StubAgent, StubBehavior};
    use serde_json::json;

    fn pool(size: usize, admission: Duration) -> AgentPool {
        let factory: AgentFactory = Arc::new(|op, _| {
            Arc::new(StubAgent::new(op, StubBehavior::Succeed(json!({})))) as Arc<dyn Agent>
        });
        AgentPool::new(
            &PerOperation::uniform(PoolConfig {
                size,
                execution_timeout: Duration::from_secs(10),
            }),
            admission,
            &factory,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn lease_returns_handle_on_drop() {
        let pool = pool(2, Duration::from_secs(1));
        let lease = pool.acquire(Operation::Analyze).await.unwrap();
        assert_eq!(lease.handle().id.as_str(), "agent_analyze_0");
        assert!(lease.handle().busy);
        assert_eq!(lease.agent().operation(), Operation::Analyze);

        let status = pool.status(Operation::Analyze);
        assert_eq!((status.busy, status.idle), (1, 1));
        assert!(status.handles[0].busy);
        assert!(!status.handles[1].busy);

        pool.release(lease);
        let status = pool.status(Operation::Analyze);
        assert_eq!((status.busy, status.idle), (0, 2));
    }

    #[tokio::test(start_paused = true)]
    async fn kinds_are_independent() {
        let pool = pool(1, Duration::from_millis(100));
        let _analyze = pool.acquire(Operation::Analyze).await.unwrap();
        assert!(pool.acquire(Operation::Refactor).await.is_ok());
        assert_eq!(pool.status(Operation::GenerateTests).idle, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn admission_timeout_reports_exhausted() {
        let pool = pool(1, Duration::from_millis(500));
        let held = pool.acquire(Operation::Analyze).await.unwrap();
        let err = pool.acquire(Operation::Analyze).await.err().unwrap();
        assert!(matches!(err, PoolError::Exhausted { .. }));
        assert_eq!(pool.status(Operation::Analyze).waiting, 0);
        drop(held);
        assert!(pool.acquire(Operation::Analyze).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn waiters_are_served_in_arrival_order() {
        let pool = Arc::new(pool(1, Duration::from_secs(60)));
        let held = pool.acquire(Operation::Analyze).await.unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut tasks = Vec::new();
        for n in 0..3 {
            let pool = pool.clone();
            let order = order.clone();
            tasks.push(tokio::spawn(async move {
                let lease = pool.acquire(Operation::Analyze).await.unwrap();
                order.lock().push(n);
                tokio::time::sleep(Duration::from_millis(10)).await;
                drop(lease);
            }));
            // let each waiter enqueue before the next arrives
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(pool.status(Operation::Analyze).waiting, 3);
        drop(held);
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_fails_pending_acquisitions() {
        let pool = Arc::new(pool(1, Duration::from_secs(60)));
        let held = pool.acquire(Operation::Refactor).await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(Operation::Refactor).await })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;
        pool.shutdown();
        assert!(matches!(waiter.await.unwrap(), Err(PoolError::Closed)));
        assert!(matches!(pool.acquire(Operation::Analyze).await, Err(PoolError::Closed)));
        drop(held);
        assert_eq!(pool.status(Operation::Refactor).idle, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn estimate_tracks_hold_time() {
        let pool = pool(1, Duration::from_millis(10));
        let lease = pool.acquire(Operation::Analyze).await.unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        drop(lease);
        let _held = pool.acquire(Operation::Analyze).await.unwrap();
        match pool.acquire(Operation::Analyze).await {
            Err(PoolError::Exhausted { estimated_wait_ms }) => assert_eq!(estimated_wait_ms, 400),
            other => panic!("unexpected: {:?}", other.err()),
        }
    }
}
