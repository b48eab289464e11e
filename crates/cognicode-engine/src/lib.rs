//! Agent orchestration: result cache, agent pools, jobs and channel sessions.

pub mod cache;
pub mod config;
pub mod errors;
pub mod job;
pub mod orchestrator;
pub mod pool;
pub mod session;

pub use cache::{CacheEntry, CacheStats, FingerprintCache, TierKind, TierStats};
pub use config::{CacheConfig, ConfigError, EngineConfig, PerOperation, PoolConfig, TierConfig};
pub use errors::OrchestratorError;
pub use job::{Job, JobSnapshot, JobState, JobSubscriber, Outcome};
pub use orchestrator::{EngineStatus, OperationStatus, Orchestrator, Resumed, SubmitOutcome};
pub use pool::{AgentFactory, AgentHandle, AgentLease, AgentPool, PoolError, PoolStatus};
pub use session::{event_channel, ChannelSession, EventReceiver, EventSender, SessionCounts, SessionManager};
