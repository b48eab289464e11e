use std::time::Duration;

use cognicode_core::{Operation, RequestLimits};

/// One value per operation kind.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PerOperation<T> {
    pub analyze: T,
    pub refactor: T,
    pub generate_tests: T,
}

impl<T: Clone> PerOperation<T> {
    pub fn uniform(value: T) -> Self {
        Self {
            analyze: value.clone(),
            refactor: value.clone(),
            generate_tests: value,
        }
    }
}

impl<T> PerOperation<T> {
    pub fn get(&self, operation: Operation) -> &T {
        match operation {
            Operation::Analyze => &self.analyze,
            Operation::Refactor => &self.refactor,
            Operation::GenerateTests => &self.generate_tests,
        }
    }

    pub fn get_mut(&mut self, operation: Operation) -> &mut T {
        match operation {
            Operation::Analyze => &mut self.analyze,
            Operation::Refactor => &mut self.refactor,
            Operation::GenerateTests => &mut self.generate_tests,
        }
    }
}

/// Capacity and hard execution limit for one operation's agent pool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    pub size: usize,
    pub execution_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 3,
            execution_timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TierConfig {
    pub capacity: usize,
    pub ttl: Duration,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheConfig {
    pub fast: TierConfig,
    pub slow: TierConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            fast: TierConfig {
                capacity: 100,
                ttl: Duration::from_secs(5 * 60),
            },
            slow: TierConfig {
                capacity: 1000,
                ttl: Duration::from_secs(60 * 60),
            },
        }
    }
}

/// Everything the orchestrator needs to size and time its work.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub pools: PerOperation<PoolConfig>,
    /// Longest a job waits for an agent before failing with resource_exhausted.
    pub admission_timeout: Duration,
    /// How long a cancelled agent gets to stop before it is dropped.
    pub cancel_grace: Duration,
    pub cache: CacheConfig,
    /// How long a disconnected session stays resumable.
    pub session_linger: Duration,
    /// Retired jobs whose terminal event stays available for late subscribers.
    pub finished_job_retention: usize,
    pub limits: RequestLimits,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pools: PerOperation::uniform(PoolConfig::default()),
            admission_timeout: Duration::from_secs(30),
            cancel_grace: Duration::from_secs(5),
            cache: CacheConfig::default(),
            session_linger: Duration::from_secs(120),
            finished_job_retention: 256,
            limits: RequestLimits::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid value for {key}: {value:?}")]
pub struct ConfigError {
    pub key: &'static str,
    pub value: String,
}

impl EngineConfig {
    /// Defaults overlaid with `COGNICODE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`EngineConfig::from_env`] with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let num = |keys: &[&'static str]| -> Result<Option<u64>, ConfigError> {
            for &key in keys {
                if let Some(raw) = lookup(key) {
                    let parsed = raw.trim().parse::<u64>();
                    return parsed.map(Some).map_err(|_| ConfigError { key, value: raw });
                }
            }
            Ok(None)
        };

        if let Some(size) = num(&["COGNICODE_POOL_SIZE", "AGENT_POOL_SIZE"])? {
            for op in Operation::ALL {
                config.pools.get_mut(op).size = size as usize;
            }
        }
        for (op, key) in [
            (Operation::Analyze, "COGNICODE_POOL_SIZE_ANALYZE"),
            (Operation::Refactor, "COGNICODE_POOL_SIZE_REFACTOR"),
            (Operation::GenerateTests, "COGNICODE_POOL_SIZE_GENERATE_TESTS"),
        ] {
            if let Some(size) = num(&[key])? {
                config.pools.get_mut(op).size = size as usize;
            }
        }
        if let Some(secs) = num(&["COGNICODE_EXEC_TIMEOUT_SECS"])? {
            for op in Operation::ALL {
                config.pools.get_mut(op).execution_timeout = Duration::from_secs(secs);
            }
        }
        if let Some(ms) = num(&["COGNICODE_ADMISSION_TIMEOUT_MS"])? {
            config.admission_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = num(&["COGNICODE_CANCEL_GRACE_MS"])? {
            config.cancel_grace = Duration::from_millis(ms);
        }
        if let Some(secs) = num(&["COGNICODE_CACHE_TTL_SECS", "CACHE_TIMEOUT"])? {
            config.cache.slow.ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = num(&["COGNICODE_FAST_CACHE_TTL_SECS"])? {
            config.cache.fast.ttl = Duration::from_secs(secs);
        }
        if let Some(n) = num(&["COGNICODE_FAST_CACHE_CAPACITY"])? {
            config.cache.fast.capacity = n as usize;
        }
        if let Some(n) = num(&["COGNICODE_SLOW_CACHE_CAPACITY"])? {
            config.cache.slow.capacity = n as usize;
        }
        if let Some(secs) = num(&["COGNICODE_SESSION_LINGER_SECS"])? {
            config.session_linger = Duration::from_secs(secs);
        }
        if let Some(bytes) = num(&["COGNICODE_MAX_CODE_BYTES", "MAX_CONTENT_LENGTH"])? {
            config.limits.max_snippet_bytes = bytes as usize;
        }
        Ok(config)
    }
}
