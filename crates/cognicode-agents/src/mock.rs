use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cognicode_core::{Agent, InferenceError, InferenceRequest, Operation, ProgressReporter};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

/// Pre-programmed behavior for deterministic testing without real inference.
#[derive(Clone, Debug)]
pub enum StubBehavior {
    /// Return this value.
    Succeed(Value),
    /// Return the request back as `{snippet, language, options}`.
    Echo,
    /// Fail with this error.
    Fail(InferenceError),
    /// Wait a duration (cooperatively cancellable), then run the inner behavior.
    Delay(Duration, Box<StubBehavior>),
    /// Report each `(stage, percent)` with `step` between them, then run the
    /// inner behavior.
    Progress(Vec<(String, u8)>, Duration, Box<StubBehavior>),
    /// Never return and ignore cancellation.
    Hang,
}

impl StubBehavior {
    pub fn delayed(delay: Duration, inner: StubBehavior) -> Self {
        Self::Delay(delay, Box::new(inner))
    }

    /// The four standard stages spaced `step` apart, then `inner`.
    pub fn staged(step: Duration, inner: StubBehavior) -> Self {
        Self::Progress(
            vec![
                ("initializing".into(), 25),
                ("running".into(), 50),
                ("processing".into(), 75),
                ("complete".into(), 100),
            ],
            step,
            Box::new(inner),
        )
    }
}

struct Shared {
    script: Vec<StubBehavior>,
    calls: AtomicUsize,
    active: AtomicUsize,
    peak_active: AtomicUsize,
}

/// Scripted agent with an execution counter shared by every clone, so a pool
/// of clones reports the total number of `infer` calls.
#[derive(Clone)]
pub struct StubAgent {
    operation: Operation,
    shared: Arc<Shared>,
}

impl StubAgent {
    /// Same behavior on every call.
    pub fn new(operation: Operation, behavior: StubBehavior) -> Self {
        Self::scripted(operation, vec![behavior])
    }

    /// Call `i` runs `script[i]`; calls past the end repeat the last entry.
    pub fn scripted(operation: Operation, script: Vec<StubBehavior>) -> Self {
        Self {
            operation,
            shared: Arc::new(Shared {
                script,
                calls: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                peak_active: AtomicUsize::new(0),
            }),
        }
    }

    /// Number of `infer` invocations so far.
    pub fn executions(&self) -> usize {
        self.shared.calls.load(Ordering::SeqCst)
    }

    /// Invocations currently inside `infer`.
    pub fn active(&self) -> usize {
        self.shared.active.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous `infer` calls observed.
    pub fn peak_active(&self) -> usize {
        self.shared.peak_active.load(Ordering::SeqCst)
    }
}

struct ActiveGuard<'a>(&'a Shared);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Agent for StubAgent {
    fn operation(&self) -> Operation {
        self.operation
    }

    fn name(&self) -> &str {
        "stub"
    }

    fn model(&self) -> &str {
        "stub-model"
    }

    async fn infer(
        &self,
        request: &InferenceRequest,
        progress: &dyn ProgressReporter,
        cancel: CancellationToken,
    ) -> Result<Value, InferenceError> {
        let idx = self.shared.calls.fetch_add(1, Ordering::SeqCst);
        let now_active = self.shared.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.peak_active.fetch_max(now_active, Ordering::SeqCst);
        // dropped on return and when the orchestrator abandons the future
        let _guard = ActiveGuard(&self.shared);

        let Some(behavior) = self
            .shared
            .script
            .get(idx)
            .or_else(|| self.shared.script.last())
        else {
            return Err(InferenceError::new(
                "stub",
                format!("StubAgent: no behavior configured for call {idx}"),
            ));
        };

        // Unrolls nested behaviors iteratively to avoid recursive async.
        let mut current = behavior;
        loop {
            match current {
                StubBehavior::Succeed(value) => return Ok(value.clone()),
                StubBehavior::Echo => {
                    return Ok(json!({
                        "snippet": request.snippet,
                        "language": request.language,
                        "options": request.options,
                    }))
                }
                StubBehavior::Fail(e) => return Err(e.clone()),
                StubBehavior::Delay(duration, inner) => {
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(InferenceError::cancelled()),
                        _ = tokio::time::sleep(*duration) => {}
                    }
                    current = inner;
                }
                StubBehavior::Progress(steps, step, inner) => {
                    for (stage, percent) in steps {
                        if cancel.is_cancelled() {
                            return Err(InferenceError::cancelled());
                        }
                        progress.report(stage, *percent);
                        tokio::select! {
                            _ = cancel.cancelled() => return Err(InferenceError::cancelled()),
                            _ = tokio::time::sleep(*step) => {}
                        }
                    }
                    current = inner;
                }
                StubBehavior::Hang => std::future::pending::<()>().await,
            }
        }
    }
}
