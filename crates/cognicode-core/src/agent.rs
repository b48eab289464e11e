use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::errors::InferenceError;
use crate::operation::Operation;

/// Input handed to an agent: the normalized snippet, lowercased language and
/// request options.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InferenceRequest {
    pub snippet: String,
    pub language: String,
    #[serde(default)]
    pub options: serde_json::Map<String, serde_json::Value>,
}

/// Sink for progress callbacks emitted by an agent while it works.
pub trait ProgressReporter: Send + Sync {
    /// `percent` is clamped to 0..=100 by the receiver.
    fn report(&self, stage: &str, percent: u8);
}

/// Reporter that discards everything.
pub struct NoopReporter;

impl ProgressReporter for NoopReporter {
    fn report(&self, _stage: &str, _percent: u8) {}
}

/// An inference unit for one operation kind.
///
/// The orchestrator treats `infer` as a black box: it never inspects the
/// returned value. Agents should poll `cancel` between expensive steps and
/// return [`InferenceError::cancelled`] when it fires; an agent that ignores
/// it is dropped after the cancellation grace period.
#[async_trait]
pub trait Agent: Send + Sync {
    fn operation(&self) -> Operation;
    fn name(&self) -> &str;
    fn model(&self) -> &str;

    async fn infer(
        &self,
        request: &InferenceRequest,
        progress: &dyn ProgressReporter,
        cancel: CancellationToken,
    ) -> Result<serde_json::Value, InferenceError>;
}
