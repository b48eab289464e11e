use std::time::Duration;

use cognicode_core::{InferenceError, ProgressReporter};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

/// Coarse stages every built-in agent walks through.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Initializing,
    Running,
    Processing,
    Complete,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::Processing => "processing",
            Self::Complete => "complete",
        }
    }

    pub fn percent(&self) -> u8 {
        match self {
            Self::Initializing => 25,
            Self::Running => 50,
            Self::Processing => 75,
            Self::Complete => 100,
        }
    }
}

/// Drives stage reporting, simulated latency and cancellation checks for one
/// `infer` call.
pub(crate) struct StageRunner<'a> {
    progress: &'a dyn ProgressReporter,
    cancel: &'a CancellationToken,
    latency: Duration,
}

impl<'a> StageRunner<'a> {
    pub(crate) fn new(
        progress: &'a dyn ProgressReporter,
        cancel: &'a CancellationToken,
        latency: Duration,
    ) -> Self {
        Self {
            progress,
            cancel,
            latency,
        }
    }

    /// Report `stage`, then spend the simulated stage latency. Fails with a
    /// cancellation error as soon as the token fires.
    pub(crate) async fn enter(&self, stage: Stage) -> Result<(), InferenceError> {
        if self.cancel.is_cancelled() {
            return Err(InferenceError::cancelled());
        }
        self.progress.report(stage.as_str(), stage.percent());
        if stage == Stage::Complete || self.latency.is_zero() {
            return Ok(());
        }
        tokio::select! {
            _ = self.cancel.cancelled() => Err(InferenceError::cancelled()),
            _ = tokio::time::sleep(self.latency) => Ok(()),
        }
    }
}

/// Stamp a result with the producing agent, its model and the wall-clock time.
pub(crate) fn postprocess(mut fields: Map<String, Value>, agent: &str, model: &str) -> Value {
    fields.insert("agent".into(), Value::String(agent.to_string()));
    fields.insert("model".into(), Value::String(model.to_string()));
    fields.insert(
        "timestamp".into(),
        Value::String(chrono::Utc::now().to_rfc3339()),
    );
    Value::Object(fields)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder(Mutex<Vec<(String, u8)>>);

    impl ProgressReporter for Recorder {
        fn report(&self, stage: &str, percent: u8) {
            self.0.lock().unwrap().push((stage.to_string(), percent));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stages_report_in_order() {
        let recorder = Recorder(Mutex::new(Vec::new()));
        let cancel = CancellationToken::new();
        let runner = StageRunner::new(&recorder, &cancel, Duration::from_millis(100));
        for stage in [Stage::Initializing, Stage::Running, Stage::Processing, Stage::Complete] {
            runner.enter(stage).await.unwrap();
        }
        let seen = recorder.0.lock().unwrap().clone();
        let percents: Vec<u8> = seen.iter().map(|(_, p)| *p).collect();
        assert_eq!(percents, vec![25, 50, 75, 100]);
        assert_eq!(seen[0].0, "initializing");
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_latency() {
        let recorder = Recorder(Mutex::new(Vec::new()));
        let cancel = CancellationToken::new();
        let runner = StageRunner::new(&recorder, &cancel, Duration::from_secs(3600));
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });
        let err = runner.enter(Stage::Initializing).await.unwrap_err();
        assert!(err.is_cancellation());
        assert!(runner.enter(Stage::Running).await.unwrap_err().is_cancellation());
        assert_eq!(recorder.0.lock().unwrap().len(), 1);
    }

    #[test]
    fn postprocess_stamps_metadata() {
        let mut fields = Map::new();
        fields.insert("issues".into(), Value::Array(vec![]));
        let out = postprocess(fields, "LinterAgent", "rules-v1");
        assert_eq!(out["agent"], "LinterAgent");
        assert_eq!(out["model"], "rules-v1");
        assert!(out["timestamp"].as_str().is_some());
        assert!(out["issues"].is_array());
    }
}
