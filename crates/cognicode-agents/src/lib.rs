pub mod linter;
pub mod mock;
pub mod pipeline;
pub mod refactor;
pub mod source;
pub mod testgen;

pub use linter::LinterAgent;
pub use mock::{StubAgent, StubBehavior};
pub use pipeline::Stage;
pub use refactor::RefactorAgent;
pub use testgen::TestGenAgent;

use std::sync::Arc;
use std::time::Duration;

use cognicode_core::{Agent, Operation};

/// Build the rule-based agent for an operation. `stage_latency` is spent
/// after each progress stage to stand in for model inference cost.
pub fn builtin_agent(operation: Operation, stage_latency: Duration) -> Arc<dyn Agent> {
    match operation {
        Operation::Analyze => Arc::new(LinterAgent::new(stage_latency)),
        Operation::Refactor => Arc::new(RefactorAgent::new(stage_latency)),
        Operation::GenerateTests => Arc::new(TestGenAgent::new(stage_latency)),
    }
}
