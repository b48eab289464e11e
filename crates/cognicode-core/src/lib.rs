pub mod agent;
pub mod errors;
pub mod events;
pub mod fingerprint;
pub mod ids;
pub mod operation;
pub mod request;

pub use agent::{Agent, InferenceRequest, ProgressReporter};
pub use errors::{InferenceError, JobFailure, ValidationError};
pub use events::{JobEvent, ProgressEvent};
pub use fingerprint::Fingerprint;
pub use ids::{AgentHandleId, JobId, SessionId};
pub use operation::Operation;
pub use request::{OperationRequest, RequestLimits, ValidatedRequest};
