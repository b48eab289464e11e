use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::Operation;

macro_rules! branded_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7()))
            }

            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

branded_id!(JobId, "job");
branded_id!(SessionId, "sess");
branded_id!(AgentHandleId, "agent");

impl AgentHandleId {
    /// Stable id for pool slot `index` of `operation`, e.g. `agent_analyze_0`.
    pub fn for_slot(operation: Operation, index: usize) -> Self {
        Self(format!("agent_{}_{index}", operation.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_prefixed_and_unique() {
        let a = JobId::new();
        let b = JobId::new();
        assert!(a.as_str().starts_with("job_"), "got: {a}");
        assert!(SessionId::new().as_str().starts_with("sess_"));
        assert_ne!(a, b);
    }

    #[test]
    fn job_ids_sort_by_creation() {
        let first = JobId::new();
        let second = JobId::new();
        assert!(first.as_str() < second.as_str());
    }

    #[test]
    fn slot_ids_name_the_operation() {
        assert_eq!(AgentHandleId::for_slot(Operation::GenerateTests, 2).as_str(), "agent_generate_tests_2");
        assert_ne!(
            AgentHandleId::for_slot(Operation::Analyze, 0),
            AgentHandleId::for_slot(Operation::Refactor, 0)
        );
    }

    #[test]
    fn session_id_round_trips_through_wire_forms() {
        let id = SessionId::from_raw("sess_resume");
        let parsed: SessionId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"sess_resume\"");
    }
}
