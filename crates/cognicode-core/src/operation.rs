use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The three kinds of work an agent can perform. Each kind has its own pool.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Analyze,
    Refactor,
    GenerateTests,
}

impl Operation {
    pub const ALL: [Operation; 3] = [Self::Analyze, Self::Refactor, Self::GenerateTests];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Analyze => "analyze",
            Self::Refactor => "refactor",
            Self::GenerateTests => "generate_tests",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unknown operation name.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("unknown operation: {0}")]
pub struct UnknownOperation(pub String);

impl FromStr for Operation {
    type Err = UnknownOperation;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "analyze" => Ok(Self::Analyze),
            "refactor" => Ok(Self::Refactor),
            "generate_tests" => Ok(Self::GenerateTests),
            other => Err(UnknownOperation(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names() {
        assert_eq!(
            serde_json::to_string(&Operation::GenerateTests).unwrap(),
            "\"generate_tests\""
        );
        let op: Operation = serde_json::from_str("\"refactor\"").unwrap();
        assert_eq!(op, Operation::Refactor);
    }

    #[test]
    fn parse_matches_as_str() {
        for op in Operation::ALL {
            assert_eq!(op.as_str().parse::<Operation>().unwrap(), op);
        }
        assert!("lint".parse::<Operation>().is_err());
    }
}
