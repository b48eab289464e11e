//! Client request model and admission validation.
//!
//! Validation happens before fingerprinting: a request that fails here never
//! reaches the cache, the in-flight table, or an agent.

use serde::{Deserialize, Serialize};

use crate::agent::InferenceRequest;
use crate::errors::ValidationError;
use crate::fingerprint::Fingerprint;
use crate::operation::Operation;

/// Language assumed when a client omits it.
pub const DEFAULT_LANGUAGE: &str = "javascript";

/// A request as it arrives on the wire.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct OperationRequest {
    pub operation: String,
    #[serde(default)]
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<serde_json::Value>,
}

/// Admission limits applied during validation.
#[derive(Clone, Debug)]
pub struct RequestLimits {
    pub max_snippet_bytes: usize,
    pub max_language_len: usize,
}

impl Default for RequestLimits {
    fn default() -> Self {
        Self {
            max_snippet_bytes: 16 * 1024 * 1024,
            max_language_len: 32,
        }
    }
}

/// A request that passed validation, with its snippet normalized.
#[derive(Clone, Debug, PartialEq)]
pub struct ValidatedRequest {
    pub operation: Operation,
    pub input: InferenceRequest,
}

impl ValidatedRequest {
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::compute(
            self.operation,
            &self.input.language,
            &self.input.snippet,
            &self.input.options,
        )
    }
}

impl OperationRequest {
    pub fn new(operation: Operation, code: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            operation: operation.as_str().to_string(),
            code: code.into(),
            language: Some(language.into()),
            options: None,
        }
    }

    pub fn with_options(mut self, options: serde_json::Value) -> Self {
        self.options = Some(options);
        self
    }

    pub fn validate(&self, limits: &RequestLimits) -> Result<ValidatedRequest, ValidationError> {
        let operation: Operation = self
            .operation
            .parse()
            .map_err(|_| ValidationError::UnknownOperation(self.operation.clone()))?;

        if self.code.len() > limits.max_snippet_bytes {
            return Err(ValidationError::CodeTooLarge {
                limit: limits.max_snippet_bytes,
                actual: self.code.len(),
            });
        }

        let snippet = normalize_snippet(&self.code);
        if snippet.is_empty() {
            return Err(ValidationError::EmptyCode);
        }

        let language = normalize_language(self.language.as_deref(), limits)?;

        let options = match &self.options {
            None | Some(serde_json::Value::Null) => serde_json::Map::new(),
            Some(serde_json::Value::Object(map)) => map.clone(),
            Some(_) => return Err(ValidationError::InvalidOptions),
        };

        Ok(ValidatedRequest {
            operation,
            input: InferenceRequest {
                snippet,
                language,
                options,
            },
        })
    }
}

fn normalize_language(raw: Option<&str>, limits: &RequestLimits) -> Result<String, ValidationError> {
    let language = raw
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .unwrap_or(DEFAULT_LANGUAGE)
        .to_lowercase();

    let valid_chars = language
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '#' | '-' | '_' | '.'));
    if language.len() > limits.max_language_len || !valid_chars {
        return Err(ValidationError::InvalidLanguage(language));
    }
    Ok(language)
}

/// Strip trailing whitespace per line and blank lines at both ends.
/// CRLF line endings are folded to LF.
pub fn normalize_snippet(code: &str) -> String {
    let lines: Vec<&str> = code.lines().map(str::trim_end).collect();
    let start = lines.iter().position(|l| !l.is_empty());
    let end = lines.iter().rposition(|l| !l.is_empty());
    match (start, end) {
        (Some(start), Some(end)) => lines[start..=end].join("\n"),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> RequestLimits {
        RequestLimits::default()
    }

    #[test]
    fn validates_minimal_request() {
        let req = OperationRequest::new(Operation::Analyze, "let x = 1;", "JavaScript");
        let valid = req.validate(&limits()).unwrap();
        assert_eq!(valid.operation, Operation::Analyze);
        assert_eq!(valid.input.language, "javascript");
        assert!(valid.input.options.is_empty());
    }

    #[test]
    fn language_defaults_to_javascript() {
        let req: OperationRequest =
            serde_json::from_str(r#"{"operation":"analyze","code":"f()"}"#).unwrap();
        assert_eq!(req.validate(&limits()).unwrap().input.language, "javascript");
    }

    #[test]
    fn rejects_unknown_operation() {
        let req = OperationRequest {
            operation: "lint".into(),
            code: "x".into(),
            ..Default::default()
        };
        assert_eq!(
            req.validate(&limits()),
            Err(ValidationError::UnknownOperation("lint".into()))
        );
    }

    #[test]
    fn rejects_blank_code() {
        let req = OperationRequest::new(Operation::Refactor, "  \n\t\n", "python");
        assert_eq!(req.validate(&limits()), Err(ValidationError::EmptyCode));
    }

    #[test]
    fn rejects_oversized_code() {
        let small = RequestLimits {
            max_snippet_bytes: 8,
            ..Default::default()
        };
        let req = OperationRequest::new(Operation::Analyze, "0123456789", "python");
        assert!(matches!(
            req.validate(&small),
            Err(ValidationError::CodeTooLarge { limit: 8, actual: 10 })
        ));
    }

    #[test]
    fn rejects_strange_language() {
        let req = OperationRequest::new(Operation::Analyze, "x", "java script");
        assert!(matches!(
            req.validate(&limits()),
            Err(ValidationError::InvalidLanguage(_))
        ));
        let req = OperationRequest::new(Operation::Analyze, "x", "c++");
        assert!(req.validate(&limits()).is_ok());
    }

    #[test]
    fn rejects_non_object_options() {
        let req = OperationRequest::new(Operation::Analyze, "x", "python")
            .with_options(serde_json::json!([1, 2]));
        assert_eq!(req.validate(&limits()), Err(ValidationError::InvalidOptions));

        let req = OperationRequest::new(Operation::Analyze, "x", "python")
            .with_options(serde_json::Value::Null);
        assert!(req.validate(&limits()).is_ok());
    }

    #[test]
    fn normalize_trims_edges_and_trailing_space() {
        let code = "\n\n  function f() {   \r\n    return 1;\t\n  }\n\n";
        assert_eq!(normalize_snippet(code), "  function f() {\n    return 1;\n  }");
    }

    #[test]
    fn whitespace_variants_share_a_fingerprint() {
        let a = OperationRequest::new(Operation::Analyze, "f(1)\n", "javascript");
        let b = OperationRequest::new(Operation::Analyze, "\nf(1)   \n\n", "JAVASCRIPT");
        assert_eq!(
            a.validate(&limits()).unwrap().fingerprint(),
            b.validate(&limits()).unwrap().fingerprint()
        );
    }
}
