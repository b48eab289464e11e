use cognicode_engine::OrchestratorError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Inbound frame: `{ id?, method, params? }`.
#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default)]
    pub id: Option<Value>,
}

/// Outbound reply: `{ id, success, result?, error?: { code, message, data? } }`.
#[derive(Debug, Serialize)]
pub struct RpcResponse {
    pub id: Option<Value>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

/// `code` is a string so clients can match on it directly. Protocol errors use
/// [`ErrorCode`]; orchestrator rejections use their upper-cased kind.
#[derive(Debug, Serialize)]
pub struct RpcError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Protocol-level failures, independent of any job.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    ParseError,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ParseError => "PARSE_ERROR",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::MethodNotFound => "METHOD_NOT_FOUND",
            Self::InvalidParams => "INVALID_PARAMS",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl RpcResponse {
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self { id, success: true, result: Some(result), error: None }
    }

    pub fn error(id: Option<Value>, code: ErrorCode, message: impl Into<String>) -> Self {
        Self::failure(id, code.as_str().to_string(), message.into(), None)
    }

    fn failure(id: Option<Value>, code: String, message: String, data: Option<Value>) -> Self {
        Self {
            id,
            success: false,
            result: None,
            error: Some(RpcError { code, message, data }),
        }
    }

    /// Orchestrator rejections carry their stable kind as the code.
    pub fn rejected(id: Option<Value>, err: &OrchestratorError) -> Self {
        let kind = err.kind();
        Self::failure(
            id,
            kind.to_ascii_uppercase(),
            err.to_string(),
            Some(json!({ "kind": kind, "retryable": err.is_retryable() })),
        )
    }

    pub fn method_not_found(id: Option<Value>, method: &str) -> Self {
        Self::error(id, ErrorCode::MethodNotFound, format!("unknown method '{method}'"))
    }

    pub fn invalid_params(id: Option<Value>, msg: impl Into<String>) -> Self {
        Self::error(id, ErrorCode::InvalidParams, msg)
    }

    pub fn internal_error(id: Option<Value>, msg: impl Into<String>) -> Self {
        Self::error(id, ErrorCode::InternalError, msg)
    }

    /// The frame could not be decoded, so there is no id to echo.
    pub fn parse_error() -> Self {
        Self::error(None, ErrorCode::ParseError, "frame is not a valid request")
    }
}

pub fn require_str<'a>(params: &'a Value, key: &str) -> Result<&'a str, String> {
    params
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| format!("missing string parameter '{key}'"))
}

pub fn optional_str<'a>(params: &'a Value, key: &str) -> Option<&'a str> {
    params.get(key).and_then(Value::as_str)
}

/// Optional non-negative integer. Present-but-invalid values are an error.
pub fn optional_u64(params: &Value, key: &str) -> Result<Option<u64>, String> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_u64()
            .map(Some)
            .ok_or_else(|| format!("parameter '{key}' must be a non-negative integer")),
    }
}

/// Optional `{ key: non-negative integer }` object.
pub fn optional_u64_map(params: &Value, key: &str) -> Result<Vec<(String, u64)>, String> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Object(map)) => map
            .iter()
            .map(|(k, v)| {
                v.as_u64()
                    .map(|n| (k.clone(), n))
                    .ok_or_else(|| format!("parameter '{key}.{k}' must be a non-negative integer"))
            })
            .collect(),
        Some(_) => Err(format!("parameter '{key}' must be an object")),
    }
}
