//! The structured error carried by failed responses and RPC replies.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// An error with a numeric code, a message, free-form metadata and an
/// optional cause. Serialized as the `result` of a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{message} ({code})")]
pub struct CodeError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub meta: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<CodeError>>,
}

impl CodeError {
    pub const BAD_REQUEST: i32 = 400;
    pub const NOT_FOUND: i32 = 404;
    pub const TIMEOUT: i32 = 408;
    pub const SERVICE_ERROR: i32 = 500;
    pub const UNAVAILABLE: i32 = 503;
    /// Expected, caller-recoverable failure (e.g. a send to a gone connection).
    pub const WARNING: i32 = 555;

    pub fn new(code: i32, message: impl Into<String>) -> Self {
        CodeError {
            code,
            message: message.into(),
            meta: Map::new(),
            cause: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(Self::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(Self::NOT_FOUND, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(Self::TIMEOUT, message)
    }

    pub fn service_error(message: impl Into<String>) -> Self {
        Self::new(Self::SERVICE_ERROR, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(Self::UNAVAILABLE, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(Self::WARNING, message)
    }

    pub fn with_cause(mut self, cause: impl Into<CodeError>) -> Self {
        self.cause = Some(Box::new(cause.into()));
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    pub fn is_warning(&self) -> bool {
        self.code == Self::WARNING
    }
}

impl From<fns_ws::WsError> for CodeError {
    fn from(err: fns_ws::WsError) -> Self {
        if err.is_timeout() {
            CodeError::timeout(err.to_string())
        } else {
            CodeError::service_error(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serializes_without_empty_fields() {
        let err = CodeError::not_found("endpoint was not found");
        assert_eq!(
            serde_json::to_value(&err).unwrap(),
            json!({"code": 404, "message": "endpoint was not found"})
        );
    }

    #[test]
    fn cause_chain_roundtrips() {
        let err = CodeError::unavailable("node gw2 unreachable")
            .with_meta("node", "gw2@10.0.0.2:9100")
            .with_cause(CodeError::timeout("connect timed out"));
        let text = serde_json::to_string(&err).unwrap();
        let back: CodeError = serde_json::from_str(&text).unwrap();
        assert_eq!(back, err);
        assert_eq!(back.cause.unwrap().code, 408);
    }

    #[test]
    fn display_includes_code() {
        assert_eq!(CodeError::warning("connection was not found").to_string(), "connection was not found (555)");
    }
}
