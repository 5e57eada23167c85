//! JSON request and response envelopes exchanged over the WebSocket.
//!
//! Request: `{"service": "...", "fn": "...", "header": {...}, "payload": ...}`
//! Response: `{"succeed": bool, "result": ...}`

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::CodeError;

/// Case-sensitive string multimap. On the wire each value may be a single
/// string or an array of strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Header(BTreeMap<String, Vec<String>>);

impl Header {
    pub fn new() -> Self {
        Header(BTreeMap::new())
    }

    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.entry(name.into()).or_default().push(value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(|v| v.first()).map(String::as_str)
    }

    pub fn values(&self, name: &str) -> &[String] {
        self.0.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'de> Deserialize<'de> for Header {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum OneOrMany {
            One(String),
            Many(Vec<String>),
        }

        let raw = Option::<BTreeMap<String, OneOrMany>>::deserialize(deserializer)?;
        Ok(Header(
            raw.unwrap_or_default()
                .into_iter()
                .map(|(k, v)| match v {
                    OneOrMany::One(s) => (k, vec![s]),
                    OneOrMany::Many(v) => (k, v),
                })
                .collect(),
        ))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub service: String,
    #[serde(default, rename = "fn")]
    pub fn_name: String,
    #[serde(default)]
    pub header: Header,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("invalid request json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("request service is empty")]
    EmptyService,

    #[error("request fn is empty")]
    EmptyFn,
}

impl RequestError {
    /// The close code the client sees for this rejection.
    pub fn close_code(&self) -> u16 {
        match self {
            RequestError::Json(_) => fns_ws::CloseCode::PROTOCOL_ERROR,
            RequestError::EmptyService | RequestError::EmptyFn => fns_ws::CloseCode::INVALID_DATA,
        }
    }
}

impl Request {
    pub fn decode(bytes: &[u8]) -> Result<Request, RequestError> {
        let request: Request = serde_json::from_slice(bytes)?;
        if request.service.trim().is_empty() {
            return Err(RequestError::EmptyService);
        }
        if request.fn_name.trim().is_empty() {
            return Err(RequestError::EmptyFn);
        }
        Ok(request)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub succeed: bool,
    #[serde(default)]
    pub result: Value,
}

impl Response {
    pub fn succeed(result: Value) -> Self {
        Response {
            succeed: true,
            result,
        }
    }

    pub fn failed(err: &CodeError) -> Self {
        Response {
            succeed: false,
            result: serde_json::to_value(err).unwrap_or(Value::Null),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        // Serializing a struct of bool + Value cannot fail.
        serde_json::to_vec(self).unwrap_or_else(|_| b"null".to_vec())
    }

    /// The failure carried by a failed response, if it parses as one.
    pub fn error(&self) -> Option<CodeError> {
        if self.succeed {
            return None;
        }
        serde_json::from_value(self.result.clone())
            .ok()
            .or_else(|| Some(CodeError::service_error(self.result.to_string())))
    }
}
