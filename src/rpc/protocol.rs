//! JSON-RPC message types.
//!
//! Requests, replies and error objects, plus their wire encoding.
//! A reply is either `{"id":..,"result":..}` or `{"id":..,"error":{..}}`.
//! See: https://www.jsonrpc.org/specification

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

// Standard JSON-RPC 2.0 error codes
pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;

// Implementation-defined server errors
pub const SERVER_ERROR_START: i32 = -32099;
pub const SERVER_ERROR_END: i32 = -32000;

/// Used when a reply cannot be serialized.
const ENCODE_FALLBACK: &str =
    r#"{"id":null,"error":{"code":-32603,"message":"Serialization error"}}"#;

/// A JSON-RPC call or notification.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Request {
    /// Method name to invoke. Never empty.
    pub method: String,
    /// Parameters, passed through to the handler untouched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Request identifier. `None` marks a notification; `Some(Value::Null)`
    /// is an explicit null id and still expects a reply.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
}

/// Why a JSON value is not a usable request envelope.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidRequest {
    #[error("request must be a JSON object")]
    NotAnObject,
    #[error("request has no \"method\" member")]
    MissingMethod,
    #[error("\"method\" must be a string")]
    MethodNotString,
    #[error("\"method\" must not be empty")]
    EmptyMethod,
}

impl Request {
    pub fn new(method: impl Into<String>, params: Option<Value>, id: Option<Value>) -> Self {
        Self {
            method: method.into(),
            params,
            id,
        }
    }

    /// Decode a request from an already-parsed JSON value.
    ///
    /// Only the envelope is checked: `params` and `id` are kept verbatim and
    /// any other member (such as `jsonrpc`) is ignored.
    pub fn from_json(json: Value) -> Result<Self, InvalidRequest> {
        let Value::Object(mut object) = json else {
            return Err(InvalidRequest::NotAnObject);
        };

        let method = match object.remove("method") {
            Some(Value::String(method)) if method.is_empty() => {
                return Err(InvalidRequest::EmptyMethod);
            }
            Some(Value::String(method)) => method,
            Some(_) => return Err(InvalidRequest::MethodNotString),
            None => return Err(InvalidRequest::MissingMethod),
        };

        Ok(Self {
            method,
            params: object.remove("params"),
            id: object.remove("id"),
        })
    }

    /// Check if this request is a notification (no response expected).
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn invalid_request() -> Self {
        Self::new(INVALID_REQUEST, "Invalid request")
    }

    pub fn method_not_found() -> Self {
        Self::new(METHOD_NOT_FOUND, "Method not found")
    }

    pub fn invalid_params(details: impl Into<String>) -> Self {
        Self::new(INVALID_PARAMS, details)
    }

    pub fn internal_error(details: impl Into<String>) -> Self {
        Self::new(INTERNAL_ERROR, details)
    }

    /// Whether the code lies in the implementation-defined server range.
    pub fn is_server_error(&self) -> bool {
        (SERVER_ERROR_START..=SERVER_ERROR_END).contains(&self.code)
    }
}

/// Successful reply to a call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: Value,
    pub result: Value,
}

/// Failed reply. `id` is JSON null when the request id could not be read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub id: Value,
    pub error: RpcError,
}

/// The single outcome sent back for a call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Reply {
    Failure(ErrorResponse),
    Success(Response),
}

impl Reply {
    pub fn success(id: Value, result: Value) -> Self {
        Reply::Success(Response { id, result })
    }

    pub fn error(id: Value, error: RpcError) -> Self {
        Reply::Failure(ErrorResponse { id, error })
    }

    pub fn method_not_found(id: Value, method: &str) -> Self {
        Self::error(
            id,
            RpcError::new(METHOD_NOT_FOUND, format!("Method not found: {}", method)),
        )
    }

    pub fn id(&self) -> &Value {
        match self {
            Reply::Failure(failure) => &failure.id,
            Reply::Success(success) => &success.id,
        }
    }

    pub fn result(&self) -> Option<&Value> {
        match self {
            Reply::Success(success) => Some(&success.result),
            Reply::Failure(_) => None,
        }
    }

    pub fn rpc_error(&self) -> Option<&RpcError> {
        match self {
            Reply::Failure(failure) => Some(&failure.error),
            Reply::Success(_) => None,
        }
    }

    /// Encode to the wire envelope.
    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| ENCODE_FALLBACK.to_string())
    }

    /// Parse a wire envelope back into a reply.
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
