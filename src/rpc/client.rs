//! RPC client for talking to a running server.
//!
//! Posts one JSON-RPC request per HTTP call to the server's POST route.

use std::sync::atomic::{AtomicU64, Ordering};

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::protocol::{Reply, Request, RpcError};

/// RPC client for communicating with the server.
pub struct RpcClient {
    http: reqwest::Client,
    url: String,
    next_id: AtomicU64,
}

/// Error returned by RPC client operations.
#[derive(Debug)]
pub enum ClientError {
    /// Failed to reach the server
    Http(reqwest::Error),
    /// Server answered with an unexpected HTTP status
    Status(StatusCode),
    /// Failed to parse response
    Parse(serde_json::Error),
    /// Server sent no reply to a call
    EmptyReply,
    /// Server returned an error
    Rpc(RpcError),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Http(e) => write!(f, "Failed to reach server: {}", e),
            ClientError::Status(status) => write!(f, "Server responded with HTTP {}", status),
            ClientError::Parse(e) => write!(f, "Failed to parse response: {}", e),
            ClientError::EmptyReply => write!(f, "Server sent an empty reply"),
            ClientError::Rpc(e) => write!(f, "RPC error {}: {}", e.code, e.message),
        }
    }
}

impl std::error::Error for ClientError {}

impl RpcClient {
    /// Create a new client for the given POST route URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: url.into(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Call an RPC method and return the result.
    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<T, ClientError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = Request::new(method, params, Some(Value::from(id)));

        let response = self
            .http
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(ClientError::Http)?;

        match response.status() {
            StatusCode::OK => {}
            StatusCode::NO_CONTENT => return Err(ClientError::EmptyReply),
            status => return Err(ClientError::Status(status)),
        }

        let body = response.text().await.map_err(ClientError::Http)?;
        let reply = Reply::decode(&body).map_err(ClientError::Parse)?;

        match reply {
            Reply::Failure(failure) => Err(ClientError::Rpc(failure.error)),
            Reply::Success(success) => {
                serde_json::from_value(success.result).map_err(ClientError::Parse)
            }
        }
    }

    /// Call an RPC method with no parameters.
    pub async fn call_no_params<T: DeserializeOwned>(
        &self,
        method: &str,
    ) -> Result<T, ClientError> {
        self.call(method, None).await
    }

    /// Send a notification. The server answers with no body.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), ClientError> {
        let request = Request::new(method, params, None);

        let response = self
            .http
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(ClientError::Http)?;

        match response.status() {
            StatusCode::OK | StatusCode::NO_CONTENT => Ok(()),
            status => Err(ClientError::Status(status)),
        }
    }
}
