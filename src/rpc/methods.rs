//! Method registry.
//!
//! Maps method names to handlers. The dispatcher only ever looks methods up
//! and calls them; registration happens before the server starts.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use crate::context::ConnectionContext;

use super::protocol::{INTERNAL_ERROR, INVALID_PARAMS, RpcError};

/// Failure reported by a method handler.
#[derive(Debug, Error)]
pub enum MethodError {
    #[error("Invalid params: {0}")]
    InvalidParams(String),
    #[error("{message}")]
    Application {
        code: i32,
        message: String,
        data: Option<Value>,
    },
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl MethodError {
    /// Domain error with a handler-chosen code.
    pub fn application(code: i32, message: impl Into<String>) -> Self {
        MethodError::Application {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(self, data: Value) -> Self {
        match self {
            MethodError::Application { code, message, .. } => MethodError::Application {
                code,
                message,
                data: Some(data),
            },
            other => other,
        }
    }

    pub fn into_rpc_error(self) -> RpcError {
        match self {
            MethodError::InvalidParams(details) => RpcError::new(INVALID_PARAMS, details),
            MethodError::Application {
                code,
                message,
                data,
            } => RpcError {
                code,
                message,
                data,
            },
            MethodError::Internal(e) => RpcError::new(INTERNAL_ERROR, e.to_string()),
        }
    }
}

impl From<serde_json::Error> for MethodError {
    fn from(e: serde_json::Error) -> Self {
        MethodError::InvalidParams(e.to_string())
    }
}

/// Deserialize handler params; missing params are treated as JSON null.
pub fn parse_params<T: DeserializeOwned>(params: Option<Value>) -> Result<T, MethodError> {
    Ok(serde_json::from_value(params.unwrap_or(Value::Null))?)
}

/// A callable RPC method.
#[async_trait]
pub trait Method: Send + Sync {
    async fn call(
        &self,
        ctx: ConnectionContext,
        params: Option<Value>,
    ) -> Result<Value, MethodError>;
}

/// Lookup side of a method registry.
///
/// Implementations must be safe for concurrent lookup; the dispatcher is
/// shared by every connection.
pub trait MethodRegistry: Send + Sync {
    fn lookup(&self, method: &str) -> Option<Arc<dyn Method>>;

    fn method_names(&self) -> Vec<String>;
}

/// Adapts an async closure into a [`Method`].
pub struct FnMethod<F>(F);

impl<F> FnMethod<F> {
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F, Fut> Method for FnMethod<F>
where
    F: Fn(ConnectionContext, Option<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, MethodError>> + Send + 'static,
{
    async fn call(
        &self,
        ctx: ConnectionContext,
        params: Option<Value>,
    ) -> Result<Value, MethodError> {
        (self.0)(ctx, params).await
    }
}

/// In-memory registry keyed by method name.
#[derive(Default, Clone)]
pub struct MethodTable {
    methods: HashMap<String, Arc<dyn Method>>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a method, replacing any previous one with the same name.
    pub fn register(&mut self, name: impl Into<String>, method: impl Method + 'static) -> &mut Self {
        self.methods.insert(name.into(), Arc::new(method));
        self
    }

    pub fn register_fn<F, Fut>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(ConnectionContext, Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, MethodError>> + Send + 'static,
    {
        self.register(name, FnMethod::new(f))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

impl MethodRegistry for MethodTable {
    fn lookup(&self, method: &str) -> Option<Arc<dyn Method>> {
        self.methods.get(method).cloned()
    }

    fn method_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.methods.keys().cloned().collect();
        names.sort();
        names
    }
}
