//! Routes parsed requests to registered methods.

use std::sync::Arc;

use crate::context::ConnectionContext;

use super::methods::MethodRegistry;
use super::protocol::{Reply, Request};

/// Looks up and invokes methods. Holds no per-call state, so one instance
/// serves every connection concurrently.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<dyn MethodRegistry>,
}

impl Dispatcher {
    pub fn new(registry: Arc<dyn MethodRegistry>) -> Self {
        Self { registry }
    }

    /// Run one request to completion.
    ///
    /// Returns the reply to send, or `None` for notifications: a request
    /// without an id never gets a reply, whatever the outcome.
    pub async fn process_call(&self, ctx: &ConnectionContext, request: Request) -> Option<Reply> {
        let Request { method, params, id } = request;

        let Some(handler) = self.registry.lookup(&method) else {
            return id.map(|id| Reply::method_not_found(id, &method));
        };

        let outcome = handler.call(ctx.clone(), params).await;
        let id = id?;

        Some(match outcome {
            Ok(result) => Reply::success(id, result),
            Err(e) => Reply::error(id, e.into_rpc_error()),
        })
    }
}
