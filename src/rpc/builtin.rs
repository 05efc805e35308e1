//! Methods served by the `jrpcd serve` binary.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};

use crate::context::{ConnectionContext, ConnectionId};

use super::methods::{MethodError, MethodRegistry, MethodTable};

/// `ping`, `echo`, `server.status` and `server.methods`.
pub fn builtin_methods() -> MethodTable {
    let started_at = Utc::now();
    let start_time = Instant::now();

    let mut table = MethodTable::new();

    table.register_fn("ping", |_, _| async { Ok::<_, MethodError>(json!("pong")) });

    table.register_fn("echo", |_, params: Option<Value>| async move {
        Ok::<_, MethodError>(params.unwrap_or(Value::Null))
    });

    table.register_fn("server.status", move |ctx: ConnectionContext, _| async move {
        #[derive(Serialize)]
        struct ServerStatus {
            version: &'static str,
            started_at: DateTime<Utc>,
            uptime_secs: u64,
            transport: &'static str,
            connection: Option<ConnectionId>,
        }

        let status = ServerStatus {
            version: env!("CARGO_PKG_VERSION"),
            started_at,
            uptime_secs: start_time.elapsed().as_secs(),
            transport: ctx.transport(),
            connection: ctx.connection_id(),
        };
        serde_json::to_value(status).map_err(|e| MethodError::Internal(e.into()))
    });

    let mut names = table.method_names();
    names.push("server.methods".to_string());
    names.sort();
    let names = Arc::new(names);
    table.register_fn("server.methods", move |_, _| {
        let names = names.clone();
        async move { Ok::<_, MethodError>(json!(*names)) }
    });

    table
}
