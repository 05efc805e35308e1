use std::fmt;

use serde::Serialize;
use uuid::Uuid;

/// Identity of one live WebSocket connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Where a call came from. The dispatcher forwards this to method handlers
/// without looking at it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionContext {
    /// A single HTTP POST exchange.
    Post,
    /// A frame on a long-lived WebSocket connection.
    WebSocket(ConnectionId),
}

impl ConnectionContext {
    pub fn transport(&self) -> &'static str {
        match self {
            ConnectionContext::Post => "post",
            ConnectionContext::WebSocket(_) => "websocket",
        }
    }

    pub fn connection_id(&self) -> Option<ConnectionId> {
        match self {
            ConnectionContext::Post => None,
            ConnectionContext::WebSocket(id) => Some(*id),
        }
    }
}
