//! JSON-RPC over HTTP POST and WebSocket.
//!
//! ## Architecture
//!
//! - `protocol`: request/reply types and their wire encoding
//! - `methods`: method registry contract and the in-memory `MethodTable`
//! - `dispatcher`: looks methods up and turns outcomes into replies
//! - `adapter`: listeners that connect the web routes to the dispatcher
//! - `server`: owns the routes and adapters
//! - `builtin`: methods shipped with the binary
//! - `client`: client for calling a running server over HTTP POST
//!
//! Requests without an `id` are notifications and never get a reply, on
//! either transport.

pub mod adapter;
pub mod builtin;
pub mod client;
pub mod dispatcher;
pub mod methods;
pub mod protocol;
pub mod server;

pub use adapter::{FaultPolicy, PostAdapter, WebSocketAdapter};
pub use client::{ClientError, RpcClient};
pub use dispatcher::Dispatcher;
pub use methods::{FnMethod, Method, MethodError, MethodRegistry, MethodTable, parse_params};
pub use protocol::{ErrorResponse, InvalidRequest, Reply, Request, Response, RpcError};
pub use server::JsonRpcServer;
