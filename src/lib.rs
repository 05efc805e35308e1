//! jrpcd: JSON-RPC request/response engine served over HTTP POST and
//! WebSocket from one axum server.

pub mod config;
pub mod context;
pub mod logging;
pub mod rpc;
pub mod web;
