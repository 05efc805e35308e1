//! HTTP transport plumbing.
//!
//! Serves routes over axum and turns traffic on them into events that are
//! offered to subscribed listeners.
//!
//! ## Architecture
//!
//! - `post`: POST route; raw bodies, url-encoded forms and multipart uploads
//! - `websocket`: WebSocket route; per-connection reader loop and writer task
//!
//! Listeners on a route form a chain of responsibility: each event is offered
//! to them in subscription order until one reports [`Attendance::Handled`].

pub mod post;
pub mod websocket;

use axum::{Router, http::StatusCode, response::IntoResponse};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

pub use post::{PostEvent, PostFormEvent, PostListener, PostRoute, PostUploadEvent, UploadState};
pub use websocket::{
    ConnectionClosed, WebSocketConnection, WebSocketEvent, WebSocketFrameEvent, WebSocketListener,
    WebSocketRoute,
};

/// Whether a listener consumed an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attendance {
    /// Consumed; later listeners are not offered the event.
    Handled,
    /// Not ours; pass it along.
    Declined,
}

impl Attendance {
    pub fn is_handled(self) -> bool {
        self == Attendance::Handled
    }
}

/// Ordered list of listeners subscribed to a route.
pub struct ListenerChain<L: ?Sized> {
    listeners: RwLock<Vec<Arc<L>>>,
}

impl<L: ?Sized> Default for ListenerChain<L> {
    fn default() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
        }
    }
}

impl<L: ?Sized> ListenerChain<L> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: Arc<L>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Remove a listener. Returns false if it was not subscribed.
    pub fn unsubscribe(&self, listener: &Arc<L>) -> bool {
        let mut listeners = self
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|l| !same_object(l, listener));
        listeners.len() != before
    }

    /// Listeners in subscription order, detached from the lock so that
    /// events can be awaited without holding it.
    pub fn snapshot(&self) -> Vec<Arc<L>> {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Pointer identity that ignores trait-object metadata.
fn same_object<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Something that can be mounted on the HTTP server.
pub trait Route: Send + Sync {
    fn path(&self) -> &str;

    fn mount(self: Arc<Self>, router: Router) -> Router;
}

/// Axum server with a mutable route table.
///
/// Routes are registered and removed between runs; the table is read once
/// when the router is built.
pub struct HttpServer {
    bind_addr: SocketAddr,
    routes: Mutex<Vec<Arc<dyn Route>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl HttpServer {
    pub fn new(bind_addr: SocketAddr) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            bind_addr,
            routes: Mutex::new(Vec::new()),
            shutdown_tx,
        }
    }

    pub fn add_route(&self, route: Arc<dyn Route>) {
        tracing::debug!(path = route.path(), "Route added");
        self.routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(route);
    }

    /// Remove a previously added route. Returns false if it was not present.
    pub fn remove_route(&self, route: &Arc<dyn Route>) -> bool {
        let mut routes = self.routes.lock().unwrap_or_else(PoisonError::into_inner);
        let before = routes.len();
        routes.retain(|r| !same_object(r, route));
        let removed = routes.len() != before;
        if removed {
            tracing::debug!(path = route.path(), "Route removed");
        }
        removed
    }

    pub fn routes(&self) -> Vec<Arc<dyn Route>> {
        self.routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Build a router from the current route table.
    pub fn router(&self) -> Router {
        self.routes()
            .into_iter()
            .fold(Router::new(), |router, route| route.mount(router))
            .fallback(not_found)
    }

    /// Bind and serve. Runs until shutdown() is called.
    pub async fn start(&self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already-bound listener. Runs until shutdown() is called.
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        let app = self.router();
        tracing::info!(%addr, "HTTP server listening");

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
            })
            .await?;

        tracing::info!(%addr, "HTTP server stopped");
        Ok(())
    }

    /// Signal the server to shut down gracefully.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

async fn not_found() -> impl IntoResponse {
    StatusCode::NOT_FOUND
}
