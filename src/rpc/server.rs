//! The JSON-RPC server: one POST route and one WebSocket route on a shared
//! HTTP server, both answered by the same dispatcher.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::Router;
use tokio::net::TcpListener;

use crate::config::ServerConfig;
use crate::logging::{Observer, TracingObserver};
use crate::web::{HttpServer, PostListener, PostRoute, Route, WebSocketListener, WebSocketRoute};

use super::adapter::{PostAdapter, WebSocketAdapter};
use super::dispatcher::Dispatcher;
use super::methods::MethodRegistry;

/// Owns both routes and their adapters for its whole lifetime.
///
/// Routes and subscriptions are set up in [`JsonRpcServer::new`] and torn
/// down in reverse order by [`JsonRpcServer::teardown`], which also runs on
/// drop.
pub struct JsonRpcServer {
    http: HttpServer,
    post_route: Arc<PostRoute>,
    web_socket_route: Arc<WebSocketRoute>,
    post_adapter: Arc<PostAdapter>,
    web_socket_adapter: Arc<WebSocketAdapter>,
    torn_down: AtomicBool,
}

impl JsonRpcServer {
    pub fn new(config: &ServerConfig, registry: Arc<dyn MethodRegistry>) -> Self {
        Self::with_observer(config, registry, Arc::new(TracingObserver))
    }

    pub fn with_observer(
        config: &ServerConfig,
        registry: Arc<dyn MethodRegistry>,
        observer: Arc<dyn Observer>,
    ) -> Self {
        let dispatcher = Dispatcher::new(registry);
        let http = HttpServer::new(config.bind_addr());

        let post_route = Arc::new(PostRoute::new(&config.post_path, config.max_body_bytes));
        let web_socket_route = Arc::new(WebSocketRoute::new(&config.ws_path));
        let post_adapter = Arc::new(PostAdapter::new(
            dispatcher.clone(),
            config.fault_policy,
            observer.clone(),
        ));
        let web_socket_adapter = Arc::new(WebSocketAdapter::new(
            dispatcher,
            config.fault_policy,
            observer,
        ));

        http.add_route(post_route.clone());
        http.add_route(web_socket_route.clone());

        post_route.register_post_events(post_adapter.clone());
        web_socket_route.register_web_socket_events(web_socket_adapter.clone());

        tracing::debug!(
            post_path = %config.post_path,
            ws_path = %config.ws_path,
            fault_policy = ?config.fault_policy,
            "JSON-RPC routes registered"
        );

        Self {
            http,
            post_route,
            web_socket_route,
            post_adapter,
            web_socket_adapter,
            torn_down: AtomicBool::new(false),
        }
    }

    /// The POST route, for adding further listeners.
    pub fn post_route(&self) -> Arc<PostRoute> {
        self.post_route.clone()
    }

    /// The WebSocket route, for adding further listeners.
    pub fn web_socket_route(&self) -> Arc<WebSocketRoute> {
        self.web_socket_route.clone()
    }

    pub fn http(&self) -> &HttpServer {
        &self.http
    }

    /// Router over the currently registered routes.
    pub fn router(&self) -> Router {
        self.http.router()
    }

    /// Bind to the configured address and serve until shutdown() is called.
    pub async fn start(&self) -> anyhow::Result<()> {
        self.http.start().await
    }

    /// Serve on an already-bound listener until shutdown() is called.
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        self.http.serve(listener).await
    }

    /// Signal the server to shut down gracefully.
    pub fn shutdown(&self) {
        self.http.shutdown();
    }

    /// Detach the adapters, then undo every subscription and registration in
    /// reverse order. Safe to call more than once.
    pub fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }

        self.web_socket_adapter.detach();
        self.post_adapter.detach();

        let web_socket_adapter: Arc<dyn WebSocketListener> = self.web_socket_adapter.clone();
        let post_adapter: Arc<dyn PostListener> = self.post_adapter.clone();
        self.web_socket_route
            .unregister_web_socket_events(&web_socket_adapter);
        self.post_route.unregister_post_events(&post_adapter);

        let web_socket_route: Arc<dyn Route> = self.web_socket_route.clone();
        let post_route: Arc<dyn Route> = self.post_route.clone();
        self.http.remove_route(&web_socket_route);
        self.http.remove_route(&post_route);

        tracing::debug!("JSON-RPC routes removed");
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }
}

impl Drop for JsonRpcServer {
    fn drop(&mut self) {
        self.teardown();
    }
}
