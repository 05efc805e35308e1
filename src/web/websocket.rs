//! WebSocket route.
//!
//! Each accepted connection gets a [`ConnectionId`] and a
//! [`WebSocketConnection`] handle. Outbound frames go through an unbounded
//! channel drained by a per-connection writer task; inbound frames are read
//! one at a time and offered to the listener chain. The next frame is read
//! only once everything queued while handling the previous one has been
//! written, so replies are never overtaken by a close handshake.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    Router,
    extract::ws::{Message, WebSocket},
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
};
use futures::stream::SplitSink;
use futures::{FutureExt, SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::{Attendance, ListenerChain, Route};
use crate::context::ConnectionId;

/// How long a closing connection waits for its writer to finish.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Receives WebSocket traffic from a [`WebSocketRoute`]. Everything except
/// incoming frames is declined unless a listener overrides it.
#[async_trait]
pub trait WebSocketListener: Send + Sync {
    async fn on_open(&self, _event: &WebSocketEvent) -> Attendance {
        Attendance::Declined
    }

    async fn on_close(&self, _event: &WebSocketEvent) -> Attendance {
        Attendance::Declined
    }

    async fn on_error(&self, _event: &WebSocketEvent) -> Attendance {
        Attendance::Declined
    }

    async fn on_frame_sent(&self, _event: &WebSocketFrameEvent) -> Attendance {
        Attendance::Declined
    }

    async fn on_frame_received(&self, event: &WebSocketFrameEvent) -> Attendance;
}

#[derive(Debug, Clone, Copy, Error)]
#[error("WebSocket connection {0} is closed")]
pub struct ConnectionClosed(pub ConnectionId);

/// Handle for writing to one connection.
#[derive(Debug, Clone)]
pub struct WebSocketConnection {
    id: ConnectionId,
    outbound: mpsc::UnboundedSender<Message>,
    queued: Arc<AtomicU64>,
}

impl WebSocketConnection {
    pub fn new(id: ConnectionId, outbound: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            id,
            outbound,
            queued: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue a text frame on this connection.
    pub fn send_frame(&self, text: impl Into<String>) -> Result<(), ConnectionClosed> {
        let text: String = text.into();
        self.enqueue(Message::Text(text.into()))
    }

    /// Queue a close frame. Frames queued before it are still written.
    pub fn close(&self) -> Result<(), ConnectionClosed> {
        self.enqueue(Message::Close(None))
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }

    /// Number of frames accepted for writing so far, across all clones.
    pub fn queued(&self) -> u64 {
        self.queued.load(Ordering::Acquire)
    }

    fn enqueue(&self, message: Message) -> Result<(), ConnectionClosed> {
        self.outbound
            .send(message)
            .map_err(|_| ConnectionClosed(self.id))?;
        self.queued.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn downgrade(&self) -> WeakConnection {
        WeakConnection {
            id: self.id,
            outbound: self.outbound.downgrade(),
            queued: self.queued.clone(),
        }
    }
}

/// Writer-side view of a connection that does not keep its channel open.
struct WeakConnection {
    id: ConnectionId,
    outbound: mpsc::WeakUnboundedSender<Message>,
    queued: Arc<AtomicU64>,
}

impl WeakConnection {
    fn upgrade(&self) -> Option<WebSocketConnection> {
        self.outbound.upgrade().map(|outbound| WebSocketConnection {
            id: self.id,
            outbound,
            queued: self.queued.clone(),
        })
    }
}

/// Aborts the writer if the reader exits without waiting for it, for
/// example when a listener panics.
struct WriterGuard(JoinHandle<()>);

impl Drop for WriterGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Connection lifecycle event (open, close, error).
#[derive(Debug, Clone)]
pub struct WebSocketEvent {
    pub connection: WebSocketConnection,
    pub error: Option<String>,
}

/// A text frame received on, or sent to, a connection.
#[derive(Debug, Clone)]
pub struct WebSocketFrameEvent {
    pub connection: WebSocketConnection,
    pub text: String,
}

/// WebSocket route with its listener chain.
pub struct WebSocketRoute {
    path: String,
    listeners: ListenerChain<dyn WebSocketListener>,
}

impl WebSocketRoute {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            listeners: ListenerChain::new(),
        }
    }

    pub fn register_web_socket_events(&self, listener: Arc<dyn WebSocketListener>) {
        self.listeners.subscribe(listener);
    }

    pub fn unregister_web_socket_events(&self, listener: &Arc<dyn WebSocketListener>) -> bool {
        self.listeners.unsubscribe(listener)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub async fn dispatch_frame_received(&self, event: &WebSocketFrameEvent) -> Attendance {
        for listener in self.listeners.snapshot() {
            if listener.on_frame_received(event).await.is_handled() {
                return Attendance::Handled;
            }
        }
        Attendance::Declined
    }

    pub async fn dispatch_frame_sent(&self, event: &WebSocketFrameEvent) -> Attendance {
        for listener in self.listeners.snapshot() {
            if listener.on_frame_sent(event).await.is_handled() {
                return Attendance::Handled;
            }
        }
        Attendance::Declined
    }

    pub async fn dispatch_open(&self, event: &WebSocketEvent) -> Attendance {
        for listener in self.listeners.snapshot() {
            if listener.on_open(event).await.is_handled() {
                return Attendance::Handled;
            }
        }
        Attendance::Declined
    }

    pub async fn dispatch_close(&self, event: &WebSocketEvent) -> Attendance {
        for listener in self.listeners.snapshot() {
            if listener.on_close(event).await.is_handled() {
                return Attendance::Handled;
            }
        }
        Attendance::Declined
    }

    pub async fn dispatch_error(&self, event: &WebSocketEvent) -> Attendance {
        for listener in self.listeners.snapshot() {
            if listener.on_error(event).await.is_handled() {
                return Attendance::Handled;
            }
        }
        Attendance::Declined
    }

    /// Drain the outbound queue into the socket, publishing how many frames
    /// have been dealt with. Stops after writing a close frame, on a send
    /// failure, or once every handle to the connection is gone.
    async fn write_frames(
        self: Arc<Self>,
        mut sink: SplitSink<WebSocket, Message>,
        mut outbound: mpsc::UnboundedReceiver<Message>,
        connection: WeakConnection,
        written: watch::Sender<u64>,
    ) {
        while let Some(message) = outbound.recv().await {
            let sent_text = match &message {
                Message::Text(text) => Some(text.as_str().to_owned()),
                _ => None,
            };
            let closing = matches!(message, Message::Close(_));

            if let Err(e) = sink.send(message).await {
                // Also the normal outcome of answering a peer's close.
                tracing::debug!(connection = %connection.id, error = %e, "WebSocket send ended");
                break;
            }

            if let Some(text) = sent_text {
                if let Some(connection) = connection.upgrade() {
                    let event = WebSocketFrameEvent { connection, text };
                    self.dispatch_frame_sent(&event).await;
                }
            }

            written.send_modify(|count| *count += 1);

            if closing {
                break;
            }
        }
    }

    /// Drive an established connection until the peer goes away.
    async fn handle_socket(self: Arc<Self>, socket: WebSocket) {
        let id = ConnectionId::new();
        let (sink, mut stream) = socket.split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (written_tx, mut written_rx) = watch::channel(0u64);
        let connection = WebSocketConnection::new(id, outbound_tx);

        tracing::debug!(connection = %id, "WebSocket connection opened");

        let mut writer = WriterGuard(tokio::spawn(self.clone().write_frames(
            sink,
            outbound_rx,
            connection.downgrade(),
            written_tx,
        )));

        self.dispatch_open(&WebSocketEvent {
            connection: connection.clone(),
            error: None,
        })
        .await;

        while let Some(message) = stream.next().await {
            let text = match message {
                Ok(Message::Text(text)) => text.as_str().to_owned(),
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => text,
                    Err(_) => {
                        tracing::debug!(connection = %id, "Ignoring non-UTF-8 binary frame");
                        continue;
                    }
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => continue, // Ping/pong are answered by axum
                Err(e) => {
                    tracing::debug!(connection = %id, error = %e, "WebSocket receive error");
                    self.dispatch_error(&WebSocketEvent {
                        connection: connection.clone(),
                        error: Some(e.to_string()),
                    })
                    .await;
                    break;
                }
            };

            let event = WebSocketFrameEvent {
                connection: connection.clone(),
                text,
            };
            match AssertUnwindSafe(self.dispatch_frame_received(&event))
                .catch_unwind()
                .await
            {
                Ok(Attendance::Handled) => {}
                Ok(Attendance::Declined) => {
                    tracing::debug!(connection = %id, "Frame declined by all listeners");
                }
                Err(_) => {
                    tracing::warn!(connection = %id, "WebSocket listener panicked, closing connection");
                    break;
                }
            }

            let queued = connection.queued();
            let flushed = written_rx
                .wait_for(|count| *count >= queued)
                .await
                .map(|_| ());
            if flushed.is_err() {
                tracing::debug!(connection = %id, "WebSocket writer stopped");
                break;
            }
        }

        self.dispatch_close(&WebSocketEvent {
            connection: connection.clone(),
            error: None,
        })
        .await;

        let _ = connection.close();
        drop(connection);
        if tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, &mut writer.0)
            .await
            .is_err()
        {
            tracing::debug!(connection = %id, "WebSocket writer did not finish in time");
        }
        tracing::debug!(connection = %id, "WebSocket connection closed");
    }
}

impl Route for WebSocketRoute {
    fn path(&self) -> &str {
        &self.path
    }

    fn mount(self: Arc<Self>, router: Router) -> Router {
        let path = self.path.clone();
        router.route(&path, get(ws_handler).with_state(self))
    }
}

/// Handle WebSocket upgrade requests
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(route): State<Arc<WebSocketRoute>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| route.handle_socket(socket))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl WebSocketListener for Echo {
        async fn on_frame_received(&self, event: &WebSocketFrameEvent) -> Attendance {
            let _ = event.connection.send_frame(format!("echo:{}", event.text));
            Attendance::Handled
        }
    }

    struct Never;

    #[async_trait]
    impl WebSocketListener for Never {
        async fn on_frame_received(&self, _event: &WebSocketFrameEvent) -> Attendance {
            panic!("chain should have stopped before this listener");
        }
    }

    #[tokio::test]
    async fn frame_stops_at_first_handler() {
        let route = WebSocketRoute::new("/ws");
        route.register_web_socket_events(Arc::new(Echo));
        route.register_web_socket_events(Arc::new(Never));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let event = WebSocketFrameEvent {
            connection: WebSocketConnection::new(ConnectionId::new(), tx),
            text: "hi".to_string(),
        };

        assert_eq!(route.dispatch_frame_received(&event).await, Attendance::Handled);
        match rx.recv().await {
            Some(Message::Text(text)) => assert_eq!(text.as_str(), "echo:hi"),
            other => panic!("expected text frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn lifecycle_events_declined_by_default() {
        let route = WebSocketRoute::new("/ws");
        route.register_web_socket_events(Arc::new(Echo));

        let (tx, _rx) = mpsc::unbounded_channel();
        let event = WebSocketEvent {
            connection: WebSocketConnection::new(ConnectionId::new(), tx),
            error: None,
        };

        assert_eq!(route.dispatch_open(&event).await, Attendance::Declined);
        assert_eq!(route.dispatch_close(&event).await, Attendance::Declined);
        assert_eq!(route.dispatch_error(&event).await, Attendance::Declined);
    }

    #[test]
    fn send_after_close_reports_connection() {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = ConnectionId::new();
        let connection = WebSocketConnection::new(id, tx);
        drop(rx);

        assert!(connection.is_closed());
        let err = connection.send_frame("late").unwrap_err();
        assert_eq!(err.0, id);
        assert_eq!(connection.queued(), 0);
    }

    #[test]
    fn close_follows_queued_frames() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let connection = WebSocketConnection::new(ConnectionId::new(), tx);
        let clone = connection.clone();

        connection.send_frame("reply").unwrap();
        clone.close().unwrap();

        assert_eq!(connection.queued(), 2);
        assert!(matches!(rx.try_recv(), Ok(Message::Text(t)) if t.as_str() == "reply"));
        assert!(matches!(rx.try_recv(), Ok(Message::Close(None))));
    }

    #[test]
    fn weak_handle_does_not_keep_channel_open() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let connection = WebSocketConnection::new(ConnectionId::new(), tx);
        let weak = connection.downgrade();

        let upgraded = weak.upgrade().expect("connection still alive");
        upgraded.send_frame("x").unwrap();
        assert_eq!(connection.queued(), 1);

        drop(upgraded);
        drop(connection);
        assert!(weak.upgrade().is_none());
        assert!(matches!(rx.try_recv(), Ok(Message::Text(_))));
        assert!(rx.try_recv().is_err());
        assert!(rx.is_closed());
    }
}
