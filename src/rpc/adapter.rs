//! Transport adapters.
//!
//! [`PostAdapter`] and [`WebSocketAdapter`] listen on the web routes and run
//! the same exchange for every payload: parse JSON, decode the request,
//! dispatch, encode the reply and hand it back to the transport. Payloads
//! that are not JSON are declined so other listeners on the route can take
//! them.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::context::ConnectionContext;
use crate::logging::Observer;
use crate::web::{
    Attendance, PostEvent, PostFormEvent, PostListener, PostUploadEvent, WebSocketFrameEvent,
    WebSocketListener,
};

use super::dispatcher::Dispatcher;
use super::protocol::{InvalidRequest, Reply, Request, RpcError};

/// How faults outside a handler's control are reported to the caller.
///
/// `Compatible` answers every malformed envelope and every handler panic with
/// METHOD_NOT_FOUND and a null id, which is what existing clients of this
/// protocol expect. `Strict` uses INVALID_REQUEST and INTERNAL_ERROR and puts
/// the detail in `data`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum FaultPolicy {
    #[default]
    Compatible,
    Strict,
}

enum Fault {
    Malformed(InvalidRequest),
    Panicked(String),
}

impl FaultPolicy {
    fn reply(self, fault: Fault) -> Reply {
        let error = match (self, fault) {
            (FaultPolicy::Compatible, _) => RpcError::method_not_found(),
            (FaultPolicy::Strict, Fault::Malformed(e)) => {
                RpcError::invalid_request().with_data(json!(e.to_string()))
            }
            (FaultPolicy::Strict, Fault::Panicked(detail)) => {
                RpcError::internal_error("Internal error").with_data(json!(detail))
            }
        };
        Reply::error(Value::Null, error)
    }
}

/// The decode → dispatch → encode sequence shared by both adapters.
struct Exchange {
    dispatcher: Dispatcher,
    faults: FaultPolicy,
    observer: Arc<dyn Observer>,
    attached: AtomicBool,
}

impl Exchange {
    fn new(dispatcher: Dispatcher, faults: FaultPolicy, observer: Arc<dyn Observer>) -> Self {
        Self {
            dispatcher,
            faults,
            observer,
            attached: AtomicBool::new(true),
        }
    }

    fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    fn detach(&self) {
        self.attached.store(false, Ordering::Release);
    }

    /// `None` means the payload is not JSON and the event should be declined.
    fn parse(&self, tag: &str, payload: &[u8]) -> Option<Value> {
        match serde_json::from_slice(payload) {
            Ok(json) => Some(json),
            Err(e) => {
                self.observer
                    .notice(tag, &format!("Could not parse as JSON: {}", e));
                None
            }
        }
    }

    /// Produce the reply for one parsed payload, if any is owed.
    async fn respond(&self, tag: &str, ctx: &ConnectionContext, json: Value) -> Option<Reply> {
        let request = match Request::from_json(json) {
            Ok(request) => request,
            Err(e) => {
                self.observer.notice(tag, &format!("Invalid request: {}", e));
                return Some(self.faults.reply(Fault::Malformed(e)));
            }
        };

        let notification = request.is_notification();
        let method = request.method.clone();

        match AssertUnwindSafe(self.dispatcher.process_call(ctx, request))
            .catch_unwind()
            .await
        {
            Ok(reply) => reply,
            Err(panic) => {
                let detail = panic_message(panic.as_ref());
                self.observer
                    .notice(tag, &format!("Method {} panicked: {}", method, detail));
                (!notification).then(|| self.faults.reply(Fault::Panicked(detail)))
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

const POST_TAG: &str = "PostAdapter::on_post";
const FORM_TAG: &str = "PostAdapter::on_form";
const UPLOAD_TAG: &str = "PostAdapter::on_upload";
const FRAME_TAG: &str = "WebSocketAdapter::on_frame_received";

/// Answers JSON-RPC calls posted as HTTP request bodies.
pub struct PostAdapter {
    exchange: Exchange,
}

impl PostAdapter {
    pub fn new(dispatcher: Dispatcher, faults: FaultPolicy, observer: Arc<dyn Observer>) -> Self {
        Self {
            exchange: Exchange::new(dispatcher, faults, observer),
        }
    }

    /// Stop attending to events. Irreversible.
    pub fn detach(&self) {
        self.exchange.detach();
    }

    pub fn is_attached(&self) -> bool {
        self.exchange.is_attached()
    }
}

#[async_trait]
impl PostListener for PostAdapter {
    async fn on_post(&self, event: &mut PostEvent) -> Attendance {
        if !self.is_attached() {
            return Attendance::Declined;
        }

        let Some(json) = self.exchange.parse(POST_TAG, event.data()) else {
            return Attendance::Declined;
        };

        if let Some(reply) = self
            .exchange
            .respond(POST_TAG, &ConnectionContext::Post, json)
            .await
        {
            event.send_buffer(reply.encode());
        }

        Attendance::Handled
    }

    async fn on_form(&self, event: &PostFormEvent) -> Attendance {
        if self.is_attached() {
            let fields: Vec<String> = event
                .fields
                .iter()
                .map(|(name, value)| format!("{}={}", name, value))
                .collect();
            self.exchange
                .observer
                .notice(FORM_TAG, &format!("Form fields: [{}]", fields.join(", ")));
        }
        Attendance::Declined
    }

    async fn on_upload(&self, event: &PostUploadEvent) -> Attendance {
        if self.is_attached() {
            self.exchange.observer.notice(
                UPLOAD_TAG,
                &format!(
                    "state: {} field: {} filename: {} type: {} bytes: {}",
                    event.state.as_str(),
                    event.form_field_name,
                    event.original_filename,
                    event.content_type,
                    event.bytes_transferred
                ),
            );
        }
        Attendance::Declined
    }
}

/// Answers JSON-RPC calls sent as WebSocket text frames, replying on the
/// connection the frame arrived on.
pub struct WebSocketAdapter {
    exchange: Exchange,
}

impl WebSocketAdapter {
    pub fn new(dispatcher: Dispatcher, faults: FaultPolicy, observer: Arc<dyn Observer>) -> Self {
        Self {
            exchange: Exchange::new(dispatcher, faults, observer),
        }
    }

    /// Stop attending to events. Irreversible.
    pub fn detach(&self) {
        self.exchange.detach();
    }

    pub fn is_attached(&self) -> bool {
        self.exchange.is_attached()
    }
}

#[async_trait]
impl WebSocketListener for WebSocketAdapter {
    async fn on_frame_received(&self, event: &WebSocketFrameEvent) -> Attendance {
        if !self.is_attached() {
            return Attendance::Declined;
        }

        let Some(json) = self.exchange.parse(FRAME_TAG, event.text.as_bytes()) else {
            return Attendance::Declined;
        };

        let ctx = ConnectionContext::WebSocket(event.connection.id());
        if let Some(reply) = self.exchange.respond(FRAME_TAG, &ctx, json).await {
            if let Err(e) = event.connection.send_frame(reply.encode()) {
                self.exchange.observer.notice(FRAME_TAG, &e.to_string());
            }
        }

        Attendance::Handled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ConnectionId;
    use crate::rpc::methods::{MethodError, MethodTable};
    use crate::rpc::protocol::{INTERNAL_ERROR, INVALID_REQUEST, METHOD_NOT_FOUND};
    use crate::web::{UploadState, WebSocketConnection};
    use axum::extract::ws::Message;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::{Notify, mpsc};

    #[derive(Default)]
    struct RecordingObserver {
        notices: Mutex<Vec<(String, String)>>,
    }

    impl RecordingObserver {
        fn notices(&self) -> Vec<(String, String)> {
            self.notices.lock().unwrap().clone()
        }
    }

    impl Observer for RecordingObserver {
        fn notice(&self, tag: &str, message: &str) {
            self.notices
                .lock()
                .unwrap()
                .push((tag.to_string(), message.to_string()));
        }
    }

    fn table() -> MethodTable {
        let mut table = MethodTable::new();
        table.register_fn("ping", |_, _| async { Ok::<_, MethodError>(json!("pong")) });
        table.register_fn("explode", |_, params: Option<Value>| async move {
            if params.is_none() {
                panic!("handler blew up");
            }
            Ok::<_, MethodError>(Value::Null)
        });
        table
    }

    fn post_adapter(faults: FaultPolicy) -> (PostAdapter, Arc<RecordingObserver>) {
        let observer = Arc::new(RecordingObserver::default());
        let adapter = PostAdapter::new(
            Dispatcher::new(Arc::new(table())),
            faults,
            observer.clone(),
        );
        (adapter, observer)
    }

    fn reply_of(event: &PostEvent) -> Value {
        serde_json::from_slice(event.response().expect("expected a reply")).unwrap()
    }

    fn connection() -> (WebSocketConnection, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (WebSocketConnection::new(ConnectionId::new(), tx), rx)
    }

    fn frame(connection: &WebSocketConnection, text: &str) -> WebSocketFrameEvent {
        WebSocketFrameEvent {
            connection: connection.clone(),
            text: text.to_string(),
        }
    }

    fn next_text(rx: &mut mpsc::UnboundedReceiver<Message>) -> Option<Value> {
        match rx.try_recv() {
            Ok(Message::Text(text)) => Some(serde_json::from_str(text.as_str()).unwrap()),
            Ok(other) => panic!("unexpected frame {:?}", other),
            Err(_) => None,
        }
    }

    #[tokio::test]
    async fn post_call_gets_result() {
        let (adapter, _) = post_adapter(FaultPolicy::Compatible);
        let mut event = PostEvent::new(r#"{"method":"ping","id":1}"#);

        assert_eq!(adapter.on_post(&mut event).await, Attendance::Handled);
        assert_eq!(event.response(), Some(&br#"{"id":1,"result":"pong"}"#[..]));
    }

    #[tokio::test]
    async fn post_unknown_method_echoes_id() {
        let (adapter, _) = post_adapter(FaultPolicy::Compatible);
        let mut event = PostEvent::new(r#"{"method":"missing","id":1}"#);

        assert_eq!(adapter.on_post(&mut event).await, Attendance::Handled);
        let reply = reply_of(&event);
        assert_eq!(reply["id"], json!(1));
        assert_eq!(reply["error"]["code"], json!(METHOD_NOT_FOUND));
        assert!(reply.get("result").is_none());
    }

    #[tokio::test]
    async fn post_notification_writes_nothing() {
        let (adapter, _) = post_adapter(FaultPolicy::Compatible);
        let mut event = PostEvent::new(r#"{"method":"ping"}"#);

        assert_eq!(adapter.on_post(&mut event).await, Attendance::Handled);
        assert!(event.response().is_none());
    }

    #[tokio::test]
    async fn post_non_json_is_declined() {
        let (adapter, observer) = post_adapter(FaultPolicy::Compatible);
        let mut event = PostEvent::new("hello");

        assert_eq!(adapter.on_post(&mut event).await, Attendance::Declined);
        assert!(event.response().is_none());

        let notices = observer.notices();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].0, POST_TAG);
        assert!(notices[0].1.starts_with("Could not parse as JSON"));
    }

    #[tokio::test]
    async fn missing_method_replies_method_not_found_with_null_id() {
        let (adapter, _) = post_adapter(FaultPolicy::Compatible);
        let mut event = PostEvent::new(r#"{"params":[1],"id":5}"#);

        assert_eq!(adapter.on_post(&mut event).await, Attendance::Handled);
        assert_eq!(
            reply_of(&event),
            json!({"id": null, "error": {"code": METHOD_NOT_FOUND, "message": "Method not found"}})
        );
    }

    #[tokio::test]
    async fn strict_policy_reports_invalid_request() {
        let (adapter, _) = post_adapter(FaultPolicy::Strict);
        let mut event = PostEvent::new(r#"[1,2,3]"#);

        assert_eq!(adapter.on_post(&mut event).await, Attendance::Handled);
        let reply = reply_of(&event);
        assert_eq!(reply["id"], Value::Null);
        assert_eq!(reply["error"]["code"], json!(INVALID_REQUEST));
        assert_eq!(reply["error"]["data"], json!("request must be a JSON object"));
    }

    #[tokio::test]
    async fn handler_panic_maps_per_policy() {
        let (adapter, observer) = post_adapter(FaultPolicy::Compatible);
        let mut event = PostEvent::new(r#"{"method":"explode","id":3}"#);
        assert_eq!(adapter.on_post(&mut event).await, Attendance::Handled);
        let reply = reply_of(&event);
        assert_eq!(reply["id"], Value::Null);
        assert_eq!(reply["error"]["code"], json!(METHOD_NOT_FOUND));
        assert!(observer.notices()[0].1.contains("handler blew up"));

        let (adapter, _) = post_adapter(FaultPolicy::Strict);
        let mut event = PostEvent::new(r#"{"method":"explode","id":3}"#);
        assert_eq!(adapter.on_post(&mut event).await, Attendance::Handled);
        let reply = reply_of(&event);
        assert_eq!(reply["error"]["code"], json!(INTERNAL_ERROR));
        assert_eq!(reply["error"]["data"], json!("handler blew up"));
    }

    #[tokio::test]
    async fn panicking_notification_stays_silent() {
        let (adapter, _) = post_adapter(FaultPolicy::Compatible);
        let mut event = PostEvent::new(r#"{"method":"explode"}"#);

        assert_eq!(adapter.on_post(&mut event).await, Attendance::Handled);
        assert!(event.response().is_none());
    }

    #[tokio::test]
    async fn form_and_upload_are_logged_and_declined() {
        let (adapter, observer) = post_adapter(FaultPolicy::Compatible);

        let form = PostFormEvent {
            fields: vec![("name".to_string(), "value".to_string())],
        };
        assert_eq!(adapter.on_form(&form).await, Attendance::Declined);

        let upload = PostUploadEvent {
            state: UploadState::Finished,
            form_field_name: "file".to_string(),
            original_filename: "a.txt".to_string(),
            content_type: "text/plain".to_string(),
            bytes_transferred: 12,
        };
        assert_eq!(adapter.on_upload(&upload).await, Attendance::Declined);

        let notices = observer.notices();
        assert_eq!(notices[0], (FORM_TAG.to_string(), "Form fields: [name=value]".to_string()));
        assert_eq!(notices[1].0, UPLOAD_TAG);
        assert!(notices[1].1.contains("state: FINISHED"));
        assert!(notices[1].1.contains("bytes: 12"));
    }

    #[tokio::test]
    async fn detached_adapter_declines() {
        let (adapter, _) = post_adapter(FaultPolicy::Compatible);
        adapter.detach();
        let mut event = PostEvent::new(r#"{"method":"ping","id":1}"#);

        assert_eq!(adapter.on_post(&mut event).await, Attendance::Declined);
        assert!(event.response().is_none());
    }

    fn ws_adapter(table: MethodTable) -> WebSocketAdapter {
        WebSocketAdapter::new(
            Dispatcher::new(Arc::new(table)),
            FaultPolicy::Compatible,
            Arc::new(RecordingObserver::default()),
        )
    }

    #[tokio::test]
    async fn ws_reply_goes_to_originating_connection() {
        let adapter = ws_adapter(table());
        let (conn_a, mut rx_a) = connection();
        let (_conn_b, mut rx_b) = connection();

        let attendance = adapter
            .on_frame_received(&frame(&conn_a, r#"{"method":"ping","id":"a"}"#))
            .await;

        assert_eq!(attendance, Attendance::Handled);
        assert_eq!(next_text(&mut rx_a), Some(json!({"id": "a", "result": "pong"})));
        assert_eq!(next_text(&mut rx_b), None);
    }

    #[tokio::test]
    async fn ws_notification_sends_no_frame() {
        let adapter = ws_adapter(table());
        let (conn, mut rx) = connection();

        let attendance = adapter
            .on_frame_received(&frame(&conn, r#"{"method":"ping"}"#))
            .await;

        assert_eq!(attendance, Attendance::Handled);
        assert_eq!(next_text(&mut rx), None);
    }

    #[tokio::test]
    async fn ws_plain_text_is_declined() {
        let adapter = ws_adapter(table());
        let (conn, mut rx) = connection();

        let attendance = adapter.on_frame_received(&frame(&conn, "hello")).await;

        assert_eq!(attendance, Attendance::Declined);
        assert_eq!(next_text(&mut rx), None);
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn ws_lifecycle_events_are_declined() {
        let adapter = ws_adapter(table());
        let (conn, _rx) = connection();
        let event = crate::web::WebSocketEvent {
            connection: conn.clone(),
            error: None,
        };

        assert_eq!(adapter.on_open(&event).await, Attendance::Declined);
        assert_eq!(adapter.on_close(&event).await, Attendance::Declined);
        assert_eq!(adapter.on_error(&event).await, Attendance::Declined);
        assert_eq!(
            adapter.on_frame_sent(&frame(&conn, "{}")).await,
            Attendance::Declined
        );
    }

    #[tokio::test]
    async fn concurrent_calls_reply_on_their_own_connections() {
        let release_slow = Arc::new(Notify::new());
        let completed = Arc::new(Mutex::new(Vec::new()));

        let mut table = MethodTable::new();
        {
            let release_slow = release_slow.clone();
            let completed = completed.clone();
            table.register_fn("slow", move |_, _| {
                let release_slow = release_slow.clone();
                let completed = completed.clone();
                async move {
                    release_slow.notified().await;
                    completed.lock().unwrap().push("slow");
                    Ok::<_, MethodError>(json!("slow done"))
                }
            });
        }
        {
            let completed = completed.clone();
            table.register_fn("fast", move |_, _| {
                let completed = completed.clone();
                async move {
                    completed.lock().unwrap().push("fast");
                    Ok::<_, MethodError>(json!("fast done"))
                }
            });
        }

        let adapter = ws_adapter(table);
        let (conn_slow, mut rx_slow) = connection();
        let (conn_fast, mut rx_fast) = connection();
        let slow_frame = frame(&conn_slow, r#"{"method":"slow","id":1}"#);
        let fast_frame = frame(&conn_fast, r#"{"method":"fast","id":2}"#);

        let slow = adapter.on_frame_received(&slow_frame);
        let fast = async {
            let attendance = adapter.on_frame_received(&fast_frame).await;
            release_slow.notify_one();
            attendance
        };

        let (slow, fast) = tokio::time::timeout(Duration::from_secs(5), async {
            tokio::join!(slow, fast)
        })
        .await
        .expect("calls did not complete");

        assert_eq!(slow, Attendance::Handled);
        assert_eq!(fast, Attendance::Handled);
        assert_eq!(*completed.lock().unwrap(), vec!["fast", "slow"]);

        assert_eq!(next_text(&mut rx_fast), Some(json!({"id": 2, "result": "fast done"})));
        assert_eq!(next_text(&mut rx_fast), None);
        assert_eq!(next_text(&mut rx_slow), Some(json!({"id": 1, "result": "slow done"})));
        assert_eq!(next_text(&mut rx_slow), None);
    }
}
