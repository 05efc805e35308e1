//! POST route.
//!
//! Raw bodies become [`PostEvent`]s carrying a response buffer. Url-encoded
//! forms become a [`PostFormEvent`]; multipart bodies report file parts as
//! [`PostUploadEvent`]s and plain fields as one [`PostFormEvent`]. Uploaded
//! file contents are counted, not stored.

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    Form, Router,
    body::{Bytes, to_bytes},
    extract::{FromRequest, Multipart, Request, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::post,
};

use super::{Attendance, ListenerChain, Route};

/// Receives POST traffic from a [`PostRoute`].
#[async_trait]
pub trait PostListener: Send + Sync {
    async fn on_post(&self, event: &mut PostEvent) -> Attendance;

    async fn on_form(&self, _event: &PostFormEvent) -> Attendance {
        Attendance::Declined
    }

    async fn on_upload(&self, _event: &PostUploadEvent) -> Attendance {
        Attendance::Declined
    }
}

/// A completed POST body plus the sink for the HTTP response body.
#[derive(Debug)]
pub struct PostEvent {
    data: Bytes,
    response: Option<Vec<u8>>,
}

impl PostEvent {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            response: None,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Set the response body, replacing anything written before.
    pub fn send_buffer(&mut self, buffer: impl Into<Vec<u8>>) {
        self.response = Some(buffer.into());
    }

    pub fn response(&self) -> Option<&[u8]> {
        self.response.as_deref()
    }

    pub fn into_response_body(self) -> Option<Vec<u8>> {
        self.response
    }
}

/// Name/value pairs from a submitted form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostFormEvent {
    pub fields: Vec<(String, String)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    Starting,
    Progress,
    Finished,
}

impl UploadState {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadState::Starting => "STARTING",
            UploadState::Progress => "PROGRESS",
            UploadState::Finished => "FINISHED",
        }
    }
}

/// Progress of one multipart file part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostUploadEvent {
    pub state: UploadState,
    pub form_field_name: String,
    pub original_filename: String,
    pub content_type: String,
    pub bytes_transferred: u64,
}

/// POST route with its listener chain.
pub struct PostRoute {
    path: String,
    max_body_bytes: usize,
    listeners: ListenerChain<dyn PostListener>,
}

impl PostRoute {
    pub fn new(path: impl Into<String>, max_body_bytes: usize) -> Self {
        Self {
            path: path.into(),
            max_body_bytes,
            listeners: ListenerChain::new(),
        }
    }

    pub fn register_post_events(&self, listener: Arc<dyn PostListener>) {
        self.listeners.subscribe(listener);
    }

    pub fn unregister_post_events(&self, listener: &Arc<dyn PostListener>) -> bool {
        self.listeners.unsubscribe(listener)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Offer a body to the chain, stopping at the first listener that
    /// handles it.
    pub async fn dispatch_post(&self, event: &mut PostEvent) -> Attendance {
        for listener in self.listeners.snapshot() {
            if listener.on_post(event).await.is_handled() {
                return Attendance::Handled;
            }
        }
        Attendance::Declined
    }

    pub async fn dispatch_form(&self, event: &PostFormEvent) -> Attendance {
        for listener in self.listeners.snapshot() {
            if listener.on_form(event).await.is_handled() {
                return Attendance::Handled;
            }
        }
        Attendance::Declined
    }

    pub async fn dispatch_upload(&self, event: &PostUploadEvent) -> Attendance {
        for listener in self.listeners.snapshot() {
            if listener.on_upload(event).await.is_handled() {
                return Attendance::Handled;
            }
        }
        Attendance::Declined
    }

    async fn handle_body(&self, request: Request) -> Response {
        let data = match to_bytes(request.into_body(), self.max_body_bytes).await {
            Ok(data) => data,
            Err(e) => {
                tracing::debug!(path = %self.path, error = %e, "Rejected POST body");
                return StatusCode::PAYLOAD_TOO_LARGE.into_response();
            }
        };

        let mut event = PostEvent::new(data);
        if !self.dispatch_post(&mut event).await.is_handled() {
            tracing::debug!(path = %self.path, "POST body declined by all listeners");
            return StatusCode::NOT_FOUND.into_response();
        }

        match event.into_response_body() {
            Some(body) => (
                [(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("application/json"),
                )],
                body,
            )
                .into_response(),
            None => StatusCode::NO_CONTENT.into_response(),
        }
    }

    async fn handle_form(&self, request: Request) -> Response {
        let Form(fields) = match Form::<Vec<(String, String)>>::from_request(request, &()).await {
            Ok(form) => form,
            Err(rejection) => return rejection.into_response(),
        };

        attendance_status(self.dispatch_form(&PostFormEvent { fields }).await)
    }

    async fn handle_multipart(&self, request: Request) -> Response {
        let mut multipart = match Multipart::from_request(request, &()).await {
            Ok(multipart) => multipart,
            Err(rejection) => return rejection.into_response(),
        };

        let mut fields = Vec::new();
        let mut attendance = Attendance::Declined;

        loop {
            let mut field = match multipart.next_field().await {
                Ok(Some(field)) => field,
                Ok(None) => break,
                Err(e) => return (e.status(), e.body_text()).into_response(),
            };

            let name = field.name().unwrap_or_default().to_string();

            let Some(filename) = field.file_name().map(str::to_string) else {
                match field.text().await {
                    Ok(value) => fields.push((name, value)),
                    Err(e) => return (e.status(), e.body_text()).into_response(),
                }
                continue;
            };

            let mut upload = PostUploadEvent {
                state: UploadState::Starting,
                form_field_name: name,
                original_filename: filename,
                content_type: field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string(),
                bytes_transferred: 0,
            };
            attendance = merge(attendance, self.dispatch_upload(&upload).await);

            loop {
                match field.chunk().await {
                    Ok(Some(chunk)) => {
                        upload.state = UploadState::Progress;
                        upload.bytes_transferred += chunk.len() as u64;
                        attendance = merge(attendance, self.dispatch_upload(&upload).await);
                    }
                    Ok(None) => break,
                    Err(e) => return (e.status(), e.body_text()).into_response(),
                }
            }

            upload.state = UploadState::Finished;
            attendance = merge(attendance, self.dispatch_upload(&upload).await);
        }

        if !fields.is_empty() {
            attendance = merge(attendance, self.dispatch_form(&PostFormEvent { fields }).await);
        }

        attendance_status(attendance)
    }
}

impl Route for PostRoute {
    fn path(&self) -> &str {
        &self.path
    }

    fn mount(self: Arc<Self>, router: Router) -> Router {
        let path = self.path.clone();
        router.route(&path, post(handle_post).with_state(self))
    }
}

async fn handle_post(State(route): State<Arc<PostRoute>>, request: Request) -> Response {
    let content_type = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();

    if content_type.starts_with("multipart/form-data") {
        route.handle_multipart(request).await
    } else if content_type.starts_with("application/x-www-form-urlencoded") {
        route.handle_form(request).await
    } else {
        route.handle_body(request).await
    }
}

fn merge(a: Attendance, b: Attendance) -> Attendance {
    if a.is_handled() || b.is_handled() {
        Attendance::Handled
    } else {
        Attendance::Declined
    }
}

fn attendance_status(attendance: Attendance) -> Response {
    match attendance {
        Attendance::Handled => StatusCode::NO_CONTENT.into_response(),
        Attendance::Declined => StatusCode::NOT_FOUND.into_response(),
    }
}
