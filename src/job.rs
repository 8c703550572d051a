use crate::{OutputKind, RenderError, RenderRequest};
use axum::http::StatusCode;
use std::time::Instant;
use tokio::sync::oneshot;
use uuid::Uuid;

/// What a job writes back to its client.
#[derive(Debug, Clone)]
pub struct RenderResponse {
    pub status: StatusCode,
    pub content_type: &'static str,
    pub content_disposition: Option<String>,
    pub body: Vec<u8>,
}

impl RenderResponse {
    /// Successful render delivered as a file attachment.
    pub fn attachment(output: OutputKind, out_name: &str, body: Vec<u8>) -> Self {
        Self {
            status: StatusCode::OK,
            content_type: output.content_type(),
            content_disposition: Some(format!(
                "attachment; filename={}.{}",
                out_name,
                output.extension()
            )),
            body,
        }
    }

    /// Plain-text failure carrying only the client-facing message.
    pub fn failure(err: &RenderError) -> Self {
        Self {
            status: err.status_code(),
            content_type: "text/plain; charset=utf-8",
            content_disposition: None,
            body: err.client_message().as_bytes().to_vec(),
        }
    }
}

/// Destination of a job's result.
pub trait ResponseSink: Send + Sync {
    /// Whether the client has gone away.
    fn is_closed(&self) -> bool;

    fn send(self: Box<Self>, response: RenderResponse);
}

impl ResponseSink for oneshot::Sender<RenderResponse> {
    fn is_closed(&self) -> bool {
        oneshot::Sender::is_closed(self)
    }

    fn send(self: Box<Self>, response: RenderResponse) {
        // The receiver may have been dropped since the last check.
        let _ = oneshot::Sender::send(*self, response);
    }
}

pub struct Job {
    pub id: Uuid,
    pub request: RenderRequest,
    pub sink: Box<dyn ResponseSink>,
    pub enqueued_at: Instant,
}

impl Job {
    pub fn new(request: RenderRequest, sink: Box<dyn ResponseSink>) -> Self {
        Self {
            id: Uuid::new_v4(),
            request,
            sink,
            enqueued_at: Instant::now(),
        }
    }

    /// A job whose response is delivered through a channel.
    pub fn with_channel(request: RenderRequest) -> (Self, oneshot::Receiver<RenderResponse>) {
        let (tx, rx) = oneshot::channel();
        (Self::new(request, Box::new(tx)), rx)
    }
}

/// How a job finished when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Completed,
    /// The client disconnected before the job started.
    Skipped,
}

/// Resolves when the job has finished.
pub struct JobHandle {
    rx: oneshot::Receiver<Result<JobStatus, RenderError>>,
}

impl JobHandle {
    pub(crate) fn new(rx: oneshot::Receiver<Result<JobStatus, RenderError>>) -> Self {
        Self { rx }
    }

    pub async fn wait(self) -> Result<JobStatus, RenderError> {
        self.rx.await.unwrap_or(Err(RenderError::QueueClosed))
    }
}
