//! ---
//! mce_section: "06-test-harness"
//! mce_subsection: "module"
//! mce_type: "source"
//! mce_scope: "code"
//! mce_description: "Mock data generators and scripted stub services."
//! mce_version: "v0.1.0"
//! mce_owner: "tbd"
//! ---
//! Test support for the collection pipeline: deterministic mock messages
//! and scripted stub HTTP services standing in for the source, processing,
//! and storage APIs.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, Method, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use mce_engine::{Message, MessageBatch, ProcessedMessage};

pub use axum::http::StatusCode;

/// Deterministic mock messages in the shape the source API produces.
pub fn mock_messages(count: usize) -> Vec<Message> {
    (1..=count)
        .map(|i| Message {
            id: format!("message-id-{}", i),
            source: "MessagingSystem".into(),
            title: format!("Message Title {}", i),
            creation_date: "2030-08-24T17:16:52.228009".into(),
            body: format!("test message {}", i),
            tags: vec![
                "random".into(),
                "tags".into(),
                "generated".into(),
                "by test".into(),
            ],
            author: format!("Test Author {}", i),
        })
        .collect()
}

/// Mock messages pre-sliced into batches of `batch_size`.
pub fn mock_batches(batch_size: usize, batch_count: usize) -> Vec<Vec<Message>> {
    let mut messages = mock_messages(batch_size * batch_count);
    let mut batches = Vec::with_capacity(batch_count);
    while !messages.is_empty() {
        let rest = messages.split_off(batch_size.min(messages.len()));
        batches.push(messages);
        messages = rest;
    }
    batches
}

/// Stamp a mock message the way the processing API would.
pub fn enrich(message: &Message, processing_date: &str) -> ProcessedMessage {
    ProcessedMessage {
        message: message.clone(),
        processing_date: processing_date.into(),
    }
}

/// One canned reply in a scripted sequence.
#[derive(Debug, Clone)]
pub struct StubResponse {
    pub status: StatusCode,
    pub body: String,
}

impl StubResponse {
    pub fn new(status: StatusCode, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// JSON-encode a payload as the response body.
    pub fn json<T: serde::Serialize>(status: StatusCode, payload: &T) -> Self {
        Self {
            status,
            body: serde_json::to_string(payload).expect("stub payload serialises"),
        }
    }

    /// A 200 carrying one page of the source feed.
    pub fn source_batch(messages: &[Message], cursor: Option<i64>) -> Self {
        Self::json(
            StatusCode::OK,
            &MessageBatch {
                results: messages.to_vec(),
                cursor,
            },
        )
    }

    /// A 200 carrying an empty results page.
    pub fn empty_batch() -> Self {
        Self::source_batch(&[], None)
    }

    /// A 200 carrying an enriched record.
    pub fn enriched(message: &Message, processing_date: &str) -> Self {
        Self::json(StatusCode::OK, &enrich(message, processing_date))
    }

    /// The storage success answer.
    pub fn created() -> Self {
        Self::new(StatusCode::CREATED, "")
    }

    /// A plain failure with the given status.
    pub fn failure(status: StatusCode) -> Self {
        Self::new(status, "stub failure")
    }
}

/// A request observed by a stub, in arrival order.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
    pub at: Instant,
}

impl RecordedRequest {
    /// Parse the recorded body as JSON, yielding `Null` when it is not.
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_str(&self.body).unwrap_or(serde_json::Value::Null)
    }

    /// First value of the named header, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

struct StubState {
    script: Mutex<VecDeque<StubResponse>>,
    fallback: StubResponse,
    requests: Mutex<Vec<RecordedRequest>>,
}

/// Scripted HTTP stub bound to an ephemeral local port.
///
/// Every request, regardless of method or path, consumes the next scripted
/// response; once the script is exhausted the fallback answers forever.
/// All observed requests are recorded with their arrival instant so tests
/// can assert on paths, bodies, counts, and pacing.
pub struct ScriptedServer {
    base_url: String,
    state: Arc<StubState>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl ScriptedServer {
    /// Spawn a stub whose script is consumed before `fallback` takes over.
    pub async fn spawn(script: Vec<StubResponse>, fallback: StubResponse) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("failed to bind stub listener")?;
        let addr = listener.local_addr()?;

        let state = Arc::new(StubState {
            script: Mutex::new(script.into()),
            fallback,
            requests: Mutex::new(Vec::new()),
        });

        let app = Router::new()
            .fallback(record_and_answer)
            .with_state(state.clone());

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.await;
                })
                .await;
        });

        Ok(Self {
            base_url: format!("http://{}", addr),
            state,
            shutdown: Some(shutdown_tx),
            task,
        })
    }

    /// Spawn a stub that always answers the same way.
    pub async fn always(fallback: StubResponse) -> Result<Self> {
        Self::spawn(Vec::new(), fallback).await
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Snapshot of every request observed so far.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.lock().clone()
    }

    pub fn request_count(&self) -> usize {
        self.state.requests.lock().len()
    }

    /// Stop the stub and wait for the listener task to finish.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = self.task.await;
    }
}

async fn record_and_answer(
    State(state): State<Arc<StubState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    state.requests.lock().push(RecordedRequest {
        method: method.to_string(),
        path: uri.path().to_string(),
        headers: headers
            .iter()
            .map(|(key, value)| {
                (
                    key.as_str().to_owned(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect(),
        body: String::from_utf8_lossy(&body).into_owned(),
        at: Instant::now(),
    });

    let reply = state
        .script
        .lock()
        .pop_front()
        .unwrap_or_else(|| state.fallback.clone());
    (reply.status, reply.body).into_response()
}
