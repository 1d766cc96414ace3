use crate::error::SchedulerError;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use uuid::Uuid;

pub type RequestId = Uuid;

/// Dispatch tier. Higher tiers always leave the queue first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl Priority {
    /// One tier up, used when a request is retried so new arrivals cannot starve it.
    pub fn escalate(self) -> Self {
        match self {
            Priority::Low => Priority::Medium,
            _ => Priority::High,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            other => Err(SchedulerError::InvalidRequest(format!(
                "unknown priority {other:?} (expected high, medium or low)"
            ))),
        }
    }
}

/// Response as seen by the scheduler: status, headers and the raw body.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: String,
}

impl RawResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: String::new(),
        }
    }

    /// Adds a header; values that are not valid header text are skipped.
    pub fn with_header(mut self, name: &'static str, value: impl AsRef<str>) -> Self {
        if let Ok(v) = HeaderValue::from_str(value.as_ref()) {
            self.headers.insert(HeaderName::from_static(name), v);
        }
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_str(&self.body)
    }

    pub fn text(&self) -> &str {
        &self.body
    }
}

/// The call never produced an HTTP response (connect, TLS, body read...).
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct TransportError(pub String);

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        TransportError(e.to_string())
    }
}

type ExecuteFn =
    Box<dyn Fn() -> BoxFuture<'static, Result<RawResponse, TransportError>> + Send + Sync>;

/// What a caller hands to [`Scheduler::submit`](crate::scheduler::Scheduler::submit).
///
/// `execute` may run several times (retries), so it is `Fn`, and each call
/// must build a fresh network request.
pub struct RequestDescriptor {
    pub(crate) execute: ExecuteFn,
    pub priority: Priority,
    pub organization: Option<String>,
    /// Per-attempt timeout; the scheduler default applies when unset.
    pub timeout: Option<Duration>,
}

impl RequestDescriptor {
    pub fn new<F, Fut>(execute: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<RawResponse, TransportError>> + Send + 'static,
    {
        Self {
            execute: Box::new(move || execute().boxed()),
            priority: Priority::default(),
            organization: None,
            timeout: None,
        }
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn organization(mut self, organization: impl Into<String>) -> Self {
        self.organization = Some(organization.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl fmt::Debug for RequestDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestDescriptor")
            .field("priority", &self.priority)
            .field("organization", &self.organization)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

type Responder = oneshot::Sender<Result<RawResponse, SchedulerError>>;

/// A request owned by the scheduler between submission and completion.
///
/// `resolve` and `reject` consume the request, so a caller is answered
/// exactly once.
pub(crate) struct QueuedRequest {
    pub id: RequestId,
    pub priority: Priority,
    pub organization: Option<String>,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub seq: u64,
    pub timeout: Duration,
    execute: ExecuteFn,
    responder: Responder,
}

impl QueuedRequest {
    pub fn new(
        seq: u64,
        created_at: DateTime<Utc>,
        timeout: Duration,
        descriptor: RequestDescriptor,
        responder: Responder,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            priority: descriptor.priority,
            organization: descriptor.organization,
            retry_count: 0,
            created_at,
            seq,
            timeout,
            execute: descriptor.execute,
            responder,
        }
    }

    /// The caller dropped its [`ResponseFuture`]; nobody is waiting for the result.
    pub fn is_abandoned(&self) -> bool {
        self.responder.is_closed()
    }

    pub fn call(&self) -> BoxFuture<'static, Result<RawResponse, TransportError>> {
        (self.execute)()
    }

    pub fn resolve(self, response: RawResponse) {
        let _ = self.responder.send(Ok(response));
    }

    pub fn reject(self, error: SchedulerError) {
        let _ = self.responder.send(Err(error));
    }
}

/// Completes once the scheduler resolves or rejects the request.
///
/// Dropping it before completion abandons the request: if it is still queued
/// the scheduler skips it instead of calling the provider.
#[derive(Debug)]
pub struct ResponseFuture {
    id: RequestId,
    rx: oneshot::Receiver<Result<RawResponse, SchedulerError>>,
}

impl ResponseFuture {
    pub(crate) fn new(id: RequestId, rx: oneshot::Receiver<Result<RawResponse, SchedulerError>>) -> Self {
        Self { id, rx }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }
}

impl Future for ResponseFuture {
    type Output = Result<RawResponse, SchedulerError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // Sender dropped without an answer: the scheduler went away.
            Poll::Ready(Err(_)) => Poll::Ready(Err(SchedulerError::Cancelled)),
            Poll::Pending => Poll::Pending,
        }
    }
}
