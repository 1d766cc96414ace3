//! Outbound request scheduler for the rate-limited provider.
//!
//! Every call against the provider goes through [`Scheduler::submit`]. A single
//! worker task drains a priority queue, paces dispatch from the provider's
//! rate-limit feedback, absorbs 429s with a cooldown, retries transient
//! failures with exponential backoff, and enforces a daily per-organization
//! ceiling.

pub mod clock;
pub mod org_usage;
pub mod pacing;
mod queue;
pub mod request;
pub mod retry;
pub mod snapshot;
pub mod stats;

use crate::config::SchedulerConfig;
use crate::error::SchedulerError;
use clock::{Clock, SystemClock};
use log::{debug, info, warn};
use org_usage::{OrgUsageTracker, UsageReport};
use pacing::Pacing;
use parking_lot::Mutex;
use queue::RequestQueue;
use request::{QueuedRequest, RawResponse};
use reqwest::StatusCode;
use retry::Outcome;
use snapshot::{RateLimitSnapshot, RateLimitStore, CORE_RESOURCE};
use stats::{QueueDepth, SchedulerStats, StatsCounters};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub use request::{Priority, RequestDescriptor, RequestId, ResponseFuture, TransportError};

/// Cheap-to-clone handle to one scheduler instance.
///
/// Construct once at process start and hand clones to every caller; there is
/// no global instance.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

struct Inner {
    config: SchedulerConfig,
    clock: Arc<dyn Clock>,
    queue: Mutex<RequestQueue>,
    snapshots: RateLimitStore,
    usage: OrgUsageTracker,
    stats: StatsCounters,
    seq: AtomicU64,
    wake: Notify,
    shutdown: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// What the loop does with a request after an attempt.
enum Next {
    Done,
    Requeue {
        request: QueuedRequest,
        delay: Duration,
        front: bool,
    },
}

impl Scheduler {
    /// Starts the worker on the current tokio runtime using the system clock.
    pub fn start(config: SchedulerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: SchedulerConfig, clock: Arc<dyn Clock>) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let inner = Arc::new(Inner {
            usage: OrgUsageTracker::new(config.org_daily_limit, clock.clone()),
            config,
            clock,
            queue: Mutex::new(RequestQueue::default()),
            snapshots: RateLimitStore::new(),
            stats: StatsCounters::default(),
            seq: AtomicU64::new(0),
            wake: Notify::new(),
            shutdown,
            worker: Mutex::new(None),
        });
        let handle = tokio::spawn(run(inner.clone(), shutdown_rx));
        *inner.worker.lock() = Some(handle);
        Self { inner }
    }

    /// Queues a request and returns a future for its eventual result.
    ///
    /// Fails immediately, without queueing, when the organization is already
    /// at its daily ceiling, the timeout is zero, or the scheduler is shut down.
    pub fn submit(
        &self,
        descriptor: RequestDescriptor,
    ) -> Result<ResponseFuture, SchedulerError> {
        let inner = &self.inner;
        let timeout = descriptor.timeout.unwrap_or(inner.config.request_timeout);
        if timeout.is_zero() {
            return Err(SchedulerError::InvalidRequest(
                "timeout must be positive".into(),
            ));
        }
        if let Some(org) = descriptor.organization.as_deref() {
            if let Err(e) = inner.usage.check(org) {
                StatsCounters::bump(&inner.stats.quota_rejected);
                debug!("rejecting submission for {}: {}", org, e);
                return Err(e);
            }
        }

        let (tx, rx) = tokio::sync::oneshot::channel();
        let seq = inner.seq.fetch_add(1, Ordering::Relaxed);
        let request = QueuedRequest::new(seq, inner.clock.now(), timeout, descriptor, tx);
        let id = request.id;
        {
            let mut queue = inner.queue.lock();
            if queue.is_closed() {
                return Err(SchedulerError::Cancelled);
            }
            debug!(
                "queued request {} priority={} org={:?}",
                id,
                request.priority,
                request.organization.as_deref()
            );
            queue.push(request);
        }
        inner.wake.notify_one();
        Ok(ResponseFuture::new(id, rx))
    }

    /// Removes a still-queued request and rejects it with `Cancelled`.
    ///
    /// Returns false when the request is not in the queue, e.g. because it is
    /// already in flight or finished.
    pub fn cancel(&self, id: RequestId) -> bool {
        let removed = self.inner.queue.lock().remove(id);
        match removed {
            Some(request) => {
                debug!("cancelled queued request {}", id);
                self.inner.cancel_request(request);
                true
            }
            None => false,
        }
    }

    /// Stops the worker and rejects all pending work with `Cancelled`.
    pub async fn shutdown(&self) {
        let drained = self.inner.queue.lock().close();
        if !drained.is_empty() {
            info!(
                "scheduler shutting down; cancelling {} queued requests",
                drained.len()
            );
        }
        for request in drained {
            self.inner.cancel_request(request);
        }
        self.inner.shutdown.send_replace(true);
        self.inner.wake.notify_one();
        let handle = self.inner.worker.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("scheduler worker ended abnormally: {}", e);
            }
        }
    }

    pub fn is_shut_down(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    pub fn queue_depth(&self) -> QueueDepth {
        self.inner.queue.lock().depth()
    }

    pub fn stats(&self) -> SchedulerStats {
        let depth = self.queue_depth();
        self.inner.stats.snapshot(depth)
    }

    pub fn rate_limit(&self, resource: &str) -> Option<RateLimitSnapshot> {
        self.inner.snapshots.get(resource)
    }

    pub fn rate_limits(&self) -> Vec<RateLimitSnapshot> {
        self.inner.snapshots.all()
    }

    pub fn snapshots(&self) -> &RateLimitStore {
        &self.inner.snapshots
    }

    pub fn org_usage(&self, organization: &str) -> UsageReport {
        self.inner.usage.usage(organization)
    }

    pub fn org_usages(&self) -> Vec<UsageReport> {
        self.inner.usage.all()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }
}

impl Inner {
    fn cancel_request(&self, request: QueuedRequest) {
        StatsCounters::bump(&self.stats.cancelled);
        request.reject(SchedulerError::Cancelled);
    }

    fn pacing(&self, last_dispatch: Option<Instant>) -> Pacing {
        let snapshot = self.snapshots.get(CORE_RESOURCE);
        self.config.pacing.decide(
            snapshot.as_ref(),
            self.clock.now(),
            last_dispatch.map(|at| at.elapsed()),
        )
    }

    /// Next request worth dispatching; abandoned ones are dropped on the way.
    fn next_request(&self) -> Option<QueuedRequest> {
        let mut queue = self.queue.lock();
        while let Some(request) = queue.pop() {
            if request.is_abandoned() {
                debug!("skipping abandoned request {}", request.id);
                StatsCounters::bump(&self.stats.cancelled);
                continue;
            }
            return Some(request);
        }
        None
    }

    fn requeue(&self, request: QueuedRequest, front: bool) {
        let mut queue = self.queue.lock();
        if queue.is_closed() {
            drop(queue);
            self.cancel_request(request);
            return;
        }
        if front {
            queue.push_front(request);
        } else {
            queue.push(request);
        }
    }

    fn handle_response(&self, mut request: QueuedRequest, response: RawResponse) -> Next {
        let observed = self.snapshots.observe(&response.headers);
        let status = response.status;
        match retry::classify(&response) {
            Outcome::Success => {
                debug!("request {} completed with {}", request.id, status);
                StatsCounters::bump(&self.stats.succeeded);
                request.resolve(response);
                Next::Done
            }
            Outcome::RateLimited => {
                StatsCounters::bump(&self.stats.rate_limited);
                if request.retry_count >= self.config.retry.max_retries {
                    // A 403 with an empty budget reports as 429 so callers see
                    // one rate-limit category.
                    return self.exhausted(
                        request,
                        Some(StatusCode::TOO_MANY_REQUESTS.as_u16()),
                        Some(response.body),
                        &format!("rate limited ({})", status),
                    );
                }
                request.retry_count += 1;
                StatsCounters::bump(&self.stats.retried);
                let now = self.clock.now();
                let reset_at = observed
                    .or_else(|| self.snapshots.get(CORE_RESOURCE))
                    .map(|s| s.reset_at);
                let delay = self.config.retry.cooldown(
                    retry::retry_after(&response.headers, now),
                    reset_at,
                    now,
                    request.retry_count,
                );
                warn!(
                    "request {} rate limited ({}); cooling down for {:?} (attempt {}/{})",
                    request.id,
                    status,
                    delay,
                    request.retry_count,
                    self.config.retry.max_retries
                );
                Next::Requeue {
                    request,
                    delay,
                    front: true,
                }
            }
            Outcome::Retryable => {
                let message = format!("provider returned {}", status);
                self.retry_or_exhaust(request, Some(status.as_u16()), Some(response.body), message)
            }
            Outcome::Fatal => {
                warn!("request {} failed with status {}", request.id, status);
                StatsCounters::bump(&self.stats.failed);
                request.reject(SchedulerError::Provider {
                    status: status.as_u16(),
                    body: response.body,
                });
                Next::Done
            }
        }
    }

    fn retry_or_exhaust(
        &self,
        mut request: QueuedRequest,
        status: Option<u16>,
        body: Option<String>,
        message: String,
    ) -> Next {
        if request.retry_count >= self.config.retry.max_retries {
            return self.exhausted(request, status, body, &message);
        }
        request.retry_count += 1;
        request.priority = request.priority.escalate();
        StatsCounters::bump(&self.stats.retried);
        let delay = self.config.retry.backoff(request.retry_count);
        warn!(
            "request {} failed ({}); retrying as {} in {:?} (attempt {}/{})",
            request.id,
            message,
            request.priority,
            delay,
            request.retry_count,
            self.config.retry.max_retries
        );
        Next::Requeue {
            request,
            delay,
            front: false,
        }
    }

    fn exhausted(
        &self,
        request: QueuedRequest,
        status: Option<u16>,
        body: Option<String>,
        message: &str,
    ) -> Next {
        let attempts = request.retry_count + 1;
        warn!(
            "request {} gave up after {} attempts: {}",
            request.id, attempts, message
        );
        StatsCounters::bump(&self.stats.failed);
        request.reject(SchedulerError::RetriesExhausted {
            attempts,
            status,
            body,
            message: message.to_string(),
        });
        Next::Done
    }
}

/// Sleeps unless shutdown is signalled first; returns false on shutdown.
async fn sleep_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if delay.is_zero() {
        return !*shutdown.borrow();
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => !*shutdown.borrow(),
        _ = shutdown.changed() => false,
    }
}

async fn run(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    debug!("scheduler worker started");
    let mut last_dispatch: Option<Instant> = None;
    loop {
        if *shutdown.borrow() {
            break;
        }
        let idle = inner.queue.lock().is_empty();
        if idle {
            tokio::select! {
                _ = inner.wake.notified() => continue,
                _ = shutdown.changed() => break,
            }
        }

        let pacing = inner.pacing(last_dispatch);
        match pacing {
            Pacing::UntilReset(d) => {
                info!("rate-limit budget nearly exhausted; pausing {:?} until reset", d)
            }
            Pacing::Throttled(d) => debug!("rate-limit budget low; throttling by {:?}", d),
            Pacing::Interval(_) => {}
        }
        if !sleep_or_shutdown(pacing.delay(), &mut shutdown).await {
            break;
        }

        let Some(request) = inner.next_request() else {
            continue;
        };

        // Re-check at dispatch: several requests may have been admitted
        // while the organization was still under its ceiling.
        if let Some(org) = request.organization.as_deref() {
            if let Err(e) = inner.usage.check(org) {
                debug!("dropping request {} at dispatch: {}", request.id, e);
                StatsCounters::bump(&inner.stats.quota_rejected);
                request.reject(e);
                continue;
            }
            inner.usage.increment(org);
        }

        debug!(
            "dispatching request {} priority={} attempt={} queued_ms={}",
            request.id,
            request.priority,
            request.retry_count + 1,
            (inner.clock.now() - request.created_at).num_milliseconds()
        );
        StatsCounters::bump(&inner.stats.dispatched);
        inner.stats.in_flight.fetch_add(1, Ordering::Relaxed);
        last_dispatch = Some(Instant::now());

        let call = tokio::time::timeout(request.timeout, request.call());
        let result = tokio::select! {
            r = call => Some(r),
            _ = shutdown.changed() => None,
        };
        inner.stats.in_flight.fetch_sub(1, Ordering::Relaxed);

        let next = match result {
            None => {
                inner.cancel_request(request);
                break;
            }
            Some(Ok(Ok(response))) => inner.handle_response(request, response),
            Some(Ok(Err(e))) => {
                let message = format!("transport error: {}", e);
                inner.retry_or_exhaust(request, None, None, message)
            }
            Some(Err(_)) => {
                let message = format!("timed out after {:?}", request.timeout);
                inner.retry_or_exhaust(request, None, None, message)
            }
        };

        if let Next::Requeue {
            request,
            delay,
            front,
        } = next
        {
            if !sleep_or_shutdown(delay, &mut shutdown).await {
                inner.cancel_request(request);
                break;
            }
            inner.requeue(request, front);
        }
    }

    // Anything that slipped in before the queue closed.
    let leftover = inner.queue.lock().close();
    for request in leftover {
        inner.cancel_request(request);
    }
    info!("scheduler worker stopped");
}
