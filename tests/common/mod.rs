#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use github_scheduler::scheduler::clock::SimClock;
use github_scheduler::scheduler::request::RawResponse;
use github_scheduler::{RequestDescriptor, Scheduler, SchedulerConfig};
use github_scheduler::scheduler::TransportError;
use reqwest::StatusCode;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::Instant;

/// Records which request reached the provider, and when.
#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<(String, Instant)>>>);

impl CallLog {
    pub fn record(&self, label: &str) {
        self.0.lock().unwrap().push((label.to_string(), Instant::now()));
    }

    pub fn labels(&self) -> Vec<String> {
        self.0.lock().unwrap().iter().map(|(l, _)| l.clone()).collect()
    }

    pub fn times(&self) -> Vec<Instant> {
        self.0.lock().unwrap().iter().map(|(_, t)| *t).collect()
    }

    pub fn count(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}

pub fn anchor() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
}

/// Defaults with deterministic backoff.
pub fn test_config() -> SchedulerConfig {
    let mut cfg = SchedulerConfig::default();
    cfg.retry.jitter = false;
    cfg
}

pub fn start(config: SchedulerConfig) -> (Scheduler, Arc<SimClock>) {
    let clock = Arc::new(SimClock::new(anchor()));
    (Scheduler::with_clock(config, clock.clone()), clock)
}

/// Answers the n-th call with `script[n]`; the last entry repeats.
pub fn scripted(label: &str, log: &CallLog, script: Vec<RawResponse>) -> RequestDescriptor {
    let label = label.to_string();
    let log = log.clone();
    let calls = Arc::new(AtomicUsize::new(0));
    RequestDescriptor::new(move || {
        let n = calls.fetch_add(1, Ordering::SeqCst);
        log.record(&label);
        let response = script[n.min(script.len() - 1)].clone();
        async move { Ok::<_, TransportError>(response) }
    })
}

pub fn ok(label: &str, log: &CallLog) -> RequestDescriptor {
    scripted(label, log, vec![RawResponse::new(StatusCode::OK).with_body(label)])
}

pub fn status(code: u16) -> RawResponse {
    RawResponse::new(StatusCode::from_u16(code).unwrap())
}
