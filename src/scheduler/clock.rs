use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::time::Duration;

/// Source of wall-clock time for quota windows and rate-limit resets.
///
/// Sleeps always go through `tokio::time`; only calendar arithmetic
/// (midnight rollover, `resetAt` comparisons) reads this clock.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Simulated wall clock for tests.
///
/// Time moves with tokio's monotonic clock, so under `start_paused` every
/// auto-advanced sleep also moves the wall clock. `advance` adds an extra
/// offset without sleeping, e.g. to cross midnight.
#[derive(Debug)]
pub struct SimClock {
    anchor: DateTime<Utc>,
    started: tokio::time::Instant,
    offset: Mutex<ChronoDuration>,
}

impl SimClock {
    pub fn new(anchor: DateTime<Utc>) -> Self {
        Self {
            anchor,
            started: tokio::time::Instant::now(),
            offset: Mutex::new(ChronoDuration::zero()),
        }
    }

    pub fn advance(&self, by: Duration) {
        let by = ChronoDuration::from_std(by).unwrap_or_else(|_| ChronoDuration::zero());
        *self.offset.lock() += by;
    }
}

impl Clock for SimClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = ChronoDuration::from_std(self.started.elapsed())
            .unwrap_or_else(|_| ChronoDuration::zero());
        self.anchor + elapsed + *self.offset.lock()
    }
}
