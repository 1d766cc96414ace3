use super::snapshot::RateLimitSnapshot;
use chrono::{DateTime, Utc};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacingPolicy {
    /// Minimum gap between two dispatches.
    pub min_interval: Duration,
    /// Below this many remaining calls the loop waits for the window reset.
    pub critical_remaining: u32,
    /// Below this many remaining calls dispatch slows down proportionally.
    pub low_remaining: u32,
    /// Extra delay applied when `remaining` reaches zero inside the low band.
    pub low_remaining_delay: Duration,
    /// Resets further out than this are not waited for.
    pub reset_horizon: Duration,
}

impl Default for PacingPolicy {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(100),
            critical_remaining: 10,
            low_remaining: 100,
            low_remaining_delay: Duration::from_secs(2),
            reset_horizon: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pacing {
    /// Plain minimum-interval spacing.
    Interval(Duration),
    /// Low remaining budget: interval plus a proportional delay.
    Throttled(Duration),
    /// Budget nearly gone: sleep until the window resets.
    UntilReset(Duration),
}

impl Pacing {
    pub fn delay(self) -> Duration {
        match self {
            Pacing::Interval(d) | Pacing::Throttled(d) | Pacing::UntilReset(d) => d,
        }
    }
}

impl PacingPolicy {
    /// Gate run before every dispatch.
    ///
    /// `since_last` is the time since the previous dispatch, `None` before the
    /// first one. A snapshot whose reset already passed is stale and ignored.
    pub fn decide(
        &self,
        snapshot: Option<&RateLimitSnapshot>,
        now: DateTime<Utc>,
        since_last: Option<Duration>,
    ) -> Pacing {
        let interval = since_last
            .map(|elapsed| self.min_interval.saturating_sub(elapsed))
            .unwrap_or(Duration::ZERO);

        let Some(snapshot) = snapshot else {
            return Pacing::Interval(interval);
        };
        let Ok(until_reset) = (snapshot.reset_at - now).to_std() else {
            return Pacing::Interval(interval);
        };
        if until_reset.is_zero() {
            return Pacing::Interval(interval);
        }

        if snapshot.remaining < self.critical_remaining && until_reset <= self.reset_horizon {
            return Pacing::UntilReset(until_reset.max(interval));
        }
        if snapshot.remaining < self.low_remaining {
            let deficit = u128::from(self.low_remaining - snapshot.remaining);
            let extra_ms =
                self.low_remaining_delay.as_millis() * deficit / u128::from(self.low_remaining);
            let extra = Duration::from_millis(u64::try_from(extra_ms).unwrap_or(u64::MAX));
            return Pacing::Throttled(interval + extra);
        }
        Pacing::Interval(interval)
    }
}
