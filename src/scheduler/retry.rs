use super::request::RawResponse;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Upper bound on any 429 cooldown.
    pub max_cooldown: Duration,
    /// Adds up to 25% random jitter on top of the exponential delay.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            max_cooldown: Duration::from_secs(3600),
            jitter: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    RateLimited,
    Retryable,
    Fatal,
}

/// GitHub signals an exhausted primary quota with 403 and `remaining: 0`
/// rather than 429; both are handled as rate limiting.
pub fn classify(response: &RawResponse) -> Outcome {
    let status = response.status;
    if status.is_success() || status.is_redirection() {
        return Outcome::Success;
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Outcome::RateLimited;
    }
    if status == StatusCode::FORBIDDEN
        && response
            .headers
            .get("x-ratelimit-remaining")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.trim() == "0")
    {
        return Outcome::RateLimited;
    }
    match status {
        StatusCode::REQUEST_TIMEOUT
        | StatusCode::INTERNAL_SERVER_ERROR
        | StatusCode::BAD_GATEWAY
        | StatusCode::SERVICE_UNAVAILABLE
        | StatusCode::GATEWAY_TIMEOUT => Outcome::Retryable,
        _ => Outcome::Fatal,
    }
}

/// `Retry-After` as delta-seconds or an HTTP date; dates in the past mean no wait.
pub fn retry_after(headers: &HeaderMap, now: DateTime<Utc>) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(secs) = raw.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(raw).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

impl RetryPolicy {
    /// Delay before retry number `retry_count` (1-based): base, 2x base, 4x base...
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let exp = retry_count.saturating_sub(1).min(32);
        let base_ms = u64::try_from(self.base_backoff.as_millis()).unwrap_or(u64::MAX);
        let delay_ms = base_ms.saturating_mul(1u64 << exp);
        let jitter_ms = if self.jitter && delay_ms >= 4 {
            fastrand::u64(0..delay_ms / 4)
        } else {
            0
        };
        Duration::from_millis(delay_ms.saturating_add(jitter_ms)).min(self.max_backoff)
    }

    /// How long to hold a rate-limited request: `Retry-After` first, then the
    /// window reset, then plain backoff. Never longer than `max_cooldown`.
    pub fn cooldown(
        &self,
        retry_after: Option<Duration>,
        reset_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        retry_count: u32,
    ) -> Duration {
        let wait = retry_after
            .or_else(|| reset_at.map(|at| (at - now).to_std().unwrap_or(Duration::ZERO)))
            .unwrap_or_else(|| self.backoff(retry_count));
        wait.min(self.max_cooldown)
    }
}
