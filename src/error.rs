use chrono::{DateTime, Utc};
use thiserror::Error;

/// Outcome of a submitted request that did not produce a successful response.
///
/// Quota and rate-limit conditions stay distinguishable so callers can show
/// "daily limit reached" and "please wait" messaging separately.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("daily request quota of {limit} exceeded for organization {organization} (resets at {reset_at})")]
    QuotaExceeded {
        organization: String,
        limit: u32,
        reset_at: DateTime<Utc>,
    },

    #[error("request failed after {attempts} attempts: {message}")]
    RetriesExhausted {
        attempts: u32,
        status: Option<u16>,
        body: Option<String>,
        message: String,
    },

    #[error("provider rejected request with status {status}")]
    Provider { status: u16, body: String },

    #[error("request cancelled")]
    Cancelled,

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl SchedulerError {
    /// Stable machine-readable code, used across the JSON-RPC boundary.
    pub fn code(&self) -> &'static str {
        match self {
            Self::QuotaExceeded { .. } => "quota_exceeded",
            Self::RetriesExhausted { .. } => "retries_exhausted",
            Self::Provider { .. } => "provider_error",
            Self::Cancelled => "cancelled",
            Self::InvalidRequest(_) => "invalid_request",
        }
    }

    /// Last HTTP status observed from the provider, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::RetriesExhausted { status, .. } => *status,
            Self::Provider { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, Self::QuotaExceeded { .. })
    }

    /// True when the request gave up while the provider was still throttling it.
    pub fn is_rate_limit_related(&self) -> bool {
        matches!(
            self,
            Self::RetriesExhausted {
                status: Some(429),
                ..
            }
        )
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing GITHUB_TOKEN or GH_TOKEN")]
    MissingToken,

    #[error("invalid value {value:?} for {var}")]
    Invalid { var: &'static str, value: String },
}
