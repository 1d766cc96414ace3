use chrono::{DateTime, Utc};
use log::warn;
use parking_lot::RwLock;
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

pub const CORE_RESOURCE: &str = "core";

/// The provider's own statement about one resource class's quota window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitSnapshot {
    pub resource: String,
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
    pub used: Option<u32>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HeaderError {
    #[error("missing rate-limit header {0}")]
    Missing(&'static str),
    #[error("malformed rate-limit header {name}: {value:?}")]
    Malformed { name: &'static str, value: String },
    #[error("remaining {remaining} exceeds limit {limit}")]
    Inconsistent { limit: u32, remaining: u32 },
}

const LIMIT: &str = "x-ratelimit-limit";
const REMAINING: &str = "x-ratelimit-remaining";
const RESET: &str = "x-ratelimit-reset";
const USED: &str = "x-ratelimit-used";
const RESOURCE: &str = "x-ratelimit-resource";

fn header_str<'a>(headers: &'a HeaderMap, name: &'static str) -> Result<Option<&'a str>, HeaderError> {
    match headers.get(name) {
        None => Ok(None),
        Some(v) => v.to_str().map(|s| Some(s.trim())).map_err(|_| HeaderError::Malformed {
            name,
            value: String::from_utf8_lossy(v.as_bytes()).into_owned(),
        }),
    }
}

fn parse_num<T: std::str::FromStr>(name: &'static str, raw: &str) -> Result<T, HeaderError> {
    raw.parse::<T>().map_err(|_| HeaderError::Malformed {
        name,
        value: raw.to_string(),
    })
}

impl RateLimitSnapshot {
    /// Reads the `x-ratelimit-*` headers.
    ///
    /// `Ok(None)` when the response carries no rate-limit metadata at all;
    /// limit, remaining and reset must all be present otherwise.
    pub fn from_headers(headers: &HeaderMap) -> Result<Option<Self>, HeaderError> {
        let limit = header_str(headers, LIMIT)?;
        let remaining = header_str(headers, REMAINING)?;
        let reset = header_str(headers, RESET)?;
        if limit.is_none() && remaining.is_none() && reset.is_none() {
            return Ok(None);
        }
        let limit: u32 = parse_num(LIMIT, limit.ok_or(HeaderError::Missing(LIMIT))?)?;
        let remaining: u32 =
            parse_num(REMAINING, remaining.ok_or(HeaderError::Missing(REMAINING))?)?;
        let reset_raw = reset.ok_or(HeaderError::Missing(RESET))?;
        let reset_at = DateTime::<Utc>::from_timestamp(parse_num::<i64>(RESET, reset_raw)?, 0)
            .ok_or_else(|| HeaderError::Malformed {
                name: RESET,
                value: reset_raw.to_string(),
            })?;
        if remaining > limit {
            return Err(HeaderError::Inconsistent { limit, remaining });
        }
        let used = header_str(headers, USED)?
            .map(|raw| parse_num::<u32>(USED, raw))
            .transpose()?;
        let resource = header_str(headers, RESOURCE)?
            .filter(|s| !s.is_empty())
            .unwrap_or(CORE_RESOURCE)
            .to_string();
        Ok(Some(Self {
            resource,
            limit,
            remaining,
            reset_at,
            used,
        }))
    }
}

/// Latest snapshot per resource class.
///
/// Never predicts decay: a snapshot only changes when a response says so.
#[derive(Debug, Default)]
pub struct RateLimitStore {
    snapshots: RwLock<HashMap<String, RateLimitSnapshot>>,
}

impl RateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(
        &self,
        resource: &str,
        limit: u32,
        remaining: u32,
        reset_at: DateTime<Utc>,
        used: Option<u32>,
    ) {
        self.insert(RateLimitSnapshot {
            resource: resource.to_string(),
            limit,
            remaining,
            reset_at,
            used,
        });
    }

    pub fn insert(&self, snapshot: RateLimitSnapshot) {
        self.snapshots
            .write()
            .insert(snapshot.resource.clone(), snapshot);
    }

    pub fn get(&self, resource: &str) -> Option<RateLimitSnapshot> {
        self.snapshots.read().get(resource).cloned()
    }

    pub fn all(&self) -> Vec<RateLimitSnapshot> {
        let mut all: Vec<_> = self.snapshots.read().values().cloned().collect();
        all.sort_by(|a, b| a.resource.cmp(&b.resource));
        all
    }

    /// Refreshes from response headers. Malformed metadata is logged and
    /// dropped; it never affects the request's own outcome.
    pub fn observe(&self, headers: &HeaderMap) -> Option<RateLimitSnapshot> {
        match RateLimitSnapshot::from_headers(headers) {
            Ok(Some(snapshot)) => {
                self.insert(snapshot.clone());
                Some(snapshot)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("ignoring rate-limit headers: {}", e);
                None
            }
        }
    }
}
