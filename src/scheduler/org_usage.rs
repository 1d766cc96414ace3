use super::clock::Clock;
use crate::error::SchedulerError;
use chrono::{DateTime, Duration as ChronoDuration, NaiveTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Requests counted against one organization in the current UTC day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrganizationUsage {
    pub daily_count: u32,
    pub window_start: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageReport {
    pub organization: String,
    pub daily_count: u32,
    pub limit: u32,
    pub reset_time: DateTime<Utc>,
}

fn day_start(t: DateTime<Utc>) -> DateTime<Utc> {
    t.date_naive().and_time(NaiveTime::MIN).and_utc()
}

impl OrganizationUsage {
    fn fresh(now: DateTime<Utc>) -> Self {
        Self {
            daily_count: 0,
            window_start: day_start(now),
        }
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.reset_time()
    }

    /// The same record as seen at `now`, rolled into a new day if midnight passed.
    fn at(self, now: DateTime<Utc>) -> Self {
        if self.is_expired(now) {
            Self::fresh(now)
        } else {
            self
        }
    }

    fn reset_time(&self) -> DateTime<Utc> {
        self.window_start + ChronoDuration::days(1)
    }
}

/// Per-organization daily ceiling, kept below the provider's shared limit so
/// one tenant cannot drain the budget every other tenant relies on.
pub struct OrgUsageTracker {
    limit: u32,
    clock: Arc<dyn Clock>,
    usage: Mutex<HashMap<String, OrganizationUsage>>,
}

impl OrgUsageTracker {
    pub fn new(limit: u32, clock: Arc<dyn Clock>) -> Self {
        Self {
            limit,
            clock,
            usage: Mutex::new(HashMap::new()),
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    fn current(&self, org: &str) -> OrganizationUsage {
        let now = self.clock.now();
        self.usage
            .lock()
            .get(org)
            .map(|u| u.at(now))
            .unwrap_or_else(|| OrganizationUsage::fresh(now))
    }

    /// Counts one dispatched request and returns the new daily count.
    pub fn increment(&self, org: &str) -> u32 {
        let now = self.clock.now();
        let mut usage = self.usage.lock();
        usage.retain(|_, u| !u.is_expired(now));
        let entry = usage
            .entry(org.to_string())
            .or_insert_with(|| OrganizationUsage::fresh(now));
        *entry = entry.at(now);
        entry.daily_count = entry.daily_count.saturating_add(1);
        entry.daily_count
    }

    pub fn is_exceeded(&self, org: &str) -> bool {
        self.current(org).daily_count >= self.limit
    }

    pub fn check(&self, org: &str) -> Result<(), SchedulerError> {
        let current = self.current(org);
        if current.daily_count >= self.limit {
            return Err(SchedulerError::QuotaExceeded {
                organization: org.to_string(),
                limit: self.limit,
                reset_at: current.reset_time(),
            });
        }
        Ok(())
    }

    pub fn usage(&self, org: &str) -> UsageReport {
        let current = self.current(org);
        UsageReport {
            organization: org.to_string(),
            daily_count: current.daily_count,
            limit: self.limit,
            reset_time: current.reset_time(),
        }
    }

    /// Organizations with usage in the current day.
    pub fn all(&self) -> Vec<UsageReport> {
        let now = self.clock.now();
        let mut orgs: Vec<String> = {
            let mut usage = self.usage.lock();
            usage.retain(|_, u| !u.is_expired(now));
            usage.keys().cloned().collect()
        };
        orgs.sort();
        orgs.iter().map(|org| self.usage(org)).collect()
    }
}
