use crate::error::ConfigError;
use crate::scheduler::pacing::PacingPolicy;
use crate::scheduler::retry::RetryPolicy;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Runtime configuration for the GitHub facade.
/// Values are sourced from environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct Config {
    pub token: String,
    pub api_url: String,
    pub graphql_url: String,
    pub api_version: String,
    pub user_agent: String,
    pub timeout_secs: u64,
    pub scheduler: SchedulerConfig,
}

/// Knobs for the request scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub retry: RetryPolicy,
    pub pacing: PacingPolicy,
    /// Requests per organization per UTC day.
    pub org_daily_limit: u32,
    /// Per-attempt timeout when a request does not set its own.
    pub request_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            pacing: PacingPolicy::default(),
            org_daily_limit: 1000,
            request_timeout: Duration::from_secs(30),
        }
    }
}

fn parse_var<T: FromStr>(var: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(var) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { var, value: raw }),
        Err(_) => Ok(None),
    }
}

fn millis(var: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    Ok(parse_var::<u64>(var)?.map(Duration::from_millis).unwrap_or(default))
}

fn secs(var: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    Ok(parse_var::<u64>(var)?.map(Duration::from_secs).unwrap_or(default))
}

impl SchedulerConfig {
    /// Env vars (all optional):
    /// - SCHEDULER_MAX_RETRIES (default: 3)
    /// - SCHEDULER_BASE_BACKOFF_MS (default: 1000)
    /// - SCHEDULER_MAX_BACKOFF_MS (default: 30000)
    /// - SCHEDULER_MAX_COOLDOWN_SECS (default: 3600)
    /// - SCHEDULER_MIN_INTERVAL_MS (default: 100)
    /// - SCHEDULER_CRITICAL_REMAINING (default: 10)
    /// - SCHEDULER_LOW_REMAINING (default: 100)
    /// - SCHEDULER_LOW_REMAINING_DELAY_MS (default: 2000)
    /// - SCHEDULER_RESET_HORIZON_SECS (default: 3600)
    /// - SCHEDULER_ORG_DAILY_LIMIT (default: 1000)
    /// - SCHEDULER_REQUEST_TIMEOUT_SECS (default: 30)
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        let retry = RetryPolicy {
            max_retries: parse_var("SCHEDULER_MAX_RETRIES")?.unwrap_or(d.retry.max_retries),
            base_backoff: millis("SCHEDULER_BASE_BACKOFF_MS", d.retry.base_backoff)?,
            max_backoff: millis("SCHEDULER_MAX_BACKOFF_MS", d.retry.max_backoff)?,
            max_cooldown: secs("SCHEDULER_MAX_COOLDOWN_SECS", d.retry.max_cooldown)?,
            jitter: d.retry.jitter,
        };
        let pacing = PacingPolicy {
            min_interval: millis("SCHEDULER_MIN_INTERVAL_MS", d.pacing.min_interval)?,
            critical_remaining: parse_var("SCHEDULER_CRITICAL_REMAINING")?
                .unwrap_or(d.pacing.critical_remaining),
            low_remaining: parse_var("SCHEDULER_LOW_REMAINING")?.unwrap_or(d.pacing.low_remaining),
            low_remaining_delay: millis(
                "SCHEDULER_LOW_REMAINING_DELAY_MS",
                d.pacing.low_remaining_delay,
            )?,
            reset_horizon: secs("SCHEDULER_RESET_HORIZON_SECS", d.pacing.reset_horizon)?,
        };
        let request_timeout = secs("SCHEDULER_REQUEST_TIMEOUT_SECS", d.request_timeout)?;
        if request_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                var: "SCHEDULER_REQUEST_TIMEOUT_SECS",
                value: "0".into(),
            });
        }
        Ok(Self {
            retry,
            pacing,
            org_daily_limit: parse_var("SCHEDULER_ORG_DAILY_LIMIT")?.unwrap_or(d.org_daily_limit),
            request_timeout,
        })
    }
}

impl Config {
    /// Load configuration from environment.
    ///
    /// Env vars:
    /// - GITHUB_TOKEN (or GH_TOKEN) [required]
    /// - GITHUB_API_URL (default: https://api.github.com)
    /// - GITHUB_GRAPHQL_URL (default: <GITHUB_API_URL>/graphql)
    /// - GITHUB_API_VERSION (default: 2022-11-28)
    /// - GITHUB_HTTP_TIMEOUT_SECS (default: 30)
    /// - GITHUB_USER_AGENT (default: github-scheduler/<version>)
    /// - SCHEDULER_* (see [`SchedulerConfig::from_env`])
    pub fn from_env() -> Result<Self, ConfigError> {
        let token = env::var("GITHUB_TOKEN")
            .or_else(|_| env::var("GH_TOKEN"))
            .map_err(|_| ConfigError::MissingToken)?;

        let api_url = env::var("GITHUB_API_URL")
            .unwrap_or_else(|_| "https://api.github.com".to_string())
            .trim_end_matches('/')
            .to_string();
        let graphql_url = env::var("GITHUB_GRAPHQL_URL").unwrap_or_else(|_| {
            let mut base = api_url.clone();
            base.push_str("/graphql");
            base
        });
        let api_version =
            env::var("GITHUB_API_VERSION").unwrap_or_else(|_| "2022-11-28".to_string());
        let timeout_secs = parse_var::<u64>("GITHUB_HTTP_TIMEOUT_SECS")?.unwrap_or(30);
        let default_ua = format!(
            "github-scheduler/{} (+https://github.com/HautechAI/github-scheduler)",
            env!("CARGO_PKG_VERSION")
        );
        let user_agent = env::var("GITHUB_USER_AGENT").unwrap_or(default_ua);

        let mut scheduler = SchedulerConfig::from_env()?;
        if env::var("SCHEDULER_REQUEST_TIMEOUT_SECS").is_err() && timeout_secs > 0 {
            scheduler.request_timeout = Duration::from_secs(timeout_secs);
        }

        Ok(Self {
            token,
            api_url,
            graphql_url,
            api_version,
            user_agent,
            timeout_secs,
            scheduler,
        })
    }
}
