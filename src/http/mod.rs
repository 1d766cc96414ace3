use crate::config::Config;
use crate::error::SchedulerError;
use crate::scheduler::request::{RawResponse, TransportError};
use crate::scheduler::{Priority, RequestDescriptor, Scheduler};
use crate::types::{Comparison, Release};
use log::debug;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, LINK, USER_AGENT};
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const GITHUB_JSON: &str = "application/vnd.github+json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
    pub retriable: bool,
}

pub fn map_status_to_error(status: StatusCode, message: String) -> ErrorInfo {
    let (code, retriable) = match status {
        StatusCode::BAD_REQUEST => ("bad_request", false),
        StatusCode::UNAUTHORIZED => ("unauthorized", false),
        StatusCode::FORBIDDEN => ("forbidden", false),
        StatusCode::NOT_FOUND => ("not_found", false),
        StatusCode::CONFLICT => ("conflict", false),
        StatusCode::UNPROCESSABLE_ENTITY => ("unprocessable", false),
        StatusCode::TOO_MANY_REQUESTS => ("rate_limited", true),
        // Same set the scheduler retries; other 5xx are reported as final.
        StatusCode::REQUEST_TIMEOUT
        | StatusCode::INTERNAL_SERVER_ERROR
        | StatusCode::BAD_GATEWAY
        | StatusCode::SERVICE_UNAVAILABLE
        | StatusCode::GATEWAY_TIMEOUT => ("upstream_error", true),
        _ => ("server_error", false),
    };
    ErrorInfo {
        code: code.to_string(),
        message,
        retriable,
    }
}

/// Facade errors. Scheduler outcomes pass through untouched so callers can
/// still tell a daily quota from provider throttling.
#[derive(Debug, Error)]
pub enum GitHubError {
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error("failed to decode response: {0}")]
    Decode(String),
    #[error("graphql errors: {0}")]
    GraphQl(String),
    #[error("invalid client setup: {0}")]
    Setup(String),
}

impl GitHubError {
    pub fn scheduler_error(&self) -> Option<&SchedulerError> {
        match self {
            GitHubError::Scheduler(e) => Some(e),
            _ => None,
        }
    }
}

/// Per-call scheduling hints.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub priority: Priority,
    pub organization: Option<String>,
    pub timeout: Option<Duration>,
}

impl RequestOptions {
    pub fn with_priority(priority: Priority) -> Self {
        Self {
            priority,
            ..Self::default()
        }
    }

    pub fn for_org(mut self, organization: impl Into<String>) -> Self {
        self.organization = Some(organization.into());
        self
    }
}

pub fn build_client(cfg: &Config) -> Result<Client, GitHubError> {
    let mut default_headers = HeaderMap::new();
    let ua = HeaderValue::from_str(&cfg.user_agent)
        .map_err(|e| GitHubError::Setup(format!("user agent: {}", e)))?;
    default_headers.insert(USER_AGENT, ua);
    // Authorization header is injected per request to allow token rotation later.
    Client::builder()
        .default_headers(default_headers)
        .timeout(Duration::from_secs(cfg.timeout_secs))
        .use_rustls_tls()
        .build()
        .map_err(|e| GitHubError::Setup(e.to_string()))
}

fn auth_header(token: &str) -> Result<HeaderValue, GitHubError> {
    HeaderValue::from_str(&format!("Bearer {}", token))
        .map_err(|_| GitHubError::Setup("token is not a valid header value".into()))
}

/// Percent-encodes one URL path segment (owner, repo, ref names...).
pub fn encode_path_segment(segment: &str) -> String {
    urlencoding::encode(segment).into_owned()
}

/// Target of the `rel="next"` entry of a `Link` header, if any.
pub fn next_page_url(headers: &HeaderMap) -> Option<String> {
    let link = headers.get(LINK)?.to_str().ok()?;
    link.split(',').find_map(|part| {
        let mut pieces = part.split(';');
        let target = pieces.next()?.trim();
        let is_next = pieces.any(|p| {
            let p = p.trim();
            p == "rel=\"next\"" || p == "rel=next"
        });
        if !is_next {
            return None;
        }
        let target = target.strip_prefix('<')?.strip_suffix('>')?;
        url::Url::parse(target).ok().map(String::from)
    })
}

async fn read_response(res: reqwest::Response) -> Result<RawResponse, TransportError> {
    let status = res.status();
    let headers = res.headers().clone();
    let body = res.text().await?;
    Ok(RawResponse {
        status,
        headers,
        body,
    })
}

#[derive(Debug, Deserialize)]
struct GraphQlResponse<T> {
    data: Option<T>,
    errors: Option<Vec<GraphQlError>>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
}

/// GitHub client whose every call is routed through the [`Scheduler`].
#[derive(Clone)]
pub struct GitHubClient {
    http: Client,
    cfg: Arc<Config>,
    auth: HeaderValue,
    scheduler: Scheduler,
}

impl GitHubClient {
    pub fn new(cfg: Config, scheduler: Scheduler) -> Result<Self, GitHubError> {
        let http = build_client(&cfg)?;
        let auth = auth_header(&cfg.token)?;
        Ok(Self {
            http,
            cfg: Arc::new(cfg),
            auth,
            scheduler,
        })
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    fn url(&self, path: &str) -> Result<String, GitHubError> {
        let full = if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else if path.starts_with('/') {
            format!("{}{}", self.cfg.api_url, path)
        } else {
            format!("{}/{}", self.cfg.api_url, path)
        };
        url::Url::parse(&full).map_err(|e| GitHubError::Setup(format!("{}: {}", full, e)))?;
        Ok(full)
    }

    fn descriptor(
        &self,
        method: Method,
        url: String,
        accept: HeaderValue,
        body: Option<serde_json::Value>,
        opts: &RequestOptions,
    ) -> RequestDescriptor {
        let http = self.http.clone();
        let auth = self.auth.clone();
        let version = self.cfg.api_version.clone();
        let mut descriptor = RequestDescriptor::new(move || {
            let mut req = http
                .request(method.clone(), url.as_str())
                .header(AUTHORIZATION, auth.clone())
                .header("X-GitHub-Api-Version", version.as_str())
                .header(ACCEPT, accept.clone());
            if let Some(body) = &body {
                req = req.json(body);
            }
            async move {
                let res = req.send().await.map_err(TransportError::from)?;
                read_response(res).await
            }
        })
        .priority(opts.priority);
        if let Some(org) = &opts.organization {
            descriptor = descriptor.organization(org.clone());
        }
        if let Some(timeout) = opts.timeout {
            descriptor = descriptor.timeout(timeout);
        }
        descriptor
    }

    async fn send(
        &self,
        method: Method,
        url: String,
        accept: &str,
        body: Option<serde_json::Value>,
        opts: &RequestOptions,
    ) -> Result<RawResponse, GitHubError> {
        let accept = HeaderValue::from_str(accept)
            .map_err(|_| GitHubError::Setup(format!("invalid accept header {:?}", accept)))?;
        debug!("{} {} priority={}", method, url, opts.priority);
        let descriptor = self.descriptor(method, url, accept, body, opts);
        let response = self.scheduler.submit(descriptor)?.await?;
        Ok(response)
    }

    /// GET returning the raw response (status, headers, body).
    pub async fn get(
        &self,
        path: &str,
        accept: &str,
        opts: &RequestOptions,
    ) -> Result<RawResponse, GitHubError> {
        let url = self.url(path)?;
        self.send(Method::GET, url, accept, None, opts).await
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        opts: &RequestOptions,
    ) -> Result<T, GitHubError> {
        let res = self.get(path, GITHUB_JSON, opts).await?;
        res.json().map_err(|e| GitHubError::Decode(e.to_string()))
    }

    pub async fn get_text(
        &self,
        path: &str,
        accept: &str,
        opts: &RequestOptions,
    ) -> Result<String, GitHubError> {
        Ok(self.get(path, accept, opts).await?.body)
    }

    /// Follows `Link: rel="next"` until exhausted or `max_pages` pages were read.
    pub async fn get_all_pages<T: DeserializeOwned>(
        &self,
        path: &str,
        opts: &RequestOptions,
        max_pages: usize,
    ) -> Result<Vec<T>, GitHubError> {
        let mut items = Vec::new();
        let mut next = Some(self.url(path)?);
        let mut pages = 0;
        while let Some(url) = next.take() {
            if pages >= max_pages {
                break;
            }
            let res = self.send(Method::GET, url, GITHUB_JSON, None, opts).await?;
            let page: Vec<T> = res.json().map_err(|e| GitHubError::Decode(e.to_string()))?;
            items.extend(page);
            pages += 1;
            next = next_page_url(&res.headers);
        }
        Ok(items)
    }

    pub async fn graphql<V: Serialize, T: DeserializeOwned>(
        &self,
        query: &str,
        variables: &V,
        opts: &RequestOptions,
    ) -> Result<T, GitHubError> {
        let body = serde_json::json!({ "query": query, "variables": variables });
        let url = self.cfg.graphql_url.clone();
        let res = self
            .send(Method::POST, url, "application/json", Some(body), opts)
            .await?;
        let parsed: GraphQlResponse<T> =
            res.json().map_err(|e| GitHubError::Decode(e.to_string()))?;
        if let Some(errors) = parsed.errors.filter(|e| !e.is_empty()) {
            let msg = errors
                .iter()
                .map(|e| e.message.clone())
                .collect::<Vec<_>>()
                .join("; ");
            return Err(GitHubError::GraphQl(msg));
        }
        parsed
            .data
            .ok_or_else(|| GitHubError::Decode("graphql response without data".into()))
    }

    /// `GET /rate_limit`; its headers refresh the "core" snapshot like any other call.
    pub async fn rate_limit(&self) -> Result<serde_json::Value, GitHubError> {
        self.get_json("/rate_limit", &RequestOptions::with_priority(Priority::High))
            .await
    }

    pub async fn list_releases(
        &self,
        owner: &str,
        repo: &str,
        opts: &RequestOptions,
    ) -> Result<Vec<Release>, GitHubError> {
        let path = format!(
            "/repos/{}/{}/releases?per_page=100",
            encode_path_segment(owner),
            encode_path_segment(repo)
        );
        self.get_all_pages(&path, opts, 10).await
    }

    /// Commits between two refs, the raw material of a release's notes.
    pub async fn compare_commits(
        &self,
        owner: &str,
        repo: &str,
        base: &str,
        head: &str,
        opts: &RequestOptions,
    ) -> Result<Comparison, GitHubError> {
        let path = format!(
            "/repos/{}/{}/compare/{}...{}",
            encode_path_segment(owner),
            encode_path_segment(repo),
            encode_path_segment(base),
            encode_path_segment(head)
        );
        self.get_json(&path, opts).await
    }
}
