use github_scheduler::http::{map_status_to_error, GitHubClient, GitHubError, RequestOptions};
use github_scheduler::scheduler::snapshot::CORE_RESOURCE;
use github_scheduler::{Config, ConfigError, Priority, Scheduler, SchedulerConfig};
use log::{debug, info, warn};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

// Minimal JSON-RPC 2.0 types
#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum Id {
    Str(String),
    Num(i64),
    Null,
}

#[derive(Debug, Serialize, Deserialize)]
struct Request {
    jsonrpc: String,
    method: String,
    #[serde(default)]
    params: Value,
    id: Option<Id>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Response {
    jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
    id: Option<Id>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

fn rpc_error(id: Option<Id>, code: i64, message: &str, data: Option<Value>) -> Response {
    Response { jsonrpc: "2.0".into(), result: None, error: Some(RpcError { code, message: message.into(), data }), id }
}

fn rpc_ok(id: Option<Id>, result: Value) -> Response {
    Response { jsonrpc: "2.0".into(), result: Some(result), error: None, id }
}

const METHODS: &[&str] = &[
    "initialize",
    "ping",
    "github/get",
    "scheduler/stats",
    "rate_limit/get",
    "org/usage",
    "scheduler/shutdown",
];

struct Gateway {
    scheduler: Scheduler,
    client: Option<GitHubClient>,
    setup_error: Option<String>,
}

impl Gateway {
    fn from_env() -> anyhow::Result<Self> {
        match Config::from_env() {
            Ok(cfg) => {
                let scheduler = Scheduler::start(cfg.scheduler.clone());
                match GitHubClient::new(cfg, scheduler.clone()) {
                    Ok(client) => Ok(Self { scheduler, client: Some(client), setup_error: None }),
                    Err(e) => Ok(Self { scheduler, client: None, setup_error: Some(e.to_string()) }),
                }
            }
            // Introspection still works without credentials; only github/get needs them.
            Err(ConfigError::MissingToken) => {
                warn!("{}; github/get disabled", ConfigError::MissingToken);
                Ok(Self {
                    scheduler: Scheduler::start(SchedulerConfig::from_env()?),
                    client: None,
                    setup_error: Some(ConfigError::MissingToken.to_string()),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn dispatch(&self, req: Request) -> Response {
        match req.method.as_str() {
            "initialize" => handle_initialize(req.id),
            "ping" => handle_ping(req.id, req.params),
            "github/get" => self.handle_github_get(req.id, req.params).await,
            "scheduler/stats" => self.handle_stats(req.id),
            "rate_limit/get" => self.handle_rate_limit(req.id, req.params),
            "org/usage" => self.handle_org_usage(req.id, req.params),
            "scheduler/shutdown" => {
                self.scheduler.shutdown().await;
                rpc_ok(req.id, serde_json::json!({ "shutdown": true }))
            }
            other => rpc_error(req.id, -32601, &format!("Method not found: {}", other), None),
        }
    }

    async fn handle_github_get(&self, id: Option<Id>, params: Value) -> Response {
        let input: GithubGetInput = match serde_json::from_value(params) {
            Ok(v) => v,
            Err(e) => return rpc_error(id, -32602, &format!("Invalid params: {}", e), None),
        };
        let Some(client) = &self.client else {
            let msg = self.setup_error.clone().unwrap_or_else(|| "client unavailable".into());
            return rpc_error(id, -32603, &msg, None);
        };
        let priority = match input.priority.as_deref().map(str::parse::<Priority>).transpose() {
            Ok(p) => p.unwrap_or_default(),
            Err(e) => return rpc_error(id, -32602, &e.to_string(), None),
        };
        let opts = RequestOptions { priority, organization: input.organization, timeout: None };
        let accept = input.accept.as_deref().unwrap_or("application/vnd.github+json");
        match client.get(&input.path, accept, &opts).await {
            Ok(res) => {
                let body = serde_json::from_str::<Value>(&res.body).unwrap_or(Value::String(res.body.clone()));
                rpc_ok(id, serde_json::json!({ "status": res.status.as_u16(), "body": body }))
            }
            Err(e) => github_error(id, e),
        }
    }

    fn handle_stats(&self, id: Option<Id>) -> Response {
        match serde_json::to_value(self.scheduler.stats()) {
            Ok(v) => rpc_ok(id, v),
            Err(e) => rpc_error(id, -32603, &e.to_string(), None),
        }
    }

    fn handle_rate_limit(&self, id: Option<Id>, params: Value) -> Response {
        let input: RateLimitInput = serde_json::from_value(params).unwrap_or_default();
        let value = match input.resource {
            Some(resource) => serde_json::to_value(self.scheduler.rate_limit(&resource)),
            None if input.all => serde_json::to_value(self.scheduler.rate_limits()),
            None => serde_json::to_value(self.scheduler.rate_limit(CORE_RESOURCE)),
        };
        match value {
            Ok(v) => rpc_ok(id, v),
            Err(e) => rpc_error(id, -32603, &e.to_string(), None),
        }
    }

    fn handle_org_usage(&self, id: Option<Id>, params: Value) -> Response {
        let input: OrgUsageInput = serde_json::from_value(params).unwrap_or_default();
        let value = match input.organization {
            Some(org) => serde_json::to_value(self.scheduler.org_usage(&org)),
            None => serde_json::to_value(self.scheduler.org_usages()),
        };
        match value {
            Ok(v) => rpc_ok(id, v),
            Err(e) => rpc_error(id, -32603, &e.to_string(), None),
        }
    }
}

#[derive(Deserialize)]
struct GithubGetInput {
    path: String,
    accept: Option<String>,
    priority: Option<String>,
    organization: Option<String>,
}

#[derive(Deserialize, Default)]
struct RateLimitInput {
    resource: Option<String>,
    #[serde(default)]
    all: bool,
}

#[derive(Deserialize, Default)]
struct OrgUsageInput {
    organization: Option<String>,
}

#[derive(Deserialize)]
struct PingInput {
    message: Option<String>,
}

fn handle_initialize(id: Option<Id>) -> Response {
    rpc_ok(
        id,
        serde_json::json!({
            "server": {
                "name": "github-scheduler",
                "version": env!("CARGO_PKG_VERSION"),
            },
            "methods": METHODS,
        }),
    )
}

fn handle_ping(id: Option<Id>, params: Value) -> Response {
    let message = serde_json::from_value::<PingInput>(params)
        .ok()
        .and_then(|p| p.message)
        .unwrap_or_else(|| "pong".to_string());
    rpc_ok(id, serde_json::json!({ "message": message }))
}

// Keeps the scheduler's error taxonomy visible to clients in `data.code`.
fn github_error(id: Option<Id>, err: GitHubError) -> Response {
    match &err {
        GitHubError::Scheduler(e) => {
            let mut data = serde_json::json!({ "code": e.code() });
            if let Some(status) = e.status() {
                data["status"] = Value::from(status);
                if let Ok(status) = StatusCode::from_u16(status) {
                    let info = map_status_to_error(status, String::new());
                    data["github_code"] = Value::String(info.code);
                    data["retriable"] = Value::Bool(info.retriable);
                }
            }
            if let github_scheduler::SchedulerError::QuotaExceeded { reset_at, .. } = e {
                data["reset_at"] = Value::String(reset_at.to_rfc3339());
            }
            rpc_error(id, -32000, &err.to_string(), Some(data))
        }
        GitHubError::Decode(_) | GitHubError::GraphQl(_) => {
            rpc_error(id, -32001, &err.to_string(), Some(serde_json::json!({ "code": "decode_error" })))
        }
        GitHubError::Setup(_) => rpc_error(id, -32602, &err.to_string(), None),
    }
}

async fn write_response(out: &mut tokio::io::Stdout, resp: &Response) -> anyhow::Result<()> {
    let mut payload = serde_json::to_vec(resp)?;
    payload.push(b'\n');
    out.write_all(&payload).await?;
    out.flush().await?;
    Ok(())
}

/// Single stdout owner; responses arrive in completion order.
async fn write_responses(mut rx: mpsc::UnboundedReceiver<Response>) -> anyhow::Result<()> {
    let mut stdout = tokio::io::stdout();
    while let Some(resp) = rx.recv().await {
        write_response(&mut stdout, &resp).await?;
    }
    Ok(())
}

/// Serves newline-delimited JSON-RPC requests from stdin until EOF.
///
/// Each request runs on its own task, so a `github/get` held by pacing or a
/// cooldown never blocks introspection or `scheduler/shutdown`.
pub async fn run_stdio_server() -> anyhow::Result<()> {
    let gateway = Arc::new(Gateway::from_env()?);
    info!("Starting github-scheduler stdio gateway");
    let (tx, rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_responses(rx));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Request>(&line) {
            Ok(req) => {
                debug!("Received method={}", req.method);
                let gateway = gateway.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let resp = gateway.dispatch(req).await;
                    if tx.send(resp).is_err() {
                        warn!("response dropped: writer stopped");
                    }
                });
            }
            Err(e) => {
                let resp = rpc_error(None, -32700, &format!("Parse error: {}", e), None);
                if tx.send(resp).is_err() {
                    break;
                }
            }
        }
    }
    // The writer ends once every in-flight request has answered and dropped its sender.
    drop(tx);
    writer.await??;
    gateway.scheduler.shutdown().await;
    Ok(())
}
