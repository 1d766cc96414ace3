use assert_cmd::Command;
use httpmock::{Method::GET, MockServer};
use predicates::prelude::*;
use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Stdio};
use std::time::Duration;

/// Feeds one JSON-RPC request per line and returns the parsed responses in order.
fn run(reqs: &[Value], envs: &[(&str, &str)]) -> anyhow::Result<Vec<Value>> {
    let mut cmd = Command::cargo_bin("github-scheduler")?;
    cmd.env_remove("GITHUB_TOKEN").env_remove("GH_TOKEN");
    for (k, v) in envs {
        cmd.env(k, v);
    }
    let mut input = Vec::new();
    for req in reqs {
        writeln!(input, "{}", serde_json::to_string(req)?)?;
    }
    let assert = cmd
        .arg("--log-level")
        .arg("warn")
        .write_stdin(input)
        .assert()
        .success();
    let stdout = String::from_utf8(assert.get_output().stdout.clone())?;
    let responses = stdout
        .lines()
        .map(serde_json::from_str)
        .collect::<Result<Vec<Value>, _>>()?;
    Ok(responses)
}

fn call(id: i64, method: &str, params: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params })
}

fn by_id(out: &[Value], id: i64) -> &Value {
    out.iter().find(|r| r["id"] == id).unwrap()
}

/// A running gateway driven one line at a time. Responses come back in
/// completion order, so `response` buffers the ones it is not waiting for.
struct Session {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
    pending: Vec<Value>,
}

impl Session {
    fn start(envs: &[(&str, &str)]) -> anyhow::Result<Self> {
        let mut cmd = std::process::Command::new(assert_cmd::cargo::cargo_bin("github-scheduler"));
        cmd.env_remove("GITHUB_TOKEN").env_remove("GH_TOKEN");
        for (k, v) in envs {
            cmd.env(k, v);
        }
        let mut child = cmd
            .arg("--log-level")
            .arg("warn")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;
        let stdin = child.stdin.take();
        let stdout = BufReader::new(child.stdout.take().unwrap());
        Ok(Self { child, stdin, stdout, pending: Vec::new() })
    }

    fn send(&mut self, req: &Value) -> anyhow::Result<()> {
        let stdin = self.stdin.as_mut().unwrap();
        writeln!(stdin, "{}", serde_json::to_string(req)?)?;
        stdin.flush()?;
        Ok(())
    }

    fn next(&mut self) -> anyhow::Result<Value> {
        if !self.pending.is_empty() {
            return Ok(self.pending.remove(0));
        }
        let mut line = String::new();
        self.stdout.read_line(&mut line)?;
        Ok(serde_json::from_str(&line)?)
    }

    fn response(&mut self, id: i64) -> anyhow::Result<Value> {
        if let Some(pos) = self.pending.iter().position(|r| r["id"] == id) {
            return Ok(self.pending.remove(pos));
        }
        loop {
            let mut line = String::new();
            self.stdout.read_line(&mut line)?;
            let resp: Value = serde_json::from_str(&line)?;
            if resp["id"] == id {
                return Ok(resp);
            }
            self.pending.push(resp);
        }
    }

    fn request(&mut self, id: i64, method: &str, params: Value) -> anyhow::Result<Value> {
        self.send(&call(id, method, params))?;
        self.response(id)
    }

    /// Closes stdin and waits for a clean exit.
    fn finish(mut self) -> anyhow::Result<()> {
        drop(self.stdin.take());
        let status = self.child.wait()?;
        assert!(status.success());
        Ok(())
    }
}

#[test]
fn version_flag_prints_and_exits() -> anyhow::Result<()> {
    Command::cargo_bin("github-scheduler")?
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::starts_with("github-scheduler "));
    Ok(())
}

#[test]
fn initialize_and_introspection_without_token() -> anyhow::Result<()> {
    let out = run(
        &[
            call(1, "initialize", json!({})),
            call(2, "scheduler/stats", json!({})),
            call(3, "github/get", json!({ "path": "/repos/o/r" })),
            call(4, "nope", json!({})),
        ],
        &[],
    )?;
    assert_eq!(out.len(), 4);
    let init = by_id(&out, 1);
    assert_eq!(init["result"]["server"]["name"], "github-scheduler");
    let methods = init["result"]["methods"].as_array().unwrap();
    assert!(methods.iter().any(|m| m == "github/get"));

    let stats = by_id(&out, 2);
    assert_eq!(stats["result"]["queue"]["total"], 0);
    assert_eq!(stats["result"]["dispatched"], 0);

    assert!(by_id(&out, 3)["error"]["message"]
        .as_str()
        .unwrap()
        .contains("GITHUB_TOKEN"));
    assert_eq!(by_id(&out, 4)["error"]["code"], -32601);
    Ok(())
}

#[test]
fn github_get_goes_through_the_scheduler() -> anyhow::Result<()> {
    let server = MockServer::start();
    let _ok = server.mock(|when, then| {
        when.method(GET).path("/repos/o/r");
        then.status(200)
            .header("x-ratelimit-limit", "5000")
            .header("x-ratelimit-remaining", "4999")
            .header("x-ratelimit-used", "1")
            .header("x-ratelimit-reset", "4102444800")
            .json_body(json!({ "full_name": "o/r" }));
    });
    let _missing = server.mock(|when, then| {
        when.method(GET).path("/repos/o/gone");
        then.status(404).body("{\"message\":\"Not Found\"}");
    });
    let base = server.base_url();
    let mut s = Session::start(&[
        ("GITHUB_TOKEN", "t"),
        ("GITHUB_API_URL", base.as_str()),
        ("SCHEDULER_MIN_INTERVAL_MS", "0"),
    ])?;

    let ok = s.request(1, "github/get", json!({ "path": "/repos/o/r", "priority": "high" }))?;
    assert_eq!(ok["result"]["status"], 200);
    assert_eq!(ok["result"]["body"]["full_name"], "o/r");

    let rate = s.request(2, "rate_limit/get", json!({}))?;
    assert_eq!(rate["result"]["remaining"], 4999);
    assert_eq!(rate["result"]["resource"], "core");

    let gone = s.request(3, "github/get", json!({ "path": "/repos/o/gone" }))?;
    assert_eq!(gone["error"]["code"], -32000);
    assert_eq!(gone["error"]["data"]["code"], "provider_error");
    assert_eq!(gone["error"]["data"]["github_code"], "not_found");
    assert_eq!(gone["error"]["data"]["status"], 404);

    let bad = s.request(4, "github/get", json!({ "path": "/repos/o/r", "priority": "urgent" }))?;
    assert_eq!(bad["error"]["code"], -32602);

    let stats = s.request(5, "scheduler/stats", json!({}))?;
    assert_eq!(stats["result"]["succeeded"], 1);
    assert_eq!(stats["result"]["failed"], 1);
    s.finish()
}

#[test]
fn org_ceiling_rejects_with_quota_code() -> anyhow::Result<()> {
    let server = MockServer::start();
    let m = server.mock(|when, then| {
        when.method(GET).path("/orgs/acme/repos");
        then.status(200).json_body(json!([]));
    });
    let base = server.base_url();
    let get = json!({ "path": "/orgs/acme/repos", "organization": "acme" });
    let mut s = Session::start(&[
        ("GITHUB_TOKEN", "t"),
        ("GITHUB_API_URL", base.as_str()),
        ("SCHEDULER_MIN_INTERVAL_MS", "0"),
        ("SCHEDULER_ORG_DAILY_LIMIT", "1"),
    ])?;

    assert_eq!(s.request(1, "github/get", get.clone())?["result"]["status"], 200);
    let over = s.request(2, "github/get", get)?;
    assert_eq!(over["error"]["data"]["code"], "quota_exceeded");
    assert!(over["error"]["data"]["reset_at"].is_string());
    let usage = s.request(3, "org/usage", json!({ "organization": "acme" }))?;
    assert_eq!(usage["result"]["daily_count"], 1);
    assert_eq!(usage["result"]["limit"], 1);
    s.finish()?;
    m.assert_hits(1);
    Ok(())
}

#[test]
fn slow_call_does_not_block_admin_methods() -> anyhow::Result<()> {
    let server = MockServer::start();
    let _slow = server.mock(|when, then| {
        when.method(GET).path("/repos/o/slow");
        then.status(200)
            .delay(Duration::from_secs(5))
            .json_body(json!({}));
    });
    let base = server.base_url();
    let mut s = Session::start(&[
        ("GITHUB_TOKEN", "t"),
        ("GITHUB_API_URL", base.as_str()),
        ("SCHEDULER_MIN_INTERVAL_MS", "0"),
    ])?;

    s.send(&call(1, "github/get", json!({ "path": "/repos/o/slow" })))?;
    s.send(&call(2, "scheduler/stats", json!({})))?;
    // Answered while the first call is still outstanding.
    let first = s.next()?;
    assert_eq!(first["id"], 2);
    assert!(first["result"]["dispatched"].is_u64());

    s.send(&call(3, "scheduler/shutdown", json!({})))?;
    assert_eq!(s.response(3)?["result"]["shutdown"], true);
    let cancelled = s.response(1)?;
    assert_eq!(cancelled["error"]["data"]["code"], "cancelled");
    s.finish()
}
