// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! One connected MCP server: child process, JSON-RPC framing, handshake,
//! tool discovery, and shutdown.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};

use crate::config::{McpServerConfig, Transport};
use crate::content::decode_call_result;
use crate::McpError;

/// Per-request timeout: a server that cannot answer within this window is
/// treated as failed for that call.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
/// The initialize round-trip gets a longer grace period: servers often
/// JIT-start interpreters on first spawn.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const PROTOCOL_VERSION: &str = "2024-11-05";

/// A tool advertised by a server, as discovered via `tools/list`.
#[derive(Debug, Clone)]
pub struct McpToolInfo {
    pub name: String,
    pub description: String,
    /// JSON Schema of the tool input.  Servers advertise it under
    /// `inputSchema`, `input_schema`, or `parameters`; absence falls back
    /// to a permissive object schema.
    pub schema: Value,
}

#[derive(Debug)]
pub struct McpServer {
    name: String,
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    next_msg_id: u64,
    tools: Vec<McpToolInfo>,
}

impl McpServer {
    /// Spawn and handshake a configured server.  Returns a ready
    /// connection with its tool catalog populated.
    pub async fn connect(name: &str, cfg: &McpServerConfig) -> Result<Self, McpError> {
        if cfg.transport() == Transport::Sse {
            return Err(McpError::Unsupported {
                server: name.into(),
                message: format!(
                    "SSE transport ({}) is not supported; configure a stdio command",
                    cfg.url.as_deref().unwrap_or_default()
                ),
            });
        }
        if cfg.command.is_empty() {
            return Err(McpError::Spawn {
                server: name.into(),
                command: String::new(),
                message: "no command configured".into(),
            });
        }

        let mut child = Command::new(&cfg.command)
            .args(&cfg.args)
            .envs(&cfg.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| McpError::Spawn {
                server: name.into(),
                command: cfg.command.clone(),
                message: e.to_string(),
            })?;

        let stdin = child.stdin.take().expect("stdin was piped");
        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");
        spawn_stderr_drain(name.to_string(), stderr);

        let mut server = Self {
            name: name.to_string(),
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            next_msg_id: 1,
            tools: Vec::new(),
        };

        server.handshake().await?;
        server.discover_tools().await?;
        info!(
            server = %server.name,
            pid = server.child.id(),
            tools = server.tools.len(),
            "MCP server ready"
        );
        Ok(server)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tools(&self) -> &[McpToolInfo] {
        &self.tools
    }

    async fn handshake(&mut self) -> Result<(), McpError> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "clientInfo": {
                "name": "nils",
                "version": env!("CARGO_PKG_VERSION"),
            },
            "capabilities": {},
        });
        self.request_with_timeout("initialize", params, HANDSHAKE_TIMEOUT)
            .await?;
        self.notify("notifications/initialized", json!({})).await
    }

    async fn discover_tools(&mut self) -> Result<(), McpError> {
        let result = self.request("tools/list", json!({})).await?;
        let tools = result["tools"].as_array().cloned().unwrap_or_default();
        self.tools = tools
            .iter()
            .filter_map(|t| {
                let name = t["name"].as_str()?;
                Some(McpToolInfo {
                    name: name.to_string(),
                    description: t["description"].as_str().unwrap_or_default().to_string(),
                    schema: extract_input_schema(t),
                })
            })
            .collect();
        Ok(())
    }

    /// Invoke one tool; returns `(output, is_error)`.
    pub async fn call_tool(&mut self, tool: &str, args: Value) -> Result<(Value, bool), McpError> {
        let result = self
            .request("tools/call", json!({ "name": tool, "arguments": args }))
            .await?;
        Ok(decode_call_result(&self.name, &result))
    }

    pub async fn list_resources(&mut self) -> Result<Vec<Value>, McpError> {
        let result = self.request("resources/list", json!({})).await?;
        Ok(result["resources"].as_array().cloned().unwrap_or_default())
    }

    pub async fn read_resource(&mut self, uri: &str) -> Result<Value, McpError> {
        self.request("resources/read", json!({ "uri": uri })).await
    }

    pub async fn request(&mut self, method: &str, params: Value) -> Result<Value, McpError> {
        self.request_with_timeout(method, params, REQUEST_TIMEOUT)
            .await
    }

    /// Write one request line, then read stdout lines until the response
    /// with the matching id arrives.  Unrelated complete lines (stray
    /// notifications, diagnostic JSON that belongs on stderr) are logged
    /// and discarded.
    async fn request_with_timeout(
        &mut self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, McpError> {
        let id = self.next_msg_id;
        self.next_msg_id += 1;
        let msg = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        self.write_line(&msg).await?;

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(McpError::Timeout {
                    server: self.name.clone(),
                    method: method.into(),
                });
            }
            let line = match tokio::time::timeout(remaining, self.stdout.next_line()).await {
                Err(_) => {
                    return Err(McpError::Timeout {
                        server: self.name.clone(),
                        method: method.into(),
                    })
                }
                Ok(Err(e)) => {
                    return Err(McpError::Io {
                        server: self.name.clone(),
                        message: e.to_string(),
                    })
                }
                Ok(Ok(None)) => {
                    return Err(McpError::Io {
                        server: self.name.clone(),
                        message: "server closed stdout".into(),
                    })
                }
                Ok(Ok(Some(line))) => line,
            };

            let v: Value = match serde_json::from_str(&line) {
                Ok(v) => v,
                Err(_) => {
                    warn!(server = %self.name, %line, "discarding non-JSON stdout line");
                    continue;
                }
            };
            if v["id"].as_u64() != Some(id) {
                debug!(server = %self.name, method, "discarding unrelated message");
                continue;
            }
            if let Some(err) = v.get("error").filter(|e| !e.is_null()) {
                return Err(McpError::Protocol {
                    server: self.name.clone(),
                    message: format!(
                        "{} (code {})",
                        err["message"].as_str().unwrap_or("unnamed error"),
                        err["code"].as_i64().unwrap_or(0)
                    ),
                });
            }
            return Ok(v["result"].clone());
        }
    }

    /// Notifications carry no id and are not awaited.
    async fn notify(&mut self, method: &str, params: Value) -> Result<(), McpError> {
        let msg = json!({ "jsonrpc": "2.0", "method": method, "params": params });
        self.write_line(&msg).await
    }

    async fn write_line(&mut self, msg: &Value) -> Result<(), McpError> {
        let mut line = msg.to_string();
        line.push('\n');
        self.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| McpError::Io {
                server: self.name.clone(),
                message: e.to_string(),
            })
    }

    /// Graceful stop: SIGTERM, up to 1 s of polling, then SIGKILL.
    /// `kill_on_drop` remains as the backstop if this is never called.
    pub async fn shutdown(&mut self) {
        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
            for _ in 0..10 {
                if let Ok(Some(status)) = self.child.try_wait() {
                    debug!(server = %self.name, %status, "MCP server exited");
                    return;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
        debug!(server = %self.name, "MCP server killed");
    }
}

/// The schema may live under any of three keys depending on server SDK
/// vintage; absence yields a permissive object schema.
fn extract_input_schema(tool: &Value) -> Value {
    for key in ["inputSchema", "input_schema", "parameters"] {
        if let Some(schema) = tool.get(key) {
            if !schema.is_null() {
                return schema.clone();
            }
        }
    }
    json!({ "type": "object" })
}

fn stderr_log_path(server: &str) -> PathBuf {
    PathBuf::from(format!("./.claude-c/mcp/{server}.log"))
}

/// Continuously copy the child's stderr into its log file so server
/// diagnostics survive the session.
fn spawn_stderr_drain(server: String, stderr: tokio::process::ChildStderr) {
    tokio::spawn(async move {
        let path = stderr_log_path(&server);
        if let Some(parent) = path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await;
        let mut file = match file {
            Ok(f) => f,
            Err(e) => {
                warn!(%server, error = %e, "cannot open MCP stderr log; discarding stderr");
                let mut sink = tokio::io::sink();
                let mut stderr = stderr;
                let _ = tokio::io::copy(&mut stderr, &mut sink).await;
                return;
            }
        };
        let mut stderr = stderr;
        let _ = tokio::io::copy(&mut stderr, &mut file).await;
    });
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::McpServerConfig;

    fn stdio_cfg(command: &str, args: &[&str]) -> McpServerConfig {
        McpServerConfig {
            command: command.into(),
            args: args.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    /// Shell one-liner acting as a minimal MCP server: answers initialize
    /// and tools/list, then echoes tool calls.
    const FAKE_SERVER: &str = r#"
        while IFS= read -r line; do
            id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
            case "$line" in
                *initialize*)
                    printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05"}}\n' "$id" ;;
                *tools/list*)
                    printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"sum","description":"adds","inputSchema":{"type":"object"}}]}}\n' "$id" ;;
                *tools/call*)
                    printf 'not json, goes to the discard path\n'
                    printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"3"}]}}\n' "$id" ;;
                *resources/list*)
                    printf '{"jsonrpc":"2.0","id":%s,"result":{"resources":[{"uri":"file:///tmp/a","name":"a"}]}}\n' "$id" ;;
                *resources/read*)
                    printf '{"jsonrpc":"2.0","id":%s,"result":{"contents":[{"uri":"file:///tmp/a","text":"alpha"}]}}\n' "$id" ;;
            esac
        done
    "#;

    #[test]
    fn schema_is_found_under_any_alias() {
        let a = json!({ "inputSchema": { "type": "object", "required": ["x"] } });
        let b = json!({ "input_schema": { "type": "object" } });
        let c = json!({ "parameters": { "type": "object" } });
        let d = json!({ "name": "bare" });
        assert_eq!(extract_input_schema(&a)["required"][0], "x");
        assert_eq!(extract_input_schema(&b)["type"], "object");
        assert_eq!(extract_input_schema(&c)["type"], "object");
        assert_eq!(extract_input_schema(&d), json!({ "type": "object" }));
    }

    #[test]
    fn sse_transport_is_rejected() {
        let cfg = McpServerConfig {
            url: Some("https://mcp.example/sse".into()),
            ..Default::default()
        };
        let err = tokio::runtime::Runtime::new()
            .unwrap()
            .block_on(McpServer::connect("remote", &cfg))
            .unwrap_err();
        assert!(matches!(err, McpError::Unsupported { .. }));
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let cfg = stdio_cfg("/nonexistent/mcp-binary", &[]);
        let err = McpServer::connect("ghost", &cfg).await.unwrap_err();
        assert!(matches!(err, McpError::Spawn { .. }));
    }

    #[tokio::test]
    async fn empty_command_is_a_spawn_error() {
        let err = McpServer::connect("blank", &McpServerConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::Spawn { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn handshake_discovery_and_call_round_trip() {
        let cfg = stdio_cfg("sh", &["-c", FAKE_SERVER]);
        let mut server = McpServer::connect("fake", &cfg).await.unwrap();
        assert_eq!(server.tools().len(), 1);
        assert_eq!(server.tools()[0].name, "sum");

        // The fake server prefixes its reply with a junk line; the matcher
        // must skip it and still find the real response.
        let (out, is_error) = server.call_tool("sum", json!({"a": 1, "b": 2})).await.unwrap();
        assert_eq!(out, json!("3"));
        assert!(!is_error);

        let resources = server.list_resources().await.unwrap();
        assert_eq!(resources[0]["uri"], "file:///tmp/a");
        let read = server.read_resource("file:///tmp/a").await.unwrap();
        assert_eq!(read["contents"][0]["text"], "alpha");

        server.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn silent_server_times_out_on_handshake() {
        // `cat` consumes stdin and never answers.
        let cfg = stdio_cfg("sh", &["-c", "exec cat > /dev/null"]);
        let started = std::time::Instant::now();
        let err = McpServer::connect("mute", &cfg).await.unwrap_err();
        assert!(matches!(err, McpError::Timeout { .. }));
        assert!(started.elapsed() >= Duration::from_secs(9));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn dead_server_reports_closed_stdout() {
        // Answers the handshake and tools/list, then exits immediately.
        let script = r#"
            read -r line
            id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
            printf '{"jsonrpc":"2.0","id":%s,"result":{}}\n' "$id"
            read -r line
            read -r line
            id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
            printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[]}}\n' "$id"
        "#;
        let cfg = stdio_cfg("sh", &["-c", script]);
        let mut server = McpServer::connect("brief", &cfg).await.unwrap();
        let err = server.call_tool("anything", json!({})).await.unwrap_err();
        assert!(matches!(err, McpError::Io { .. } | McpError::Timeout { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn protocol_error_is_surfaced() {
        let script = r#"
            read -r line
            id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
            printf '{"jsonrpc":"2.0","id":%s,"result":{}}\n' "$id"
            read -r line
            read -r line
            id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
            printf '{"jsonrpc":"2.0","id":%s,"error":{"code":-32601,"message":"method not found"}}\n' "$id"
        "#;
        let cfg = stdio_cfg("sh", &["-c", script]);
        let err = McpServer::connect("erroring", &cfg).await.unwrap_err();
        match err {
            McpError::Protocol { message, .. } => assert!(message.contains("method not found")),
            other => panic!("expected protocol error, got {other:?}"),
        }
    }
}
