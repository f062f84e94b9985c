// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! OpenAI Chat-Completions driver.
//!
//! The canonical request *is* the OpenAI wire shape, so this driver emits
//! it verbatim: `messages` with `{role, content | tool_calls |
//! tool_call_id}`, `tools` wrapped in `{type: "function"}`, and
//! `max_completion_tokens`.

use std::collections::BTreeMap;

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::http::{self, HttpRequest};
use crate::provider::{CallContext, Provider};
use crate::sse::{StreamEvent, StreamEventKind};
use crate::{
    ApiCallResult, ApiError, CanonicalResponse, Content, Message, ProviderRequest, Role,
    ToolCallRequest, Usage,
};

pub const DEFAULT_MAX_TOKENS: u32 = 8192;
const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiProvider {
    api_key: String,
    chat_url: String,
    /// `Authorization` is the default; `OPENAI_AUTH_HEADER` overrides with a
    /// template whose `%s` is replaced by the key.  A template of the form
    /// `Name: value` installs a custom header instead.
    auth_header: (String, String),
    extra_headers: Vec<(String, String)>,
    client: reqwest::Client,
}

impl OpenAiProvider {
    pub fn new(api_key: String, base_url: Option<String>) -> Self {
        let base = std::env::var("OPENAI_API_BASE")
            .ok()
            .or(base_url)
            .unwrap_or_else(|| DEFAULT_BASE_URL.into());
        let auth_header = match std::env::var("OPENAI_AUTH_HEADER") {
            Ok(template) => resolve_auth_template(&template, &api_key),
            Err(_) => ("Authorization".into(), format!("Bearer {api_key}")),
        };
        let extra_headers = std::env::var("OPENAI_EXTRA_HEADERS")
            .map(|v| parse_extra_headers(&v))
            .unwrap_or_default();
        Self {
            api_key,
            chat_url: format!("{}/chat/completions", base.trim_end_matches('/')),
            auth_header,
            extra_headers,
            client: http::build_client(),
        }
    }
}

/// Expand an auth-header template.  `%s` is replaced by the key; a
/// `Name: value` form selects the header name, otherwise the template
/// becomes the `Authorization` value.
fn resolve_auth_template(template: &str, key: &str) -> (String, String) {
    let expanded = template.replace("%s", key);
    match expanded.split_once(':') {
        Some((name, value)) if !name.trim().is_empty() => {
            (name.trim().to_string(), value.trim().to_string())
        }
        _ => ("Authorization".into(), expanded.trim().to_string()),
    }
}

/// Parse the comma-separated `Name: Value` pairs of `OPENAI_EXTRA_HEADERS`.
fn parse_extra_headers(raw: &str) -> Vec<(String, String)> {
    raw.split(',')
        .filter_map(|pair| {
            let (name, value) = pair.split_once(':')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some((name.to_string(), value.trim().to_string()))
        })
        .collect()
}

#[async_trait::async_trait]
impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn call(&self, req: &ProviderRequest, ctx: &CallContext) -> ApiCallResult {
        if self.api_key.is_empty() {
            return ApiCallResult::from_error(ApiError::Config("OPENAI_API_KEY not set".into()));
        }

        let streaming = ctx.stream.is_some();
        let mut body = build_request_body(req);
        if streaming {
            body["stream"] = json!(true);
            body["stream_options"] = json!({ "include_usage": true });
        }

        debug!(
            model = %req.model,
            message_count = req.messages.len(),
            tool_count = req.tools.len(),
            streaming,
            "sending openai request"
        );

        let mut http_req = HttpRequest::post(&self.chat_url, body.to_string())
            .header(&self.auth_header.0, &self.auth_header.1);
        for (name, value) in &self.extra_headers {
            http_req = http_req.header(name, value);
        }

        if streaming {
            let tx = ctx.stream.clone();
            let mut assembler = StreamAssembler::default();
            let mut on_event = |ev: StreamEvent| {
                assembler.feed(&ev);
                if let Some(tx) = &tx {
                    let _ = tx.send(ev);
                }
            };
            let resp =
                match http::execute_streaming(&self.client, http_req, &ctx.interrupt, &mut on_event)
                    .await
                {
                    Ok(r) => r,
                    Err(e) => return ApiCallResult::from_error(e),
                };
            if resp.status < 200 || resp.status >= 300 {
                return ApiCallResult {
                    http_status: resp.status,
                    duration_ms: resp.duration_ms,
                    error: Some(ApiError::from_http_response(resp.status, &resp.body)),
                    raw_body: resp.body,
                    ..Default::default()
                };
            }
            ApiCallResult {
                response: Some(assembler.finish()),
                raw_body: String::new(),
                http_status: resp.status,
                duration_ms: resp.duration_ms,
                error: None,
            }
        } else {
            let resp = match http::execute(&self.client, http_req, &ctx.interrupt).await {
                Ok(r) => r,
                Err(e) => return ApiCallResult::from_error(e),
            };
            if resp.status < 200 || resp.status >= 300 {
                return ApiCallResult {
                    http_status: resp.status,
                    duration_ms: resp.duration_ms,
                    error: Some(ApiError::from_http_response(resp.status, &resp.body)),
                    raw_body: resp.body,
                    ..Default::default()
                };
            }
            match serde_json::from_str::<Value>(&resp.body)
                .map_err(|e| ApiError::InvalidResponse(format!("response is not JSON: {e}")))
                .and_then(|v| parse_response(&v))
            {
                Ok(canonical) => ApiCallResult {
                    response: Some(canonical),
                    raw_body: resp.body,
                    http_status: resp.status,
                    duration_ms: resp.duration_ms,
                    error: None,
                },
                Err(e) => ApiCallResult {
                    raw_body: resp.body,
                    http_status: resp.status,
                    duration_ms: resp.duration_ms,
                    error: Some(e),
                    ..Default::default()
                },
            }
        }
    }
}

// ─── Canonical → wire ─────────────────────────────────────────────────────────

pub(crate) fn build_request_body(req: &ProviderRequest) -> Value {
    let tools: Vec<Value> = req
        .tools
        .iter()
        .map(|t| {
            json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters,
                }
            })
        })
        .collect();

    let mut body = json!({
        "model": req.model,
        "messages": build_openai_messages(&req.messages),
        "max_completion_tokens": req.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
    });
    if !tools.is_empty() {
        body["tools"] = json!(tools);
    }
    body
}

fn role_str(r: Role) -> &'static str {
    match r {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

/// Render a tool output as the string content OpenAI expects on `tool`
/// messages.  String outputs pass through; anything else is serialized.
pub(crate) fn output_to_string(output: &Value) -> String {
    match output {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub(crate) fn build_openai_messages(messages: &[Message]) -> Vec<Value> {
    let mut out = Vec::with_capacity(messages.len());
    for m in messages {
        match m.role {
            Role::System | Role::User => out.push(text_or_parts_message(m)),
            Role::Assistant => {
                let text = m.text();
                let calls: Vec<Value> = m
                    .content
                    .iter()
                    .filter_map(|c| match c {
                        Content::ToolCall { id, name, params } => Some(json!({
                            "id": id,
                            "type": "function",
                            "function": {
                                "name": name,
                                "arguments": params.to_string(),
                            }
                        })),
                        _ => None,
                    })
                    .collect();
                if text.is_none() && calls.is_empty() {
                    continue;
                }
                let mut msg = json!({
                    "role": "assistant",
                    "content": text.map(Value::String).unwrap_or(Value::Null),
                });
                if !calls.is_empty() {
                    msg["tool_calls"] = json!(calls);
                }
                out.push(msg);
            }
            Role::Tool => {
                for c in &m.content {
                    if let Content::ToolResult {
                        tool_call_id,
                        output,
                        ..
                    } = c
                    {
                        out.push(json!({
                            "role": "tool",
                            "tool_call_id": tool_call_id,
                            "content": output_to_string(output),
                        }));
                    }
                }
            }
        }
    }
    out
}

fn text_or_parts_message(m: &Message) -> Value {
    let role = role_str(m.role);
    match m.content.as_slice() {
        [Content::Text { text }] => json!({ "role": role, "content": text }),
        parts => {
            let content: Vec<Value> = parts
                .iter()
                .filter_map(|c| match c {
                    Content::Text { text } => Some(json!({ "type": "text", "text": text })),
                    Content::Image { mime_type, data } => Some(json!({
                        "type": "image_url",
                        "image_url": { "url": format!("data:{mime_type};base64,{data}") }
                    })),
                    _ => None,
                })
                .collect();
            json!({ "role": role, "content": content })
        }
    }
}

// ─── Wire → canonical ─────────────────────────────────────────────────────────

pub(crate) fn parse_response(v: &Value) -> Result<CanonicalResponse, ApiError> {
    let message = v["choices"]
        .get(0)
        .and_then(|c| c.get("message"))
        .ok_or_else(|| ApiError::InvalidResponse("no choices[0].message in response".into()))?;

    let text = message["content"]
        .as_str()
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string());

    let mut tool_calls = Vec::new();
    if let Some(calls) = message["tool_calls"].as_array() {
        for tc in calls {
            let id = tc["id"].as_str().unwrap_or_default().to_string();
            let name = tc["function"]["name"].as_str().unwrap_or_default();
            if name.is_empty() {
                warn!(call_id = %id, "tool call without a function name; skipping");
                continue;
            }
            let args_raw = tc["function"]["arguments"].as_str().unwrap_or("{}");
            let params = serde_json::from_str(args_raw).unwrap_or_else(|e| {
                warn!(tool = name, error = %e, "unparseable tool arguments; substituting {{}}");
                json!({})
            });
            tool_calls.push(ToolCallRequest {
                id,
                name: name.to_string(),
                params,
            });
        }
    }

    Ok(CanonicalResponse {
        text,
        tool_calls,
        usage: parse_usage(&v["usage"]),
    })
}

pub(crate) fn parse_usage(usage: &Value) -> Usage {
    Usage {
        prompt: usage["prompt_tokens"].as_u64().unwrap_or(0) as u32,
        completion: usage["completion_tokens"].as_u64().unwrap_or(0) as u32,
        total: usage["total_tokens"].as_u64().unwrap_or(0) as u32,
        cached_hit: usage["prompt_cache_hit_tokens"].as_u64().unwrap_or(0) as u32,
        cached_miss: usage["prompt_cache_miss_tokens"].as_u64().unwrap_or(0) as u32,
        cache_read: usage["prompt_tokens_details"]["cached_tokens"]
            .as_u64()
            .unwrap_or(0) as u32,
    }
}

// ─── Streaming assembly ───────────────────────────────────────────────────────

#[derive(Default)]
struct PendingCall {
    id: String,
    name: String,
    args: String,
}

/// Accumulates `OpenAiChunk` events into a canonical response.  Parallel
/// tool calls interleave by `index`, so accumulation is keyed on it.
#[derive(Default)]
pub(crate) struct StreamAssembler {
    text: String,
    pending: BTreeMap<u32, PendingCall>,
    usage: Usage,
}

impl StreamAssembler {
    pub(crate) fn feed(&mut self, ev: &StreamEvent) {
        if ev.kind != StreamEventKind::OpenAiChunk {
            return;
        }
        let Some(v) = &ev.data else { return };

        if let Some(usage) = v.get("usage").filter(|u| !u.is_null()) {
            self.usage = parse_usage(usage);
        }

        let delta = &v["choices"][0]["delta"];
        if let Some(text) = delta["content"].as_str() {
            self.text.push_str(text);
        }
        if let Some(calls) = delta["tool_calls"].as_array() {
            for tc in calls {
                let index = tc["index"].as_u64().unwrap_or(0) as u32;
                let entry = self.pending.entry(index).or_default();
                if let Some(id) = tc["id"].as_str() {
                    if !id.is_empty() {
                        entry.id = id.to_string();
                    }
                }
                if let Some(name) = tc["function"]["name"].as_str() {
                    if !name.is_empty() {
                        entry.name = name.to_string();
                    }
                }
                if let Some(args) = tc["function"]["arguments"].as_str() {
                    entry.args.push_str(args);
                }
            }
        }
    }

    pub(crate) fn finish(self) -> CanonicalResponse {
        let mut tool_calls = Vec::with_capacity(self.pending.len());
        for (_, pc) in self.pending {
            if pc.name.is_empty() {
                warn!(call_id = %pc.id, "dropping streamed tool call with empty name");
                continue;
            }
            let params = if pc.args.is_empty() {
                json!({})
            } else {
                serde_json::from_str(&pc.args).unwrap_or_else(|e| {
                    warn!(tool = %pc.name, error = %e, "unparseable streamed arguments; substituting {{}}");
                    json!({})
                })
            };
            tool_calls.push(ToolCallRequest {
                id: pc.id,
                name: pc.name,
                params,
            });
        }
        CanonicalResponse {
            text: if self.text.is_empty() {
                None
            } else {
                Some(self.text)
            },
            tool_calls,
            usage: self.usage,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
