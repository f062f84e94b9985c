// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Anthropic Messages driver.
//!
//! Translates the canonical (OpenAI-shaped) request into the Messages
//! dialect: the system message is lifted into a top-level `system` field,
//! assistant tool calls become `tool_use` content blocks, tool results
//! become `tool_result` blocks on a user turn, and tool schemas move to
//! `input_schema`.  When prompt caching is enabled, `cache_control`
//! markers are attached to the last system block, the last tool
//! definition, and the last user text block of the current turn.

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::http::{self, HttpRequest};
use crate::openai::{output_to_string, DEFAULT_MAX_TOKENS};
use crate::provider::{CallContext, Provider};
use crate::sse::{StreamEvent, StreamEventKind};
use crate::{
    ApiCallResult, ApiError, CanonicalResponse, Content, Message, ProviderRequest, Role,
    ToolCallRequest, Usage,
};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const DEFAULT_API_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    api_key: String,
    messages_url: String,
    version: String,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(api_key: String, base_url: Option<String>) -> Self {
        let base = std::env::var("ANTHROPIC_API_URL")
            .ok()
            .or(base_url)
            .unwrap_or_else(|| DEFAULT_BASE_URL.into());
        let version =
            std::env::var("ANTHROPIC_VERSION").unwrap_or_else(|_| DEFAULT_API_VERSION.into());
        Self {
            api_key,
            messages_url: format!("{}/v1/messages", base.trim_end_matches('/')),
            version,
            client: http::build_client(),
        }
    }
}

#[async_trait::async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn call(&self, req: &ProviderRequest, ctx: &CallContext) -> ApiCallResult {
        if self.api_key.is_empty() {
            return ApiCallResult::from_error(ApiError::Config("ANTHROPIC_API_KEY not set".into()));
        }

        let streaming = ctx.stream.is_some();
        let mut body = build_request_body(req);
        if streaming {
            body["stream"] = json!(true);
        }

        debug!(
            model = %req.model,
            message_count = req.messages.len(),
            tool_count = req.tools.len(),
            caching = req.enable_caching,
            streaming,
            "sending anthropic request"
        );

        let http_req = HttpRequest::post(&self.messages_url, body.to_string())
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", &self.version);

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
            let (canonical, stream_error) = assembler.finish();
            ApiCallResult {
                response: Some(canonical),
                raw_body: String::new(),
                http_status: resp.status,
                duration_ms: resp.duration_ms,
                error: stream_error,
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
                .and_then(|v| parse_response_body(&v))
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

/// Build the Messages request body.  Shared with the Bedrock driver, which
/// sends the same shape to its invoke endpoint.
pub(crate) fn build_request_body(req: &ProviderRequest) -> Value {
    let (system, messages) = build_anthropic_messages(&req.messages, req.enable_caching);

    let mut body = json!({
        "model": req.model,
        "max_tokens": req.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        "messages": messages,
    });
    if let Some(system) = system {
        body["system"] = system;
    }
    if !req.tools.is_empty() {
        let last = req.tools.len() - 1;
        let tools: Vec<Value> = req
            .tools
            .iter()
            .enumerate()
            .map(|(i, t)| {
                let mut tool = json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.parameters,
                });
                if req.enable_caching && i == last {
                    tool["cache_control"] = cache_marker();
                }
                tool
            })
            .collect();
        body["tools"] = json!(tools);
    }
    body
}

fn cache_marker() -> Value {
    json!({ "type": "ephemeral" })
}

/// Convert canonical messages into `(system, messages)` for the wire.
///
/// The system field is an array of text blocks so a cache marker can be
/// attached to the last one; without caching it collapses to a string.
pub(crate) fn build_anthropic_messages(
    messages: &[Message],
    caching: bool,
) -> (Option<Value>, Vec<Value>) {
    let mut system_texts: Vec<String> = Vec::new();
    let mut out: Vec<Value> = Vec::new();

    for m in messages {
        match m.role {
            Role::System => {
                if let Some(t) = m.text() {
                    system_texts.push(t);
                }
            }
            Role::User => {
                let blocks = user_blocks(&m.content);
                if !blocks.is_empty() {
                    out.push(json!({ "role": "user", "content": blocks }));
                }
            }
            Role::Assistant => {
                let mut blocks: Vec<Value> = Vec::new();
                if let Some(t) = m.text() {
                    if !t.is_empty() {
                        blocks.push(json!({ "type": "text", "text": t }));
                    }
                }
                for c in &m.content {
                    if let Content::ToolCall { id, name, params } = c {
                        blocks.push(json!({
                            "type": "tool_use",
                            "id": id,
                            "name": name,
                            "input": params,
                        }));
                    }
                }
                // A message with neither text nor calls has no wire
                // representation and is dropped.
                if !blocks.is_empty() {
                    out.push(json!({ "role": "assistant", "content": blocks }));
                }
            }
            Role::Tool => {
                let blocks: Vec<Value> = m
                    .content
                    .iter()
                    .filter_map(|c| match c {
                        Content::ToolResult {
                            tool_call_id,
                            output,
                            is_error,
                        } => {
                            let mut block = json!({
                                "type": "tool_result",
                                "tool_use_id": tool_call_id,
                                "content": output_to_string(output),
                            });
                            if *is_error {
                                block["is_error"] = json!(true);
                            }
                            Some(block)
                        }
                        _ => None,
                    })
                    .collect();
                if !blocks.is_empty() {
                    out.push(json!({ "role": "user", "content": blocks }));
                }
            }
        }
    }

    if caching {
        mark_last_user_text_block(&mut out);
    }

    let system = if system_texts.is_empty() {
        None
    } else if caching {
        let last = system_texts.len() - 1;
        let blocks: Vec<Value> = system_texts
            .iter()
            .enumerate()
            .map(|(i, t)| {
                let mut block = json!({ "type": "text", "text": t });
                if i == last {
                    block["cache_control"] = cache_marker();
                }
                block
            })
            .collect();
        Some(json!(blocks))
    } else {
        Some(json!(system_texts.join("\n\n")))
    };

    (system, out)
}

fn user_blocks(content: &[Content]) -> Vec<Value> {
    content
        .iter()
        .filter_map(|c| match c {
            Content::Text { text } => Some(json!({ "type": "text", "text": text })),
            Content::Image { mime_type, data } => Some(json!({
                "type": "image",
                "source": {
                    "type": "base64",
                    "media_type": mime_type,
                    "data": data,
                }
            })),
            _ => None,
        })
        .collect()
}

/// Attach a cache marker to the last text block of the last true user turn
/// (tool-result turns also serialize as `role: user` but carry no text
/// blocks, so the scan skips them naturally).
fn mark_last_user_text_block(messages: &mut [Value]) {
    for msg in messages.iter_mut().rev() {
        if msg["role"] != "user" {
            continue;
        }
        if let Some(blocks) = msg["content"].as_array_mut() {
            if let Some(block) = blocks
                .iter_mut()
                .rev()
                .find(|b| b["type"] == "text")
            {
                block["cache_control"] = cache_marker();
                return;
            }
        }
    }
}

// ─── Wire → canonical ─────────────────────────────────────────────────────────

/// Convert a Messages response body: the first `text` block becomes the
/// canonical text; every `tool_use` block lifts into a tool call.
pub(crate) fn parse_response_body(v: &Value) -> Result<CanonicalResponse, ApiError> {
    let content = v["content"]
        .as_array()
        .ok_or_else(|| ApiError::InvalidResponse("no content array in response".into()))?;

    let mut text: Option<String> = None;
    let mut tool_calls = Vec::new();
    for block in content {
        match block["type"].as_str().unwrap_or_default() {
            "text" => {
                if text.is_none() {
                    let t = block["text"].as_str().unwrap_or_default();
                    if !t.is_empty() {
                        text = Some(t.to_string());
                    }
                }
            }
            "tool_use" => {
                let name = block["name"].as_str().unwrap_or_default();
                if name.is_empty() {
                    warn!("tool_use block without a name; skipping");
                    continue;
                }
                tool_calls.push(ToolCallRequest {
                    id: block["id"].as_str().unwrap_or_default().to_string(),
                    name: name.to_string(),
                    params: block["input"].clone(),
                });
            }
            _ => {}
        }
    }

    Ok(CanonicalResponse {
        text,
        tool_calls,
        usage: parse_usage(&v["usage"]),
    })
}

pub(crate) fn parse_usage(usage: &Value) -> Usage {
    let prompt = usage["input_tokens"].as_u64().unwrap_or(0) as u32;
    let completion = usage["output_tokens"].as_u64().unwrap_or(0) as u32;
    Usage {
        prompt,
        completion,
        total: prompt + completion,
        cached_hit: 0,
        cached_miss: 0,
        cache_read: usage["cache_read_input_tokens"].as_u64().unwrap_or(0) as u32,
    }
}

// ─── Streaming assembly ───────────────────────────────────────────────────────

#[derive(Default)]
struct PendingBlock {
    id: String,
    name: String,
    args: String,
}

/// Accumulates the named Anthropic stream events into a canonical response.
#[derive(Default)]
struct StreamAssembler {
    text: String,
    /// Open tool_use blocks keyed by content-block index.
    pending: std::collections::BTreeMap<u64, PendingBlock>,
    usage: Usage,
    error: Option<String>,
}

impl StreamAssembler {
    fn feed(&mut self, ev: &StreamEvent) {
        let data = ev.data.as_ref();
        match ev.kind {
            StreamEventKind::MessageStart => {
                if let Some(usage) = data.and_then(|v| v["message"].get("usage")) {
                    self.usage.prompt = usage["input_tokens"].as_u64().unwrap_or(0) as u32;
                    self.usage.cache_read =
                        usage["cache_read_input_tokens"].as_u64().unwrap_or(0) as u32;
                }
            }
            StreamEventKind::ContentBlockStart => {
                let Some(v) = data else { return };
                let block = &v["content_block"];
                if block["type"] == "tool_use" {
                    let index = v["index"].as_u64().unwrap_or(0);
                    self.pending.insert(
                        index,
                        PendingBlock {
                            id: block["id"].as_str().unwrap_or_default().to_string(),
                            name: block["name"].as_str().unwrap_or_default().to_string(),
                            args: String::new(),
                        },
                    );
                }
            }
            StreamEventKind::ContentBlockDelta => {
                let Some(v) = data else { return };
                let delta = &v["delta"];
                match delta["type"].as_str().unwrap_or_default() {
                    "text_delta" => {
                        self.text.push_str(delta["text"].as_str().unwrap_or_default());
                    }
                    "input_json_delta" => {
                        let index = v["index"].as_u64().unwrap_or(0);
                        if let Some(block) = self.pending.get_mut(&index) {
                            block
                                .args
                                .push_str(delta["partial_json"].as_str().unwrap_or_default());
                        }
                    }
                    _ => {}
                }
            }
            StreamEventKind::MessageDelta => {
                if let Some(usage) = data.and_then(|v| v.get("usage")) {
                    self.usage.completion = usage["output_tokens"].as_u64().unwrap_or(0) as u32;
                }
            }
            StreamEventKind::Error => {
                let message = data
                    .and_then(|v| v["error"]["message"].as_str())
                    .unwrap_or("unnamed stream error")
                    .to_string();
                warn!(error = %message, "anthropic stream error event");
                self.error = Some(message);
            }
            _ => {}
        }
    }

    fn finish(mut self) -> (CanonicalResponse, Option<ApiError>) {
        self.usage.total = self.usage.prompt + self.usage.completion;
        let mut tool_calls = Vec::with_capacity(self.pending.len());
        for (_, block) in std::mem::take(&mut self.pending) {
            if block.name.is_empty() {
                warn!(call_id = %block.id, "dropping streamed tool_use with empty name");
                continue;
            }
            let params = if block.args.is_empty() {
                json!({})
            } else {
                serde_json::from_str(&block.args).unwrap_or_else(|e| {
                    warn!(tool = %block.name, error = %e, "unparseable tool_use input; substituting {{}}");
                    json!({})
                })
            };
            tool_calls.push(ToolCallRequest {
                id: block.id,
                name: block.name,
                params,
            });
        }
        let error = self.error.map(|message| {
            let retryable = message.contains("overloaded");
            ApiError::Transport { message, retryable }
        });
        (
            CanonicalResponse {
                text: if self.text.is_empty() {
                    None
                } else {
                    Some(self.text)
                },
                tool_calls,
                usage: self.usage,
            },
            error,
        )
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
