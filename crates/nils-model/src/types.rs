// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─── Conversation model ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A single content item within a message.
///
/// Assistant turns mix `Text` with `ToolCall` items; tool turns carry
/// exactly one `ToolResult`; user turns may mix `Text` with `Image`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Content {
    Text {
        text: String,
    },
    ToolCall {
        id: String,
        name: String,
        params: Value,
    },
    ToolResult {
        tool_call_id: String,
        output: Value,
        #[serde(default)]
        is_error: bool,
    },
    /// User-role only.  `data` is the base64-encoded image payload.
    Image {
        mime_type: String,
        data: String,
    },
}

/// A single message in the conversation history: a role plus an ordered
/// list of content items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<Content>,
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: vec![Content::Text { text: text.into() }],
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![Content::Text { text: text.into() }],
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: vec![Content::Text { text: text.into() }],
        }
    }

    /// Assistant turn carrying optional text plus the model's tool calls.
    pub fn assistant_with_calls(text: Option<String>, calls: Vec<ToolCallRequest>) -> Self {
        let mut content = Vec::with_capacity(calls.len() + 1);
        if let Some(t) = text {
            if !t.is_empty() {
                content.push(Content::Text { text: t });
            }
        }
        for c in calls {
            content.push(Content::ToolCall {
                id: c.id,
                name: c.name,
                params: c.params,
            });
        }
        Self {
            role: Role::Assistant,
            content,
        }
    }

    pub fn tool_result(id: impl Into<String>, output: Value, is_error: bool) -> Self {
        Self {
            role: Role::Tool,
            content: vec![Content::ToolResult {
                tool_call_id: id.into(),
                output,
                is_error,
            }],
        }
    }

    /// User turn mixing text and base64 images.
    pub fn user_with_content(content: Vec<Content>) -> Self {
        Self {
            role: Role::User,
            content,
        }
    }

    /// Concatenated text of all `Text` items, or `None` if there are none.
    pub fn text(&self) -> Option<String> {
        let parts: Vec<&str> = self
            .content
            .iter()
            .filter_map(|c| match c {
                Content::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n"))
        }
    }

    /// Ids of all tool calls issued by this message.
    pub fn tool_call_ids(&self) -> Vec<&str> {
        self.content
            .iter()
            .filter_map(|c| match c {
                Content::ToolCall { id, .. } => Some(id.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn has_tool_calls(&self) -> bool {
        self.content
            .iter()
            .any(|c| matches!(c, Content::ToolCall { .. }))
    }
}

// ─── Provider-facing request / response ───────────────────────────────────────

/// A tool schema provided to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object
    pub parameters: Value,
}

/// The canonical request every provider driver consumes.
#[derive(Debug, Clone, Default)]
pub struct ProviderRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    /// `None` falls back to the wire default of 8192.
    pub max_tokens: Option<u32>,
    /// Attach prompt-cache markers where the dialect supports them.
    pub enable_caching: bool,
}

/// A tool invocation parsed out of a model response.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub params: Value,
}

/// Token usage from one completion.  Fields the provider does not report
/// stay zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub prompt: u32,
    pub completion: u32,
    pub total: u32,
    pub cached_hit: u32,
    pub cached_miss: u32,
    pub cache_read: u32,
}

impl Usage {
    pub fn add(&mut self, other: &Usage) {
        self.prompt += other.prompt;
        self.completion += other.completion;
        self.total += other.total;
        self.cached_hit += other.cached_hit;
        self.cached_miss += other.cached_miss;
        self.cache_read += other.cache_read;
    }
}

/// The provider response normalized out of either wire dialect.
#[derive(Debug, Clone, Default)]
pub struct CanonicalResponse {
    pub text: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
    pub usage: Usage,
}

/// Everything a single provider call produced, success or not.
#[derive(Debug, Default)]
pub struct ApiCallResult {
    pub response: Option<CanonicalResponse>,
    pub raw_body: String,
    pub http_status: u16,
    pub duration_ms: u64,
    pub error: Option<crate::ApiError>,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
