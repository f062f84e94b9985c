// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Mutex;

use serde_json::json;

use crate::provider::{CallContext, Provider};
use crate::{
    ApiCallResult, CanonicalResponse, ProviderRequest, Role, ToolCallRequest, Usage,
};

/// A pre-scripted mock provider.  Each `call` pops the next canonical
/// response from the front of the queue; when the queue runs dry it echoes
/// the last user message.  Lets tests (and `--model mock` offline runs)
/// drive the agent loop without network access.
pub struct ScriptedProvider {
    scripts: Mutex<Vec<CanonicalResponse>>,
    /// The last request seen, so tests can inspect what was sent.
    pub last_request: Mutex<Option<ProviderRequest>>,
}

impl ScriptedProvider {
    pub fn new(scripts: Vec<CanonicalResponse>) -> Self {
        Self {
            scripts: Mutex::new(scripts),
            last_request: Mutex::new(None),
        }
    }

    /// Convenience: provider that always returns a single text reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        Self::new(vec![CanonicalResponse {
            text: Some(reply.into()),
            ..Default::default()
        }])
    }

    /// Convenience: a tool call on the first round, then a text reply.
    pub fn tool_then_text(
        tool_id: impl Into<String>,
        tool_name: impl Into<String>,
        params: serde_json::Value,
        final_text: impl Into<String>,
    ) -> Self {
        Self::new(vec![
            CanonicalResponse {
                text: None,
                tool_calls: vec![ToolCallRequest {
                    id: tool_id.into(),
                    name: tool_name.into(),
                    params,
                }],
                usage: Usage::default(),
            },
            CanonicalResponse {
                text: Some(final_text.into()),
                ..Default::default()
            },
        ])
    }
}

#[async_trait::async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn call(&self, req: &ProviderRequest, _ctx: &CallContext) -> ApiCallResult {
        *self.last_request.lock().unwrap() = Some(req.clone());
        let mut scripts = self.scripts.lock().unwrap();
        let response = if scripts.is_empty() {
            let echo = req
                .messages
                .iter()
                .rev()
                .find(|m| m.role == Role::User)
                .and_then(|m| m.text())
                .unwrap_or_else(|| "[no input]".into());
            CanonicalResponse {
                text: Some(format!("MOCK: {echo}")),
                tool_calls: vec![],
                usage: Usage {
                    prompt: 10,
                    completion: 10,
                    total: 20,
                    ..Default::default()
                },
            }
        } else {
            scripts.remove(0)
        };
        ApiCallResult {
            response: Some(response),
            raw_body: json!({"mock": true}).to_string(),
            http_status: 200,
            duration_ms: 0,
            error: None,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Message;

    #[tokio::test]
    async fn scripts_pop_in_order() {
        let p = ScriptedProvider::tool_then_text("c1", "echo", json!({"x": 1}), "done");
        let req = ProviderRequest {
            messages: vec![Message::user("go")],
            ..Default::default()
        };
        let ctx = CallContext::default();
        let first = p.call(&req, &ctx).await.response.unwrap();
        assert_eq!(first.tool_calls.len(), 1);
        let second = p.call(&req, &ctx).await.response.unwrap();
        assert_eq!(second.text.as_deref(), Some("done"));
    }

    #[tokio::test]
    async fn exhausted_scripts_echo_last_user_message() {
        let p = ScriptedProvider::new(vec![]);
        let req = ProviderRequest {
            messages: vec![Message::user("ping")],
            ..Default::default()
        };
        let r = p.call(&req, &CallContext::default()).await;
        assert_eq!(r.response.unwrap().text.as_deref(), Some("MOCK: ping"));
    }

    #[tokio::test]
    async fn last_request_is_recorded() {
        let p = ScriptedProvider::always_text("hi");
        let req = ProviderRequest {
            model: "mock-model".into(),
            messages: vec![Message::user("q")],
            ..Default::default()
        };
        p.call(&req, &CallContext::default()).await;
        let seen = p.last_request.lock().unwrap();
        assert_eq!(seen.as_ref().unwrap().model, "mock-model");
    }
}
