// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashSet;
use std::sync::Arc;

use serde_json::json;
use tokio::sync::mpsc;
use tracing::warn;

use nils_config::AgentConfig;
use nils_model::{
    prompt_caching_enabled, retry::call_with_retry, ApiError, CallContext, Message, Provider,
    ProviderRequest, ToolDefinition,
};
use nils_tools::ToolCall;

use crate::dispatch::dispatch;
use crate::events::AgentEvent;
use crate::session::ConversationState;

/// The core agent.  Owns the conversation and drives the model ↔ tool loop.
pub struct Agent {
    state: ConversationState,
    provider: Arc<dyn Provider>,
    config: AgentConfig,
    max_tokens: Option<u32>,
    enable_caching: bool,
}

impl Agent {
    pub fn new(
        provider: Arc<dyn Provider>,
        state: ConversationState,
        config: AgentConfig,
        max_tokens: Option<u32>,
    ) -> Self {
        Self {
            state,
            provider,
            config,
            max_tokens,
            enable_caching: prompt_caching_enabled(),
        }
    }

    pub fn state(&self) -> &ConversationState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut ConversationState {
        &mut self.state
    }

    /// Push a user message and run rounds of model call → tool dispatch
    /// until the model answers in plain text, the user interrupts, or a
    /// terminal error surfaces.  Events stream through `tx`; the caller
    /// drops the receiver when it is no longer interested.
    pub async fn run_turn(
        &mut self,
        user_input: &str,
        tx: mpsc::Sender<AgentEvent>,
    ) -> anyhow::Result<()> {
        self.state.clear_interrupt();
        self.state.push(Message::user(user_input));

        let mut rounds = 0u32;
        loop {
            rounds += 1;
            if rounds > self.config.max_tool_rounds {
                let _ = tx
                    .send(AgentEvent::FatalError(format!(
                        "tool-call budget exhausted after {} rounds",
                        self.config.max_tool_rounds
                    )))
                    .await;
                break;
            }

            // Repair any unanswered tool call before the request leaves the
            // process; providers reject conversations with open calls.
            self.repair_tool_call_closure();

            let result = self.call_model(&tx).await;

            let err = result.error;
            if let Some(ApiError::Interrupted) = err {
                let _ = tx.send(AgentEvent::Aborted).await;
                break;
            }

            let response = match result.response {
                Some(r) => r,
                None => {
                    let message = err
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| "provider returned no response".into());
                    let _ = tx.send(AgentEvent::FatalError(message)).await;
                    break;
                }
            };

            self.state.usage.add(&response.usage);
            let _ = tx
                .send(AgentEvent::TokenUsage {
                    turn: response.usage,
                    session: self.state.usage,
                })
                .await;

            // The assistant turn is appended even when an error follows so
            // history stays consistent with what the provider produced.
            let has_content = response.text.is_some() || !response.tool_calls.is_empty();
            if has_content {
                let assistant =
                    Message::assistant_with_calls(response.text, response.tool_calls.clone());
                self.state.push(assistant.clone());
                let _ = tx.send(AgentEvent::AssistantMessage(assistant)).await;
            }

            if let Some(e) = err {
                let _ = tx.send(AgentEvent::FatalError(e.to_string())).await;
                break;
            }

            if response.tool_calls.is_empty() {
                let _ = tx.send(AgentEvent::TurnComplete).await;
                break;
            }

            let calls: Vec<ToolCall> = response
                .tool_calls
                .iter()
                .map(|tc| ToolCall {
                    id: tc.id.clone(),
                    name: tc.name.clone(),
                    args: tc.params.clone(),
                })
                .collect();
            for c in &calls {
                let _ = tx
                    .send(AgentEvent::ToolCallStarted {
                        id: c.id.clone(),
                        name: c.name.clone(),
                    })
                    .await;
            }

            let results =
                dispatch(&calls, self.state.registry(), &self.state.interrupt_flag()).await;
            for r in results {
                self.state
                    .push(Message::tool_result(r.id.as_str(), r.output.clone(), r.is_error));
                let _ = tx
                    .send(AgentEvent::ToolCallFinished {
                        id: r.id.clone(),
                        name: r.name.clone(),
                        result: r,
                    })
                    .await;
            }

            if self.state.interrupted() {
                let _ = tx.send(AgentEvent::Aborted).await;
                break;
            }
        }

        Ok(())
    }

    /// One provider call with retry, forwarding stream events to the UI.
    async fn call_model(&self, tx: &mpsc::Sender<AgentEvent>) -> nils_model::ApiCallResult {
        let req = ProviderRequest {
            model: self.state.model.clone(),
            messages: self.state.messages.clone(),
            tools: self.tool_definitions(),
            max_tokens: self.max_tokens,
            enable_caching: self.enable_caching,
        };

        let (ev_tx, mut ev_rx) = mpsc::unbounded_channel();
        let forward = tx.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(ev) = ev_rx.recv().await {
                let _ = forward.send(AgentEvent::Stream(ev)).await;
            }
        });

        let ctx = CallContext::new(self.state.interrupt_flag()).with_stream(ev_tx);
        let result =
            call_with_retry(self.provider.as_ref(), &req, &ctx, self.config.max_retries).await;
        drop(ctx);
        let _ = forwarder.await;
        result
    }

    fn tool_definitions(&self) -> Vec<ToolDefinition> {
        self.state
            .registry()
            .schemas()
            .into_iter()
            .map(|s| ToolDefinition {
                name: s.name,
                description: s.description,
                parameters: s.parameters,
            })
            .collect()
    }

    /// Append a synthetic error result for every tool call that never got
    /// one.  Cancellation cannot leave gaps past this point.
    fn repair_tool_call_closure(&mut self) {
        let mut answered: HashSet<String> = HashSet::new();
        let mut open: Vec<String> = Vec::new();
        for m in &self.state.messages {
            for c in &m.content {
                match c {
                    nils_model::Content::ToolResult { tool_call_id, .. } => {
                        answered.insert(tool_call_id.clone());
                    }
                    nils_model::Content::ToolCall { id, .. } => {
                        open.push(id.clone());
                    }
                    _ => {}
                }
            }
        }
        for id in open {
            if !answered.contains(&id) {
                warn!(call_id = %id, "tool call had no result; injecting synthetic error");
                self.state.push(Message::tool_result(
                    id.as_str(),
                    json!({ "error": "interrupted" }),
                    true,
                ));
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::path::PathBuf;
    use std::time::Duration;

    use nils_model::{
        ApiCallResult, CanonicalResponse, Content, Role, ScriptedProvider, ToolCallRequest,
    };
    use nils_tools::{Tool, ToolOutput, ToolRegistry};

    use crate::persist::NullSink;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "echoes args"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
        }
        async fn execute(&self, call: &nils_tools::ToolCall) -> ToolOutput {
            ToolOutput::ok(&call.id, call.args.clone())
        }
    }

    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }
        fn description(&self) -> &str {
            "sleeps 5s"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
        }
        async fn execute(&self, call: &nils_tools::ToolCall) -> ToolOutput {
            tokio::time::sleep(Duration::from_secs(5)).await;
            ToolOutput::ok(&call.id, json!("done"))
        }
    }

    fn agent_with(provider: Arc<dyn Provider>) -> Agent {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool);
        reg.register(SlowTool);
        let state = ConversationState::new(
            "test-model",
            PathBuf::from("."),
            Arc::new(reg),
            Arc::new(NullSink),
        );
        Agent::new(provider, state, AgentConfig::default(), None)
    }

    fn drain(mut rx: mpsc::Receiver<AgentEvent>) -> Vec<AgentEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    #[tokio::test]
    async fn text_only_response_ends_the_turn() {
        let provider = Arc::new(ScriptedProvider::always_text("hi"));
        let mut agent = agent_with(provider);
        let (tx, rx) = mpsc::channel(64);
        agent.run_turn("hello", tx).await.unwrap();

        let messages = &agent.state().messages;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(messages[1].text().as_deref(), Some("hi"));

        let events = drain(rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, AgentEvent::TurnComplete)));
        assert!(!events
            .iter()
            .any(|e| matches!(e, AgentEvent::ToolCallStarted { .. })));
    }

    #[tokio::test]
    async fn tool_round_appends_call_result_and_final_answer() {
        let provider = Arc::new(ScriptedProvider::tool_then_text(
            "c1",
            "echo",
            json!({"msg": "x"}),
            "done",
        ));
        let mut agent = agent_with(provider);
        let (tx, rx) = mpsc::channel(64);
        agent.run_turn("go", tx).await.unwrap();

        let messages = &agent.state().messages;
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[1].tool_call_ids(), vec!["c1"]);
        match &messages[2].content[0] {
            Content::ToolResult {
                tool_call_id,
                output,
                is_error,
            } => {
                assert_eq!(tool_call_id, "c1");
                assert_eq!(output, &json!({"msg": "x"}));
                assert!(!is_error);
            }
            other => panic!("expected tool result, got {other:?}"),
        }
        assert_eq!(messages[3].text().as_deref(), Some("done"));

        let events = drain(rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, AgentEvent::ToolCallFinished { id, .. } if id == "c1")));
    }

    #[tokio::test]
    async fn unknown_tool_error_feeds_back_and_loop_continues() {
        let provider = Arc::new(ScriptedProvider::tool_then_text(
            "c1",
            "mcp_foo_bar",
            json!({}),
            "recovered",
        ));
        let mut agent = agent_with(provider);
        let (tx, _rx) = mpsc::channel(64);
        agent.run_turn("go", tx).await.unwrap();

        let messages = &agent.state().messages;
        // user, assistant(call), tool_result(error), assistant(recovered)
        assert_eq!(messages.len(), 4);
        match &messages[2].content[0] {
            Content::ToolResult { is_error, .. } => assert!(is_error),
            other => panic!("expected tool result, got {other:?}"),
        }
        assert_eq!(messages[3].text().as_deref(), Some("recovered"));
    }

    #[tokio::test]
    async fn interrupt_during_dispatch_ends_turn_without_second_call() {
        let provider = Arc::new(ScriptedProvider::tool_then_text(
            "c1",
            "slow",
            json!({}),
            "never reached",
        ));
        let mut agent = agent_with(provider);
        let flag = agent.state().interrupt_flag();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
        });

        let (tx, rx) = mpsc::channel(64);
        let started = std::time::Instant::now();
        agent.run_turn("go", tx).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));

        let messages = &agent.state().messages;
        // The synthetic interrupted result closes the tool call; the final
        // "never reached" script was never requested.
        assert_eq!(messages.len(), 3);
        match &messages[2].content[0] {
            Content::ToolResult {
                output, is_error, ..
            } => {
                assert!(is_error);
                assert_eq!(output["error"], "interrupted");
            }
            other => panic!("expected tool result, got {other:?}"),
        }
        assert!(drain(rx).iter().any(|e| matches!(e, AgentEvent::Aborted)));
    }

    #[tokio::test]
    async fn fatal_provider_error_surfaces_and_stops() {
        struct FailingProvider;

        #[async_trait]
        impl Provider for FailingProvider {
            fn name(&self) -> &str {
                "failing"
            }
            async fn call(
                &self,
                _req: &ProviderRequest,
                _ctx: &CallContext,
            ) -> ApiCallResult {
                ApiCallResult {
                    error: Some(ApiError::Http {
                        status: 400,
                        message: "bad request".into(),
                    }),
                    http_status: 400,
                    ..Default::default()
                }
            }
        }

        let mut agent = agent_with(Arc::new(FailingProvider));
        let (tx, rx) = mpsc::channel(64);
        agent.run_turn("go", tx).await.unwrap();
        assert!(drain(rx)
            .iter()
            .any(|e| matches!(e, AgentEvent::FatalError(m) if m.contains("bad request"))));
        // Only the user message made it into history.
        assert_eq!(agent.state().messages.len(), 1);
    }

    #[tokio::test]
    async fn closure_repair_injects_missing_results() {
        let provider = Arc::new(ScriptedProvider::always_text("after repair"));
        let mut agent = agent_with(provider);
        agent.state_mut().seed_history(vec![
            Message::user("start"),
            Message::assistant_with_calls(
                None,
                vec![
                    ToolCallRequest {
                        id: "a1".into(),
                        name: "echo".into(),
                        params: json!({}),
                    },
                    ToolCallRequest {
                        id: "a2".into(),
                        name: "echo".into(),
                        params: json!({}),
                    },
                ],
            ),
            Message::tool_result("a1", json!("answered"), false),
        ]);

        let (tx, _rx) = mpsc::channel(64);
        agent.run_turn("continue", tx).await.unwrap();

        let messages = &agent.state().messages;
        // seeded(3) + user + synthetic a2 result + assistant … but the
        // repair runs after the user push, so: start, assistant, a1 result,
        // user(continue), a2 synthetic, assistant(after repair).
        let synthetic = messages
            .iter()
            .flat_map(|m| &m.content)
            .find_map(|c| match c {
                Content::ToolResult {
                    tool_call_id,
                    output,
                    is_error,
                } if tool_call_id == "a2" => Some((output.clone(), *is_error)),
                _ => None,
            })
            .expect("synthetic result for a2");
        assert!(synthetic.1);
        assert_eq!(synthetic.0["error"], "interrupted");
        assert_eq!(
            messages.last().unwrap().text().as_deref(),
            Some("after repair")
        );
    }

    #[tokio::test]
    async fn usage_accumulates_across_rounds() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            CanonicalResponse {
                text: None,
                tool_calls: vec![ToolCallRequest {
                    id: "c1".into(),
                    name: "echo".into(),
                    params: json!({}),
                }],
                usage: nils_model::Usage {
                    prompt: 10,
                    completion: 5,
                    total: 15,
                    ..Default::default()
                },
            },
            CanonicalResponse {
                text: Some("done".into()),
                tool_calls: vec![],
                usage: nils_model::Usage {
                    prompt: 20,
                    completion: 2,
                    total: 22,
                    ..Default::default()
                },
            },
        ]));
        let mut agent = agent_with(provider);
        let (tx, _rx) = mpsc::channel(64);
        agent.run_turn("go", tx).await.unwrap();
        assert_eq!(agent.state().usage.prompt, 30);
        assert_eq!(agent.state().usage.total, 37);
    }

    #[tokio::test]
    async fn tools_are_offered_to_the_provider() {
        let provider = Arc::new(ScriptedProvider::always_text("ok"));
        let mut agent = agent_with(provider.clone());
        let (tx, _rx) = mpsc::channel(64);
        agent.run_turn("go", tx).await.unwrap();
        let seen = provider.last_request.lock().unwrap();
        let tools = &seen.as_ref().unwrap().tools;
        assert!(tools.iter().any(|t| t.name == "echo"));
    }
}
