// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use nils_model::{sse::StreamEvent, Message, Usage};

use crate::dispatch::ToolCallResult;

/// Events emitted by the agent during a single turn.
/// Consumers (REPL, UI layers) subscribe to these to drive their output.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// A raw SSE event forwarded from the provider stream
    Stream(StreamEvent),
    /// The assistant message appended for this round (text and/or tool calls)
    AssistantMessage(Message),
    /// The model has requested a tool call
    ToolCallStarted { id: String, name: String },
    /// A tool call finished; `result` is what was appended to history
    ToolCallFinished {
        id: String,
        name: String,
        result: ToolCallResult,
    },
    /// Token usage for the round just completed, plus the session total
    TokenUsage { turn: Usage, session: Usage },
    /// A terminal provider error ended the turn
    FatalError(String),
    /// The user interrupted the turn
    Aborted,
    /// The agent has finished processing the current user turn
    TurnComplete,
}
