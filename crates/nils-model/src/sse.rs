// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Server-Sent-Events decoder covering both provider dialects.
//!
//! Anthropic names its events (`event: content_block_delta`); OpenAI sends
//! anonymous `data:` chunks terminated by a `data: [DONE]` sentinel.  The
//! decoder is incremental: feed it raw response bytes as they arrive and it
//! emits complete events, carrying any partial line or half-finished event
//! forward to the next chunk.

use serde_json::Value;
use tracing::debug;

/// The event family, resolved from the SSE `event:` field (or its absence).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEventKind {
    MessageStart,
    ContentBlockStart,
    ContentBlockDelta,
    ContentBlockStop,
    MessageDelta,
    MessageStop,
    Error,
    Ping,
    /// Anonymous data chunk (OpenAI chat-completions dialect).
    OpenAiChunk,
    /// The `data: [DONE]` sentinel.
    OpenAiDone,
}

/// One decoded SSE event: its resolved kind, the raw event-name string,
/// the raw data payload, and the payload parsed as JSON when it is JSON.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEvent {
    pub kind: StreamEventKind,
    /// Raw `event:` field value; empty for anonymous chunks.
    pub event: String,
    /// Concatenated `data:` lines, joined with `\n`.
    pub raw: String,
    /// Best-effort JSON parse of `raw`; `None` when not valid JSON.
    pub data: Option<Value>,
}

fn kind_for(event: &str, raw: &str) -> StreamEventKind {
    match event {
        "message_start" => StreamEventKind::MessageStart,
        "content_block_start" => StreamEventKind::ContentBlockStart,
        "content_block_delta" => StreamEventKind::ContentBlockDelta,
        "content_block_stop" => StreamEventKind::ContentBlockStop,
        "message_delta" => StreamEventKind::MessageDelta,
        "message_stop" => StreamEventKind::MessageStop,
        "error" => StreamEventKind::Error,
        "ping" => StreamEventKind::Ping,
        "" if raw == "[DONE]" => StreamEventKind::OpenAiDone,
        _ => StreamEventKind::OpenAiChunk,
    }
}

/// Incremental SSE decoder.
///
/// Lines may be terminated by `\n` or `\r\n`; an event is dispatched on the
/// first empty line after at least one `event:` or `data:` field.  Comment
/// lines (leading `:`) and unknown fields are ignored.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: String,
    event_name: String,
    data_lines: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw response bytes; returns every event completed by them.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<StreamEvent> {
        self.buf.push_str(&String::from_utf8_lossy(bytes));
        let mut out = Vec::new();
        while let Some(pos) = self.buf.find('\n') {
            let line = self.buf[..pos].trim_end_matches('\r').to_string();
            self.buf.drain(..=pos);
            self.feed_line(&line, &mut out);
        }
        out
    }

    fn feed_line(&mut self, line: &str, out: &mut Vec<StreamEvent>) {
        if line.is_empty() {
            if let Some(ev) = self.dispatch() {
                out.push(ev);
            }
            return;
        }
        if line.starts_with(':') {
            return;
        }
        if let Some(rest) = line.strip_prefix("event:") {
            self.event_name = rest.strip_prefix(' ').unwrap_or(rest).to_string();
        } else if let Some(rest) = line.strip_prefix("data:") {
            self.data_lines
                .push(rest.strip_prefix(' ').unwrap_or(rest).to_string());
        }
        // Unknown fields (id:, retry:, …) are ignored.
    }

    fn dispatch(&mut self) -> Option<StreamEvent> {
        if self.event_name.is_empty() && self.data_lines.is_empty() {
            return None;
        }
        let event = std::mem::take(&mut self.event_name);
        let raw = std::mem::take(&mut self.data_lines).join("\n");
        let kind = kind_for(&event, &raw);
        let data = if kind == StreamEventKind::OpenAiDone || raw.is_empty() {
            None
        } else {
            match serde_json::from_str::<Value>(&raw) {
                Ok(v) => Some(v),
                Err(e) => {
                    debug!(event = %event, error = %e, "SSE data payload is not JSON");
                    None
                }
            }
        };
        Some(StreamEvent {
            kind,
            event,
            raw,
            data,
        })
    }
}

/// Re-emit an event as SSE wire text.
///
/// Used by the mock transport in tests; parsing `encode` output yields the
/// original event sequence (modulo comments and whitespace).
pub fn encode(ev: &StreamEvent) -> String {
    let mut out = String::new();
    if !ev.event.is_empty() {
        out.push_str("event: ");
        out.push_str(&ev.event);
        out.push('\n');
    }
    for line in ev.raw.split('\n') {
        out.push_str("data: ");
        out.push_str(line);
        out.push('\n');
    }
    out.push('\n');
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
