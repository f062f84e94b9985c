// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Persistence sink: the conversation is written out as it grows, never
//! read back.  Session resumption happens externally by pre-populating
//! the conversation state before the loop starts.

use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use anyhow::Context;
use serde_json::json;
use tracing::warn;

use nils_model::Message;

pub trait PersistenceSink: Send + Sync {
    fn on_session_started(&self, session_id: &str, model: &str);
    fn on_message_appended(&self, message: &Message);
}

/// Discards everything.
pub struct NullSink;

impl PersistenceSink for NullSink {
    fn on_session_started(&self, _session_id: &str, _model: &str) {}
    fn on_message_appended(&self, _message: &Message) {}
}

/// Appends one JSON object per event to a session log file.
pub struct JsonlSink {
    file: Mutex<std::fs::File>,
}

impl JsonlSink {
    pub fn create(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening {}", path.display()))?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    fn write_line(&self, value: serde_json::Value) {
        let mut file = self.file.lock().expect("session log lock");
        if let Err(e) = writeln!(file, "{value}") {
            warn!(error = %e, "failed to append to session log");
        }
    }
}

impl PersistenceSink for JsonlSink {
    fn on_session_started(&self, session_id: &str, model: &str) {
        self.write_line(json!({
            "ts": chrono::Utc::now().to_rfc3339(),
            "session_id": session_id,
            "model": model,
        }));
    }

    fn on_message_appended(&self, message: &Message) {
        self.write_line(json!({
            "ts": chrono::Utc::now().to_rfc3339(),
            "message": message,
        }));
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jsonl_sink_appends_one_line_per_event() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.jsonl");
        let sink = JsonlSink::create(&path).unwrap();
        sink.on_session_started("s-1", "claude-sonnet-4-20250514");
        sink.on_message_appended(&Message::user("hello"));
        sink.on_message_appended(&Message::assistant("hi"));

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        let header: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(header["session_id"], "s-1");
        let first: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(first["message"]["role"], "user");
    }

    #[test]
    fn jsonl_sink_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/logs/session.jsonl");
        assert!(JsonlSink::create(&path).is_ok());
        assert!(path.parent().unwrap().is_dir());
    }
}
