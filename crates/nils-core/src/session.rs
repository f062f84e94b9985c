// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use uuid::Uuid;

use nils_model::{Message, Usage};
use nils_tools::ToolRegistry;

use crate::persist::PersistenceSink;

/// The canonical conversation owned by one session.
///
/// Messages are append-only; every append is mirrored to the persistence
/// sink.  The interrupt flag is the single cooperative cancellation
/// signal shared with the transport and the dispatcher.
pub struct ConversationState {
    pub session_id: String,
    pub model: String,
    pub working_dir: PathBuf,
    pub messages: Vec<Message>,
    /// Accumulated token usage across the session.
    pub usage: Usage,
    interrupt: Arc<AtomicBool>,
    registry: Arc<ToolRegistry>,
    sink: Arc<dyn PersistenceSink>,
}

impl ConversationState {
    pub fn new(
        model: impl Into<String>,
        working_dir: PathBuf,
        registry: Arc<ToolRegistry>,
        sink: Arc<dyn PersistenceSink>,
    ) -> Self {
        let session_id = Uuid::new_v4().to_string();
        let model = model.into();
        sink.on_session_started(&session_id, &model);
        Self {
            session_id,
            model,
            working_dir,
            messages: Vec::new(),
            usage: Usage::default(),
            interrupt: Arc::new(AtomicBool::new(false)),
            registry,
            sink,
        }
    }

    /// Pre-populate history (session resumption happens outside the core).
    /// Seeded messages are not re-persisted.
    pub fn seed_history(&mut self, messages: Vec<Message>) {
        self.messages = messages;
    }

    pub fn push(&mut self, msg: Message) {
        self.sink.on_message_appended(&msg);
        self.messages.push(msg);
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    pub fn request_interrupt(&self) {
        self.interrupt.store(true, Ordering::SeqCst);
    }

    pub fn interrupted(&self) -> bool {
        self.interrupt.load(Ordering::SeqCst)
    }

    pub fn clear_interrupt(&self) {
        self.interrupt.store(false, Ordering::SeqCst);
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::NullSink;
    use std::sync::Mutex;

    fn state() -> ConversationState {
        ConversationState::new(
            "test-model",
            PathBuf::from("."),
            Arc::new(ToolRegistry::new()),
            Arc::new(NullSink),
        )
    }

    #[test]
    fn sessions_get_unique_ids() {
        assert_ne!(state().session_id, state().session_id);
    }

    #[test]
    fn interrupt_flag_is_shared() {
        let s = state();
        let flag = s.interrupt_flag();
        assert!(!s.interrupted());
        flag.store(true, Ordering::SeqCst);
        assert!(s.interrupted());
        s.clear_interrupt();
        assert!(!s.interrupted());
    }

    struct RecordingSink {
        appended: Mutex<Vec<String>>,
    }

    impl PersistenceSink for RecordingSink {
        fn on_session_started(&self, session_id: &str, _model: &str) {
            self.appended
                .lock()
                .unwrap()
                .push(format!("start:{session_id}"));
        }
        fn on_message_appended(&self, message: &Message) {
            self.appended
                .lock()
                .unwrap()
                .push(format!("{:?}", message.role));
        }
    }

    #[test]
    fn every_push_reaches_the_sink() {
        let sink = Arc::new(RecordingSink {
            appended: Mutex::new(vec![]),
        });
        let mut s = ConversationState::new(
            "m",
            PathBuf::from("."),
            Arc::new(ToolRegistry::new()),
            sink.clone(),
        );
        s.push(Message::user("a"));
        s.push(Message::assistant("b"));
        let events = sink.appended.lock().unwrap();
        assert_eq!(events.len(), 3);
        assert!(events[0].starts_with("start:"));
        assert_eq!(events[1], "User");
        assert_eq!(events[2], "Assistant");
    }

    #[test]
    fn seeded_history_is_not_repersisted() {
        let sink = Arc::new(RecordingSink {
            appended: Mutex::new(vec![]),
        });
        let mut s = ConversationState::new(
            "m",
            PathBuf::from("."),
            Arc::new(ToolRegistry::new()),
            sink.clone(),
        );
        s.seed_history(vec![Message::user("old"), Message::assistant("turn")]);
        assert_eq!(s.messages.len(), 2);
        // only the session-start event reached the sink
        assert_eq!(sink.appended.lock().unwrap().len(), 1);
    }
}
