// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::sse::StreamEvent;
use crate::{ApiCallResult, ProviderRequest};

/// Per-call context threaded through every driver.
///
/// `interrupt` is the session-wide cancellation flag; the transport checks
/// it between body chunks.  `stream` selects the request mode: when a
/// sender is present the driver issues a streaming request and forwards
/// every decoded SSE event; when absent it issues a one-shot request and
/// parses the complete body.
#[derive(Clone)]
pub struct CallContext {
    pub interrupt: Arc<AtomicBool>,
    pub stream: Option<mpsc::UnboundedSender<StreamEvent>>,
}

impl CallContext {
    pub fn new(interrupt: Arc<AtomicBool>) -> Self {
        Self {
            interrupt,
            stream: None,
        }
    }

    pub fn with_stream(mut self, tx: mpsc::UnboundedSender<StreamEvent>) -> Self {
        self.stream = Some(tx);
        self
    }
}

impl Default for CallContext {
    fn default() -> Self {
        Self::new(Arc::new(AtomicBool::new(false)))
    }
}

/// A model provider driver.  Exactly one is bound per session.
///
/// `call` never fails at the Rust level — every outcome, including
/// transport failures and interrupts, is carried inside [`ApiCallResult`]
/// so the retry policy and the agent loop can inspect status, duration,
/// and raw body uniformly.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Stable driver id for status display ("openai", "anthropic", "aws").
    fn name(&self) -> &str;

    async fn call(&self, req: &ProviderRequest, ctx: &CallContext) -> ApiCallResult;
}

impl ApiCallResult {
    pub(crate) fn from_error(err: crate::ApiError) -> Self {
        Self {
            error: Some(err),
            ..Default::default()
        }
    }
}
