// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Error taxonomy shared by the HTTP transport, the provider drivers, and
//! the retry policy.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
    /// Network, TLS, or unexpected EOF before a response was received.
    #[error("transport error: {message}")]
    Transport { message: String, retryable: bool },

    /// The server answered with a non-2xx status.
    #[error("provider returned HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// The model-specific token-limit error.  Non-retryable; UIs should
    /// advise starting a fresh session.
    #[error("context length exceeded: {0}")]
    ContextLengthExceeded(String),

    /// Authentication failure.  `refreshed = true` means credentials were
    /// reloaded and one immediate retry is warranted.
    #[error("authentication failed: {message}")]
    Auth { message: String, refreshed: bool },

    /// The wire response did not contain the expected shape.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// User-initiated cancellation; terminal for the turn.
    #[error("interrupted")]
    Interrupted,

    /// Initialization problem (missing API key, bad endpoint).
    #[error("configuration error: {0}")]
    Config(String),
}

impl ApiError {
    /// Whether the retry policy may re-attempt the call.
    ///
    /// HTTP statuses follow the transport contract: 429, 408, and all 5xx
    /// are transient.  An auth error that already refreshed credentials is
    /// retried once; everything else is terminal.
    pub fn retryable(&self) -> bool {
        match self {
            ApiError::Transport { retryable, .. } => *retryable,
            ApiError::Http { status, .. } => {
                *status == 429 || *status == 408 || *status >= 500
            }
            ApiError::Auth { refreshed, .. } => *refreshed,
            _ => false,
        }
    }

    /// Classify a non-2xx provider response body into the right variant.
    ///
    /// Context-length overflows are reported by providers in several
    /// shapes; we sniff the documented patterns so the UI can distinguish
    /// "start a new session" from a transient failure.
    pub fn from_http_response(status: u16, body: &str) -> ApiError {
        if is_context_length_error(body) {
            return ApiError::ContextLengthExceeded(trimmed_body(body));
        }
        if status == 401 || status == 403 {
            return ApiError::Auth {
                message: trimmed_body(body),
                refreshed: false,
            };
        }
        ApiError::Http {
            status,
            message: trimmed_body(body),
        }
    }
}

/// Match the known context-length error shapes across dialects.
pub(crate) fn is_context_length_error(body: &str) -> bool {
    if body.contains("maximum context length") || body.contains("too many tokens") {
        return true;
    }
    body.contains("invalid_request_error") && body.contains("tokens")
}

fn trimmed_body(body: &str) -> String {
    const MAX: usize = 512;
    let t = body.trim();
    if t.len() > MAX {
        let mut end = MAX;
        while !t.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &t[..end])
    } else {
        t.to_string()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
