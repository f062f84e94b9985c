// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Retry policy wrapping every provider call.
//!
//! Transient failures (retryable transport errors, 429/408/5xx) back off
//! exponentially with jitter and re-attempt up to the configured budget.
//! An auth error with `refreshed = true` (the Bedrock credential-refresh
//! signal) earns one immediate retry that does not count against the
//! budget.  Interrupts and context-length overflows are terminal.

use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::provider::{CallContext, Provider};
use crate::{ApiCallResult, ApiError, ProviderRequest};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const BASE_DELAY_MS: u64 = 500;

/// Backoff before retry `attempt` (1-based): `base * 2^(attempt-1)`,
/// jittered ±25%.
fn backoff_delay(attempt: u32) -> Duration {
    let base = BASE_DELAY_MS.saturating_mul(1u64 << (attempt.saturating_sub(1)).min(16));
    let jitter = rand::thread_rng().gen_range(0.75..1.25);
    Duration::from_millis((base as f64 * jitter) as u64)
}

/// Call the provider, retrying transient errors up to `max_attempts`.
pub async fn call_with_retry(
    provider: &dyn Provider,
    req: &ProviderRequest,
    ctx: &CallContext,
    max_attempts: u32,
) -> ApiCallResult {
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1u32;
    let mut auth_retry_spent = false;

    loop {
        let result = provider.call(req, ctx).await;
        let err = match &result.error {
            None => return result,
            Some(e) => e,
        };

        match err {
            ApiError::Interrupted | ApiError::ContextLengthExceeded(_) => return result,
            ApiError::Auth {
                refreshed: true, ..
            } if !auth_retry_spent => {
                // Credentials were reloaded; retry once without burning an
                // attempt or waiting.
                auth_retry_spent = true;
                debug!(provider = provider.name(), "auth refreshed, retrying immediately");
                continue;
            }
            e if e.retryable() && attempt < max_attempts => {
                let delay = backoff_delay(attempt);
                warn!(
                    provider = provider.name(),
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient provider error, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            _ => return result,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
