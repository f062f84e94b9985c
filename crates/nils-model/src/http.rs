// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Shared HTTP execution for the provider drivers.
//!
//! Two entry points: [`execute`] collects the full response body,
//! [`execute_streaming`] decodes the body as SSE and hands each event to a
//! caller-supplied callback.  Both check the session interrupt flag between
//! body chunks and surface an observed interrupt as the distinct,
//! non-retryable [`ApiError::Interrupted`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;

use crate::sse::{SseDecoder, StreamEvent};
use crate::ApiError;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_TOTAL_TIMEOUT: Duration = Duration::from_secs(300);

/// A single outgoing request.  Drivers fill in URL, headers, and body;
/// timeouts default to the transport-wide values.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
    pub total_timeout: Duration,
}

impl HttpRequest {
    pub fn post(url: impl Into<String>, body: String) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
            body,
            total_timeout: DEFAULT_TOTAL_TIMEOUT,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// Status, headers, and (for the one-shot path) the collected body.
#[derive(Debug, Default)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
    pub headers: Vec<(String, String)>,
    pub duration_ms: u64,
}

/// Build the shared client used by all drivers.  Connections are not
/// shared across drivers; each provider owns its own client handle.
pub fn build_client() -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
        .build()
        .expect("default reqwest client construction cannot fail")
}

/// Execute a request and collect the complete body.
///
/// Non-2xx responses are returned as `Ok` with the status and body intact —
/// classification into the error taxonomy is the driver's job, since the
/// body shape is dialect-specific.
pub async fn execute(
    client: &reqwest::Client,
    req: HttpRequest,
    interrupt: &Arc<AtomicBool>,
) -> Result<HttpResponse, ApiError> {
    let started = Instant::now();
    if interrupt.load(Ordering::SeqCst) {
        return Err(ApiError::Interrupted);
    }

    let resp = send(client, &req).await?;
    let status = resp.status().as_u16();
    let headers = collect_headers(&resp);

    let mut body = String::new();
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        if interrupt.load(Ordering::SeqCst) {
            return Err(ApiError::Interrupted);
        }
        let bytes = chunk.map_err(classify_transport)?;
        body.push_str(&String::from_utf8_lossy(&bytes));
    }

    Ok(HttpResponse {
        status,
        body,
        headers,
        duration_ms: started.elapsed().as_millis() as u64,
    })
}

/// Execute a request in streaming mode, decoding the body as SSE.
///
/// Every decoded event is passed to `on_event` in wire order.  The returned
/// `HttpResponse` carries status and headers only.  A non-2xx response is
/// returned with its body collected so the driver can classify it.
pub async fn execute_streaming(
    client: &reqwest::Client,
    req: HttpRequest,
    interrupt: &Arc<AtomicBool>,
    on_event: &mut (dyn FnMut(StreamEvent) + Send),
) -> Result<HttpResponse, ApiError> {
    let started = Instant::now();
    if interrupt.load(Ordering::SeqCst) {
        return Err(ApiError::Interrupted);
    }

    let resp = send(client, &req).await?;
    let status = resp.status().as_u16();
    let headers = collect_headers(&resp);

    if !resp.status().is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Ok(HttpResponse {
            status,
            body,
            headers,
            duration_ms: started.elapsed().as_millis() as u64,
        });
    }

    let mut decoder = SseDecoder::new();
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        if interrupt.load(Ordering::SeqCst) {
            return Err(ApiError::Interrupted);
        }
        let bytes = chunk.map_err(classify_transport)?;
        for ev in decoder.feed(&bytes) {
            on_event(ev);
        }
    }

    Ok(HttpResponse {
        status,
        body: String::new(),
        headers,
        duration_ms: started.elapsed().as_millis() as u64,
    })
}

async fn send(
    client: &reqwest::Client,
    req: &HttpRequest,
) -> Result<reqwest::Response, ApiError> {
    let mut builder = client
        .post(&req.url)
        .timeout(req.total_timeout)
        .header("content-type", "application/json")
        .body(req.body.clone());
    for (name, value) in &req.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder.send().await.map_err(classify_transport)
}

fn collect_headers(resp: &reqwest::Response) -> Vec<(String, String)> {
    resp.headers()
        .iter()
        .map(|(k, v)| {
            (
                k.as_str().to_string(),
                v.to_str().unwrap_or_default().to_string(),
            )
        })
        .collect()
}

/// Map a reqwest failure onto the transport taxonomy.
///
/// Connect/timeout/body failures are transient; TLS handshakes, stream
/// resets, and torn connections are recognized by message since reqwest
/// does not expose them as predicates.  Anything else (request builder,
/// redirect policy) is a caller bug and not retryable.
fn classify_transport(e: reqwest::Error) -> ApiError {
    let retryable = e.is_connect()
        || e.is_timeout()
        || e.is_body()
        || e.is_decode()
        || transport_retryable_hint(&e.to_string());
    ApiError::Transport {
        message: e.to_string(),
        retryable,
    }
}

fn transport_retryable_hint(msg: &str) -> bool {
    let m = msg.to_ascii_lowercase();
    m.contains("tls")
        || m.contains("handshake")
        || m.contains("reset")
        || m.contains("broken pipe")
        || m.contains("connection closed")
        || m.contains("unexpected eof")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
