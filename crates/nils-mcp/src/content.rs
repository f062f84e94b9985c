// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Decoding of `tools/call` result content.
//!
//! Servers return `content` as an array of typed items: `text`, `image`
//! (base64 in `data`), or the legacy `blob` form.  Base64 payloads are
//! validated; an undecodable payload keeps the raw string and logs a
//! warning rather than failing the call.

use base64::Engine;
use serde_json::{json, Value};
use tracing::warn;

/// Decode a `tools/call` result into `(output, is_error)`.
///
/// A single text item collapses to a plain string; anything richer is
/// kept as an array of typed objects.
pub(crate) fn decode_call_result(server: &str, result: &Value) -> (Value, bool) {
    let is_error = result["isError"].as_bool().unwrap_or(false);
    let items = match result["content"].as_array() {
        Some(arr) => arr,
        None => return (Value::String(String::new()), is_error),
    };

    let mut decoded: Vec<Value> = Vec::with_capacity(items.len());
    for item in items {
        decoded.push(decode_item(server, item));
    }

    let output = match decoded.as_slice() {
        [] => Value::String(String::new()),
        [Value::Object(o)] if o.get("type") == Some(&json!("text")) => {
            o["text"].clone()
        }
        _ => Value::Array(decoded),
    };
    (output, is_error)
}

fn decode_item(server: &str, item: &Value) -> Value {
    match item["type"].as_str().unwrap_or_default() {
        "text" => json!({
            "type": "text",
            "text": item["text"].as_str().unwrap_or_default(),
        }),
        "image" => {
            let data = item["data"].as_str().unwrap_or_default();
            validate_base64(server, data);
            let mut out = json!({ "type": "image", "data": data });
            if let Some(mime) = item["mimeType"].as_str() {
                out["mime_type"] = json!(mime);
            }
            out
        }
        // Legacy servers use a "blob" item carrying base64 under either key.
        "blob" => {
            let data = item["blob"]
                .as_str()
                .or_else(|| item["data"].as_str())
                .unwrap_or_default();
            validate_base64(server, data);
            json!({ "type": "blob", "data": data })
        }
        _ => item.clone(),
    }
}

fn validate_base64(server: &str, data: &str) {
    if base64::engine::general_purpose::STANDARD.decode(data).is_err() {
        warn!(server, "content payload is not valid base64; keeping raw string");
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
