// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! AWS Bedrock driver — Anthropic Messages body over the invoke endpoint,
//! authenticated with SigV4.
//!
//! The signing algorithm is implemented locally using `sha2` and `hex`
//! (already workspace dependencies) to avoid pulling in the AWS SDK.
//! Credentials come from the environment (`AWS_ACCESS_KEY_ID` /
//! `AWS_SECRET_ACCESS_KEY` / `AWS_SESSION_TOKEN`) with a fallback to the
//! `AWS_PROFILE` section of `~/.aws/credentials`.  A 401/403 or an
//! expired-token response reloads credentials once and signals the retry
//! policy via `Auth { refreshed: true }`.

use std::sync::RwLock;

use chrono::Utc;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::http::{self, HttpRequest};
use crate::provider::{CallContext, Provider};
use crate::sse::{StreamEvent, StreamEventKind};
use crate::{anthropic, ApiCallResult, ApiError, ProviderRequest};

#[derive(Debug, Clone)]
struct AwsCredentials {
    access_key: String,
    secret_key: String,
    session_token: Option<String>,
}

pub struct BedrockProvider {
    region: String,
    /// Full endpoint base; any configured URL is accepted verbatim.  The
    /// regional default is only a fallback.
    endpoint: String,
    credentials: RwLock<Option<AwsCredentials>>,
    client: reqwest::Client,
}

impl BedrockProvider {
    pub fn new(region: Option<String>, endpoint: Option<String>) -> Self {
        let region = region
            .or_else(|| std::env::var("AWS_REGION").ok())
            .or_else(|| std::env::var("AWS_DEFAULT_REGION").ok())
            .unwrap_or_else(|| "us-east-1".into());
        let endpoint = endpoint
            .unwrap_or_else(|| format!("https://bedrock-runtime.{region}.amazonaws.com"));
        Self {
            region,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            credentials: RwLock::new(None),
            client: http::build_client(),
        }
    }

    fn current_credentials(&self) -> Result<AwsCredentials, ApiError> {
        if let Some(c) = self.credentials.read().expect("credentials lock").clone() {
            return Ok(c);
        }
        let loaded = load_credentials()?;
        *self.credentials.write().expect("credentials lock") = Some(loaded.clone());
        Ok(loaded)
    }

    /// Drop the cached credentials and reload from the chain.
    fn refresh_credentials(&self) -> Result<(), ApiError> {
        let loaded = load_credentials()?;
        *self.credentials.write().expect("credentials lock") = Some(loaded);
        Ok(())
    }
}

#[async_trait::async_trait]
impl Provider for BedrockProvider {
    fn name(&self) -> &str {
        "aws"
    }

    async fn call(&self, req: &ProviderRequest, ctx: &CallContext) -> ApiCallResult {
        let creds = match self.current_credentials() {
            Ok(c) => c,
            Err(e) => return ApiCallResult::from_error(e),
        };

        // Same Messages body as the Anthropic driver; Bedrock carries the
        // model in the URL and the dialect version in the body.
        let mut body = anthropic::build_request_body(req);
        if let Some(map) = body.as_object_mut() {
            map.remove("model");
            map.insert("anthropic_version".into(), json!("bedrock-2023-05-31"));
        }
        let body_bytes = body.to_string();

        let path = format!("/model/{}/invoke", urlencoded(&req.model));
        let url = format!("{}{}", self.endpoint, path);
        let host = host_of(&self.endpoint);

        debug!(model = %req.model, region = %self.region, %url, "sending bedrock request");

        let now = Utc::now();
        let date_time = now.format("%Y%m%dT%H%M%SZ").to_string();
        let signed = sign_request(
            &creds,
            &self.region,
            &host,
            &path,
            &date_time,
            body_bytes.as_bytes(),
        );

        let mut http_req = HttpRequest::post(url, body_bytes)
            .header("host", &host)
            .header("x-amz-date", &date_time)
            .header("Authorization", &signed);
        if let Some(token) = &creds.session_token {
            http_req = http_req.header("x-amz-security-token", token);
        }

        let resp = match http::execute(&self.client, http_req, &ctx.interrupt).await {
            Ok(r) => r,
            Err(e) => return ApiCallResult::from_error(e),
        };

        if resp.status < 200 || resp.status >= 300 {
            if is_expired_auth(resp.status, &resp.body) {
                warn!(status = resp.status, "bedrock auth rejected; refreshing credentials");
                let refreshed = self.refresh_credentials().is_ok();
                return ApiCallResult {
                    http_status: resp.status,
                    duration_ms: resp.duration_ms,
                    error: Some(ApiError::Auth {
                        message: resp.body.clone(),
                        refreshed,
                    }),
                    raw_body: resp.body,
                    ..Default::default()
                };
            }
            return ApiCallResult {
                http_status: resp.status,
                duration_ms: resp.duration_ms,
                error: Some(ApiError::from_http_response(resp.status, &resp.body)),
                raw_body: resp.body,
                ..Default::default()
            };
        }

        match serde_json::from_str::<Value>(&resp.body)
            .map_err(|e| ApiError::InvalidResponse(format!("response is not JSON: {e}")))
            .and_then(|v| anthropic::parse_response_body(&v))
        {
            Ok(canonical) => {
                // The invoke endpoint is not streamed; synthesize events so
                // a registered stream callback still sees the turn.
                if let Some(tx) = &ctx.stream {
                    for ev in synthesize_events(&canonical) {
                        let _ = tx.send(ev);
                    }
                }
                ApiCallResult {
                    response: Some(canonical),
                    raw_body: resp.body,
                    http_status: resp.status,
                    duration_ms: resp.duration_ms,
                    error: None,
                }
            }
            Err(e) => ApiCallResult {
                raw_body: resp.body,
                http_status: resp.status,
                duration_ms: resp.duration_ms,
                error: Some(e),
                ..Default::default()
            },
        }
    }
}

fn is_expired_auth(status: u16, body: &str) -> bool {
    if status == 401 || status == 403 {
        return true;
    }
    body.contains("ExpiredToken") || body.contains("expired-token") || body.contains("expired token")
}

fn synthesize_events(resp: &crate::CanonicalResponse) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    if let Some(text) = &resp.text {
        let data = json!({"index": 0, "delta": {"type": "text_delta", "text": text}});
        events.push(StreamEvent {
            kind: StreamEventKind::ContentBlockDelta,
            event: "content_block_delta".into(),
            raw: data.to_string(),
            data: Some(data),
        });
    }
    let stop = json!({});
    events.push(StreamEvent {
        kind: StreamEventKind::MessageStop,
        event: "message_stop".into(),
        raw: stop.to_string(),
        data: Some(stop),
    });
    events
}

// ─── Credential chain ─────────────────────────────────────────────────────────

fn load_credentials() -> Result<AwsCredentials, ApiError> {
    if let (Ok(access_key), Ok(secret_key)) = (
        std::env::var("AWS_ACCESS_KEY_ID"),
        std::env::var("AWS_SECRET_ACCESS_KEY"),
    ) {
        return Ok(AwsCredentials {
            access_key,
            secret_key,
            session_token: std::env::var("AWS_SESSION_TOKEN").ok(),
        });
    }
    let profile = std::env::var("AWS_PROFILE").unwrap_or_else(|_| "default".into());
    let path = dirs::home_dir()
        .map(|h| h.join(".aws/credentials"))
        .ok_or_else(|| ApiError::Config("no home directory for AWS credentials".into()))?;
    let text = std::fs::read_to_string(&path).map_err(|e| {
        ApiError::Config(format!(
            "AWS credentials not set and {} unreadable: {e}",
            path.display()
        ))
    })?;
    parse_credentials_file(&text, &profile)
        .ok_or_else(|| ApiError::Config(format!("profile [{profile}] not found in credentials file")))
}

/// Minimal INI scan of `~/.aws/credentials` for one profile section.
fn parse_credentials_file(text: &str, profile: &str) -> Option<AwsCredentials> {
    let mut in_section = false;
    let mut access_key = None;
    let mut secret_key = None;
    let mut session_token = None;
    for line in text.lines() {
        let line = line.trim();
        if line.starts_with('[') && line.ends_with(']') {
            in_section = line[1..line.len() - 1].trim() == profile;
            continue;
        }
        if !in_section || line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            let (k, v) = (k.trim(), v.trim().to_string());
            match k {
                "aws_access_key_id" => access_key = Some(v),
                "aws_secret_access_key" => secret_key = Some(v),
                "aws_session_token" => session_token = Some(v),
                _ => {}
            }
        }
    }
    Some(AwsCredentials {
        access_key: access_key?,
        secret_key: secret_key?,
        session_token,
    })
}

// ─── SigV4 ────────────────────────────────────────────────────────────────────

fn sign_request(
    creds: &AwsCredentials,
    region: &str,
    host: &str,
    path: &str,
    date_time: &str,
    body: &[u8],
) -> String {
    let date = &date_time[..8];
    let service = "bedrock";

    let headers_to_sign: Vec<(&str, &str)> = {
        let mut h = vec![
            ("content-type", "application/json"),
            ("host", host),
            ("x-amz-date", date_time),
        ];
        if let Some(token) = &creds.session_token {
            h.push(("x-amz-security-token", token.as_str()));
        }
        h.sort_by_key(|&(k, _)| k);
        h
    };

    let canonical_headers: String = headers_to_sign
        .iter()
        .map(|(k, v)| format!("{}:{}\n", k, v.trim()))
        .collect();
    let signed_headers: String = headers_to_sign
        .iter()
        .map(|(k, _)| *k)
        .collect::<Vec<_>>()
        .join(";");
    let body_hash = hex_sha256(body);

    let canonical_request = format!(
        "POST\n{}\n\n{}\n{}\n{}",
        path, canonical_headers, signed_headers, body_hash
    );

    let credential_scope = format!("{}/{}/{}/aws4_request", date, region, service);
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        date_time,
        credential_scope,
        hex_sha256(canonical_request.as_bytes())
    );

    let signing_key = derive_signing_key(creds.secret_key.as_bytes(), date, region, service);
    let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()));

    format!(
        "AWS4-HMAC-SHA256 Credential={}/{},SignedHeaders={},Signature={}",
        creds.access_key, credential_scope, signed_headers, signature
    )
}

fn sha256(data: &[u8]) -> Vec<u8> {
    let mut h = Sha256::new();
    h.update(data);
    h.finalize().to_vec()
}

fn hex_sha256(data: &[u8]) -> String {
    hex::encode(sha256(data))
}

/// HMAC-SHA256 computed without the `hmac` crate using the raw SHA256 primitive.
fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    const BLOCK: usize = 64;
    let norm_key = if key.len() > BLOCK {
        sha256(key)
    } else {
        key.to_vec()
    };
    let mut padded = [0u8; BLOCK];
    padded[..norm_key.len()].copy_from_slice(&norm_key);
    let ipad: Vec<u8> = padded.iter().map(|&b| b ^ 0x36).collect();
    let opad: Vec<u8> = padded.iter().map(|&b| b ^ 0x5c).collect();
    let inner = {
        let mut h = Sha256::new();
        h.update(&ipad);
        h.update(data);
        h.finalize().to_vec()
    };
    let mut h = Sha256::new();
    h.update(&opad);
    h.update(&inner);
    h.finalize().to_vec()
}

fn derive_signing_key(secret: &[u8], date: &str, region: &str, service: &str) -> Vec<u8> {
    let k_secret = [b"AWS4", secret].concat();
    let k_date = hmac_sha256(&k_secret, date.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// Percent-encode everything outside the unreserved set; `/` is kept so
/// model ids keep their path shape while `:` (inference profiles) is
/// encoded.
fn urlencoded(s: &str) -> String {
    let mut out = String::with_capacity(s.len() * 2);
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                out.push(b as char)
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

fn host_of(endpoint: &str) -> String {
    let rest = endpoint
        .strip_prefix("https://")
        .or_else(|| endpoint.strip_prefix("http://"))
        .unwrap_or(endpoint);
    rest.split('/').next().unwrap_or(rest).to_string()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hmac_sha256_known_vector() {
        // RFC 4231-style known-answer check
        let key = b"key";
        let data = b"The quick brown fox jumps over the lazy dog";
        assert_eq!(
            hex::encode(hmac_sha256(key, data)),
            "f7bc83f430538424b13298e6aa6fb143ef4d59a14946175997479dbc2d1a3cd8"
        );
    }

    #[test]
    fn derive_signing_key_is_deterministic() {
        let k1 = derive_signing_key(b"secret", "20240101", "us-east-1", "bedrock");
        let k2 = derive_signing_key(b"secret", "20240101", "us-east-1", "bedrock");
        assert_eq!(k1, k2);
    }

    #[test]
    fn urlencoded_safe_chars_unchanged() {
        assert_eq!(
            urlencoded("us.anthropic.claude-3-5/v2"),
            "us.anthropic.claude-3-5/v2"
        );
    }

    #[test]
    fn urlencoded_colon_encoded() {
        assert_eq!(urlencoded("model:0"), "model%3A0");
    }

    #[test]
    fn host_extraction_handles_paths() {
        assert_eq!(
            host_of("https://bedrock-runtime.eu-west-1.amazonaws.com"),
            "bedrock-runtime.eu-west-1.amazonaws.com"
        );
        assert_eq!(host_of("https://proxy.local:8443/bedrock"), "proxy.local:8443");
    }

    #[test]
    fn custom_endpoint_is_accepted_verbatim() {
        let p = BedrockProvider::new(
            Some("eu-west-1".into()),
            Some("https://bedrock.internal.example/".into()),
        );
        assert_eq!(p.endpoint, "https://bedrock.internal.example");
        assert_eq!(p.name(), "aws");
    }

    #[test]
    fn signature_covers_session_token_when_present() {
        let with_token = AwsCredentials {
            access_key: "AKID".into(),
            secret_key: "secret".into(),
            session_token: Some("tok".into()),
        };
        let without = AwsCredentials {
            session_token: None,
            ..with_token.clone()
        };
        let a = sign_request(&with_token, "us-east-1", "h", "/model/m/invoke", "20240101T000000Z", b"{}");
        let b = sign_request(&without, "us-east-1", "h", "/model/m/invoke", "20240101T000000Z", b"{}");
        assert!(a.contains("x-amz-security-token"));
        assert!(!b.contains("x-amz-security-token"));
        assert_ne!(a, b);
    }

    #[test]
    fn credentials_file_profile_is_parsed() {
        let text = "\
[default]
aws_access_key_id = AKIDDEFAULT
aws_secret_access_key = sdefault

[work]
aws_access_key_id = AKIDWORK
aws_secret_access_key = swork
aws_session_token = tok
";
        let c = parse_credentials_file(text, "work").unwrap();
        assert_eq!(c.access_key, "AKIDWORK");
        assert_eq!(c.session_token.as_deref(), Some("tok"));
        let d = parse_credentials_file(text, "default").unwrap();
        assert_eq!(d.access_key, "AKIDDEFAULT");
        assert!(d.session_token.is_none());
    }

    #[test]
    fn missing_profile_yields_none() {
        assert!(parse_credentials_file("[default]\naws_access_key_id = a\n", "other").is_none());
    }

    #[test]
    fn expired_token_bodies_are_detected() {
        assert!(is_expired_auth(403, ""));
        assert!(is_expired_auth(401, ""));
        assert!(is_expired_auth(400, r#"{"__type":"ExpiredTokenException"}"#));
        assert!(!is_expired_auth(400, r#"{"message":"validation error"}"#));
    }

    #[test]
    fn synthesized_events_carry_text_then_stop() {
        let resp = crate::CanonicalResponse {
            text: Some("hello".into()),
            ..Default::default()
        };
        let evs = synthesize_events(&resp);
        assert_eq!(evs.len(), 2);
        assert_eq!(evs[0].kind, StreamEventKind::ContentBlockDelta);
        assert_eq!(evs[1].kind, StreamEventKind::MessageStop);
    }
}
