// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

fn default_max_retries() -> u32 {
    3
}

fn default_max_tool_rounds() -> u32 {
    50
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub agent: AgentConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Provider identifier: "openai" | "anthropic" | "aws" | "mock".
    /// Left empty, the provider is inferred from the API key kind and
    /// base URL at startup.
    #[serde(default)]
    pub provider: String,
    /// Model name forwarded to the provider API
    #[serde(default = "default_model_name")]
    pub name: String,
    /// Environment variable that holds the API key (read at runtime)
    pub api_key_env: Option<String>,
    /// Explicit API key; prefer api_key_env in config files to avoid secrets
    /// in version-controlled files
    pub api_key: Option<String>,
    /// Base URL override.  For hosted providers the correct default is
    /// auto-selected; `OPENAI_API_BASE` / `ANTHROPIC_API_URL` override this.
    pub base_url: Option<String>,
    /// Maximum tokens to request in a single completion
    pub max_tokens: Option<u32>,
    /// AWS region for the Bedrock driver (also honoured via AWS_REGION)
    pub aws_region: Option<String>,
}

fn default_model_name() -> String {
    "claude-sonnet-4-20250514".into()
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: String::new(),
            name: default_model_name(),
            api_key_env: None,
            api_key: None,
            base_url: None,
            max_tokens: None,
            aws_region: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Retry budget for transient provider errors
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Hard ceiling on model ↔ tool rounds within one user turn
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: u32,
    /// Session log file (JSONL, one message per line).  None disables
    /// persistence.
    pub session_log: Option<std::path::PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            max_tool_rounds: default_max_tool_rounds(),
            session_log: None,
        }
    }
}

impl ModelConfig {
    /// Resolve the API key: explicit value wins, then the configured env
    /// var, then the conventional env vars for the known providers.
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(k) = &self.api_key {
            return Some(k.clone());
        }
        if let Some(var) = &self.api_key_env {
            if let Ok(v) = std::env::var(var) {
                return Some(v);
            }
        }
        match self.provider.as_str() {
            "openai" => std::env::var("OPENAI_API_KEY").ok(),
            "anthropic" => std::env::var("ANTHROPIC_API_KEY").ok(),
            _ => std::env::var("ANTHROPIC_API_KEY")
                .or_else(|_| std::env::var("OPENAI_API_KEY"))
                .ok(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
