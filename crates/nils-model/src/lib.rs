// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
pub mod http;
pub mod retry;
pub mod sse;
mod anthropic;
mod bedrock;
mod error;
mod mock;
mod openai;
mod provider;
mod types;

pub use anthropic::AnthropicProvider;
pub use bedrock::BedrockProvider;
pub use error::ApiError;
pub use mock::ScriptedProvider;
pub use openai::OpenAiProvider;
pub use provider::{CallContext, Provider};
pub use types::*;

use anyhow::bail;
use nils_config::ModelConfig;

/// Whether prompt-cache markers should be attached to outgoing requests.
/// On by default; `DISABLE_PROMPT_CACHING=1|true|TRUE` turns it off.
pub fn prompt_caching_enabled() -> bool {
    !matches!(
        std::env::var("DISABLE_PROMPT_CACHING").as_deref(),
        Ok("1") | Ok("true") | Ok("TRUE")
    )
}

/// Construct a boxed [`Provider`] from configuration and environment.
///
/// Bedrock is selected iff `CLAUDE_CODE_USE_BEDROCK=1`.  Otherwise the
/// explicit `model.provider` config wins, and when that is empty the
/// driver is inferred: an `sk-ant-` key or an Anthropic base URL selects
/// the Anthropic driver, anything else falls through to OpenAI.
pub fn from_config(cfg: &ModelConfig) -> anyhow::Result<Box<dyn Provider>> {
    if std::env::var("CLAUDE_CODE_USE_BEDROCK").as_deref() == Ok("1") {
        return Ok(Box::new(BedrockProvider::new(
            cfg.aws_region.clone(),
            cfg.base_url.clone(),
        )));
    }

    let provider = if cfg.provider.is_empty() {
        infer_provider(cfg)
    } else {
        cfg.provider.clone()
    };

    match provider.as_str() {
        "anthropic" => {
            let key = cfg
                .resolve_api_key()
                .ok_or_else(|| anyhow::anyhow!("no API key found; set ANTHROPIC_API_KEY"))?;
            Ok(Box::new(AnthropicProvider::new(key, cfg.base_url.clone())))
        }
        "openai" => {
            let key = cfg
                .resolve_api_key()
                .ok_or_else(|| anyhow::anyhow!("no API key found; set OPENAI_API_KEY"))?;
            Ok(Box::new(OpenAiProvider::new(key, cfg.base_url.clone())))
        }
        "aws" => Ok(Box::new(BedrockProvider::new(
            cfg.aws_region.clone(),
            cfg.base_url.clone(),
        ))),
        "mock" => Ok(Box::new(ScriptedProvider::new(vec![]))),
        other => bail!("unknown provider '{other}' (expected openai|anthropic|aws|mock)"),
    }
}

/// Infer the driver from the key kind and base URL when the config does
/// not name one.
fn infer_provider(cfg: &ModelConfig) -> String {
    if let Some(key) = cfg.resolve_api_key() {
        if key.starts_with("sk-ant-") {
            return "anthropic".into();
        }
    }
    let base = std::env::var("ANTHROPIC_API_URL")
        .ok()
        .or_else(|| cfg.base_url.clone())
        .unwrap_or_default();
    if base.contains("anthropic") {
        return "anthropic".into();
    }
    if std::env::var("ANTHROPIC_API_KEY").is_ok() && std::env::var("OPENAI_API_KEY").is_err() {
        return "anthropic".into();
    }
    "openai".into()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(provider: &str) -> ModelConfig {
        ModelConfig {
            provider: provider.into(),
            api_key: Some("sk-test".into()),
            ..Default::default()
        }
    }

    #[test]
    fn explicit_provider_names_are_honored() {
        assert_eq!(from_config(&cfg("anthropic")).unwrap().name(), "anthropic");
        assert_eq!(from_config(&cfg("openai")).unwrap().name(), "openai");
        assert_eq!(from_config(&cfg("mock")).unwrap().name(), "mock");
    }

    #[test]
    fn unknown_provider_is_rejected() {
        assert!(from_config(&cfg("palantir")).is_err());
    }

    #[test]
    fn anthropic_key_prefix_selects_anthropic() {
        let c = ModelConfig {
            api_key: Some("sk-ant-abc".into()),
            ..Default::default()
        };
        assert_eq!(infer_provider(&c), "anthropic");
    }

    #[test]
    fn anthropic_base_url_selects_anthropic() {
        let c = ModelConfig {
            api_key: Some("sk-other".into()),
            base_url: Some("https://gateway.anthropic.example/v1".into()),
            ..Default::default()
        };
        assert_eq!(infer_provider(&c), "anthropic");
    }

    #[test]
    fn plain_key_defaults_to_openai() {
        let c = ModelConfig {
            api_key: Some("sk-proj-123".into()),
            ..Default::default()
        };
        assert_eq!(infer_provider(&c), "openai");
    }
}
