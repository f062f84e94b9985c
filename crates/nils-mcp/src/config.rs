// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// How the client talks to a server.  Servers configured with a `url`
/// use the SSE transport; everything else is a spawned stdio child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Stdio,
    Sse,
}

/// One entry under `mcpServers` in the config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpServerConfig {
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// SSE endpoint; presence selects the SSE transport.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl McpServerConfig {
    pub fn transport(&self) -> Transport {
        if self.url.is_some() {
            Transport::Sse
        } else {
            Transport::Stdio
        }
    }
}

/// The MCP configuration file: `{ "mcpServers": { "<name>": { … } } }`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpConfig {
    #[serde(rename = "mcpServers", default)]
    pub servers: HashMap<String, McpServerConfig>,
}

/// MCP support is on unless `CLAUDE_MCP_ENABLED` says otherwise.
pub fn mcp_enabled() -> bool {
    !matches!(
        std::env::var("CLAUDE_MCP_ENABLED").as_deref(),
        Ok("0") | Ok("false") | Ok("off")
    )
}

fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".config/claude-c/mcp_servers.json"))
}

/// Resolve the config file location: `CLAUDE_MCP_CONFIG` wins, then the
/// default path.  A missing file yields an empty config, not an error.
pub fn config_path() -> Option<PathBuf> {
    std::env::var("CLAUDE_MCP_CONFIG")
        .ok()
        .map(PathBuf::from)
        .or_else(default_config_path)
}

impl McpConfig {
    pub fn load() -> anyhow::Result<Self> {
        match config_path() {
            Some(p) if p.is_file() => Self::load_from(&p),
            _ => Ok(Self::default()),
        }
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn config_file_format_is_parsed() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(
            f,
            r#"{{
                "mcpServers": {{
                    "files": {{
                        "command": "mcp-files",
                        "args": ["--root", "/tmp"],
                        "env": {{ "LOG": "1" }}
                    }}
                }}
            }}"#
        )
        .unwrap();
        let cfg = McpConfig::load_from(f.path()).unwrap();
        let s = &cfg.servers["files"];
        assert_eq!(s.command, "mcp-files");
        assert_eq!(s.args, vec!["--root", "/tmp"]);
        assert_eq!(s.env["LOG"], "1");
        assert_eq!(s.transport(), Transport::Stdio);
    }

    #[test]
    fn url_entry_selects_sse_transport() {
        let s: McpServerConfig =
            serde_json::from_str(r#"{ "url": "https://mcp.example/sse" }"#).unwrap();
        assert_eq!(s.transport(), Transport::Sse);
    }

    #[test]
    fn missing_server_table_defaults_to_empty() {
        let cfg: McpConfig = serde_json::from_str("{}").unwrap();
        assert!(cfg.servers.is_empty());
    }

    #[test]
    fn malformed_json_is_an_error() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, "{{not json").unwrap();
        assert!(McpConfig::load_from(f.path()).is_err());
    }
}
