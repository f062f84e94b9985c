// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! MCP-backed tool adapter.
//!
//! Each tool discovered by the MCP manager is registered under its
//! prefixed name (`mcp_<server>_<tool>`).  Execution routes through the
//! manager; a dead or misbehaving server surfaces as an error result that
//! the model can react to, never as a loop failure.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use nils_mcp::McpManager;

use crate::{Tool, ToolCall, ToolOutput, ToolRegistry};

pub struct McpTool {
    manager: Arc<McpManager>,
    name: String,
    description: String,
    schema: Value,
}

#[async_trait]
impl Tool for McpTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        self.schema.clone()
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        match self.manager.call(&self.name, call.args.clone()).await {
            Ok((output, false)) => ToolOutput::ok(&call.id, output),
            Ok((output, true)) => ToolOutput {
                call_id: call.id.clone(),
                output,
                is_error: true,
            },
            Err(e) => {
                warn!(tool = %self.name, error = %e, "MCP tool call failed");
                ToolOutput::err(&call.id, e.to_string())
            }
        }
    }
}

/// Register every tool from the manager's catalog.
pub fn register_mcp_tools(registry: &mut ToolRegistry, manager: &Arc<McpManager>) {
    for entry in manager.catalog() {
        registry.register(McpTool {
            manager: Arc::clone(manager),
            name: entry.name,
            description: entry.description,
            schema: entry.schema,
        });
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use nils_mcp::McpConfig;
    use serde_json::json;

    #[tokio::test]
    async fn dead_server_surfaces_as_error_result() {
        // A manager with no connected servers stands in for one whose
        // server died: routing fails, and the tool must produce an error
        // output rather than panic.
        let manager = Arc::new(McpManager::start(&McpConfig::default()).await);
        let tool = McpTool {
            manager,
            name: "mcp_foo_bar".into(),
            description: String::new(),
            schema: json!({"type": "object"}),
        };
        let out = tool
            .execute(&ToolCall {
                id: "c1".into(),
                name: "mcp_foo_bar".into(),
                args: json!({}),
            })
            .await;
        assert!(out.is_error);
        assert!(out.output["error"]
            .as_str()
            .unwrap()
            .contains("mcp_foo_bar"));
    }

    #[tokio::test]
    async fn empty_manager_registers_no_tools() {
        let manager = Arc::new(McpManager::start(&McpConfig::default()).await);
        let mut reg = ToolRegistry::new();
        register_mcp_tools(&mut reg, &manager);
        assert!(reg.names().is_empty());
    }
}
