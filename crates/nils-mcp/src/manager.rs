// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Aggregates all connected MCP servers into one tool surface.
//!
//! Tool names are exposed to the model as `mcp_<server>_<tool>` so the
//! dispatcher can route unambiguously.  Requests are serialized per
//! server (one outstanding request per child process); different servers
//! run their calls independently.

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::McpConfig;
use crate::server::{McpServer, McpToolInfo};
use crate::McpError;

pub const TOOL_PREFIX: &str = "mcp_";

/// A model-facing tool definition aggregated from a server catalog.
#[derive(Debug, Clone)]
pub struct CatalogEntry {
    /// Prefixed model-facing name (`mcp_<server>_<tool>`).
    pub name: String,
    pub description: String,
    pub schema: Value,
}

pub struct McpManager {
    servers: HashMap<String, Mutex<McpServer>>,
    /// Snapshot of each connected server's discovered tools.
    catalogs: HashMap<String, Vec<McpToolInfo>>,
}

impl McpManager {
    /// Connect every configured server.  A server that fails to spawn or
    /// handshake is logged and omitted; its tools never reach the model.
    pub async fn start(config: &McpConfig) -> Self {
        let mut servers = HashMap::new();
        let mut catalogs = HashMap::new();
        for (name, cfg) in &config.servers {
            match McpServer::connect(name, cfg).await {
                Ok(server) => {
                    catalogs.insert(name.clone(), server.tools().to_vec());
                    servers.insert(name.clone(), Mutex::new(server));
                }
                Err(e) => {
                    warn!(server = %name, error = %e, "MCP server unavailable; omitting its tools");
                }
            }
        }
        if !servers.is_empty() {
            info!(count = servers.len(), "MCP servers connected");
        }
        Self { servers, catalogs }
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn server_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.catalogs.keys().cloned().collect();
        names.sort();
        names
    }

    /// The combined, prefixed tool catalog across all connected servers.
    pub fn catalog(&self) -> Vec<CatalogEntry> {
        let mut entries: Vec<CatalogEntry> = self
            .catalogs
            .iter()
            .flat_map(|(server, tools)| {
                tools.iter().map(move |t| CatalogEntry {
                    name: format!("{TOOL_PREFIX}{server}_{}", t.name),
                    description: t.description.clone(),
                    schema: t.schema.clone(),
                })
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }

    /// Split a prefixed tool name into `(server, tool)`.  Server names may
    /// themselves contain underscores, so the longest known server name
    /// wins.
    pub fn route<'a>(&self, prefixed: &'a str) -> Option<(String, &'a str)> {
        let rest = prefixed.strip_prefix(TOOL_PREFIX)?;
        let mut best: Option<(&String, &'a str)> = None;
        for server in self.catalogs.keys() {
            if let Some(tool) = rest
                .strip_prefix(server.as_str())
                .and_then(|t| t.strip_prefix('_'))
            {
                if best.map(|(s, _)| server.len() > s.len()).unwrap_or(true) {
                    best = Some((server, tool));
                }
            }
        }
        best.map(|(s, t)| (s.clone(), t))
    }

    /// Invoke a prefixed tool; returns `(output, is_error)`.
    pub async fn call(&self, prefixed: &str, args: Value) -> Result<(Value, bool), McpError> {
        let (server_name, tool) = self
            .route(prefixed)
            .ok_or_else(|| McpError::UnknownTool(prefixed.to_string()))?;
        let server = self
            .servers
            .get(&server_name)
            .ok_or_else(|| McpError::UnknownTool(prefixed.to_string()))?;
        server.lock().await.call_tool(tool, args).await
    }

    pub async fn list_resources(&self, server: &str) -> Result<Vec<Value>, McpError> {
        match self.servers.get(server) {
            Some(s) => s.lock().await.list_resources().await,
            None => Err(McpError::UnknownTool(server.to_string())),
        }
    }

    pub async fn read_resource(&self, server: &str, uri: &str) -> Result<Value, McpError> {
        match self.servers.get(server) {
            Some(s) => s.lock().await.read_resource(uri).await,
            None => Err(McpError::UnknownTool(server.to_string())),
        }
    }

    /// Stop every child process.  Safe to call once at session end;
    /// `kill_on_drop` covers anything missed.
    pub async fn shutdown(&self) {
        for server in self.servers.values() {
            server.lock().await.shutdown().await;
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
