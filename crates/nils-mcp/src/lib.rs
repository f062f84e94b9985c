// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Out-of-process MCP client.
//!
//! Each configured server is spawned as a child process speaking
//! line-delimited JSON-RPC 2.0 over stdin/stdout.  After the
//! initialize/initialized handshake the server's tools are discovered and
//! exposed to the model under `mcp_<server>_<tool>` names; stderr is
//! drained into a per-server log file for diagnosis.

mod config;
mod content;
mod manager;
mod server;

pub use config::{mcp_enabled, McpConfig, McpServerConfig, Transport};
pub use manager::{CatalogEntry, McpManager, TOOL_PREFIX};
pub use server::{McpServer, McpToolInfo, REQUEST_TIMEOUT};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum McpError {
    #[error("[{server}] failed to spawn '{command}': {message}")]
    Spawn {
        server: String,
        command: String,
        message: String,
    },

    #[error("[{server}] transport error: {message}")]
    Io { server: String, message: String },

    #[error("[{server}] timed out waiting for response to {method}")]
    Timeout { server: String, method: String },

    #[error("[{server}] protocol error: {message}")]
    Protocol { server: String, message: String },

    #[error("[{server}] unsupported transport: {message}")]
    Unsupported { server: String, message: String },

    #[error("no MCP server provides tool '{0}'")]
    UnknownTool(String),
}
