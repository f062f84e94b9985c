// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use clap::Parser;
use std::path::PathBuf;

/// nils — a terminal AI agent that drives LLM APIs in a tool-calling loop.
///
/// Reads user turns from stdin (or a single prompt via `-p`), streams the
/// model's answer to stdout, and executes requested tools — including
/// tools provided by configured MCP servers — between model calls.
#[derive(Parser, Debug)]
#[command(name = "nils", version, about)]
pub struct Cli {
    /// Path to an explicit config file (merged over the discovered layers)
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Model override, e.g. "claude-sonnet-4-20250514" or "mock"
    #[arg(long, short = 'm')]
    pub model: Option<String>,

    /// Run a single prompt and exit instead of starting the REPL
    #[arg(long, short = 'p')]
    pub prompt: Option<String>,

    /// Increase log verbosity (-v: debug, -vv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}
