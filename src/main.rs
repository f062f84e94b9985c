// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::io::Write;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::Cli;
use nils_core::{Agent, AgentEvent, ConversationState, JsonlSink, NullSink, PersistenceSink};
use nils_mcp::{mcp_enabled, McpConfig, McpManager};
use nils_model::sse::{StreamEvent, StreamEventKind};
use nils_tools::{register_mcp_tools, ToolRegistry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = nils_config::load(cli.config.as_deref())?;
    if let Some(model) = &cli.model {
        if model == "mock" {
            config.model.provider = "mock".into();
        }
        config.model.name = model.clone();
    }

    let provider: Arc<dyn nils_model::Provider> =
        Arc::from(nils_model::from_config(&config.model).context("selecting model provider")?);

    // MCP servers contribute prefixed tools to the registry.
    let mcp = if mcp_enabled() {
        let mcp_config = McpConfig::load().context("loading MCP config")?;
        let manager = McpManager::start(&mcp_config).await;
        if !manager.is_empty() {
            tracing::info!(servers = ?manager.server_names(), "MCP servers ready");
        }
        Some(Arc::new(manager))
    } else {
        None
    };
    let mut registry = ToolRegistry::new();
    if let Some(manager) = &mcp {
        register_mcp_tools(&mut registry, manager);
    }

    let sink: Arc<dyn PersistenceSink> = match &config.agent.session_log {
        Some(path) => Arc::new(JsonlSink::create(path).context("opening session log")?),
        None => Arc::new(NullSink),
    };
    let state = ConversationState::new(
        config.model.name.clone(),
        std::env::current_dir().unwrap_or_default(),
        Arc::new(registry),
        sink,
    );

    // Ctrl-C funnels into the session interrupt flag; the loop and the
    // transport pick it up cooperatively.
    let interrupt = state.interrupt_flag();
    tokio::spawn(async move {
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            interrupt.store(true, Ordering::SeqCst);
        }
    });

    let mut agent = Agent::new(
        provider,
        state,
        config.agent.clone(),
        config.model.max_tokens,
    );

    let exit = if let Some(prompt) = &cli.prompt {
        run_one_turn(&mut agent, prompt).await
    } else {
        repl(&mut agent).await
    };

    if let Some(manager) = &mcp {
        manager.shutdown().await;
    }
    exit
}

async fn repl(agent: &mut Agent) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush().ok();
        let Some(line) = lines.next_line().await? else {
            return Ok(());
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" || line == "/exit" {
            return Ok(());
        }
        run_one_turn(agent, line).await?;
    }
}

async fn run_one_turn(agent: &mut Agent, input: &str) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::channel(256);
    let printer = tokio::spawn(async move {
        let mut streamed_this_round = false;
        while let Some(event) = rx.recv().await {
            match event {
                AgentEvent::Stream(ev) => {
                    if let Some(text) = delta_text(&ev) {
                        streamed_this_round = true;
                        print!("{text}");
                        std::io::stdout().flush().ok();
                    }
                }
                AgentEvent::AssistantMessage(msg) => {
                    // Non-streaming providers deliver the text only here.
                    if !streamed_this_round {
                        if let Some(text) = msg.text() {
                            print!("{text}");
                        }
                    }
                    streamed_this_round = false;
                }
                AgentEvent::ToolCallStarted { name, .. } => {
                    println!("\n[tool] {name} …");
                }
                AgentEvent::ToolCallFinished { name, result, .. } => {
                    if result.is_error {
                        println!("[tool] {name} failed: {}", result.output);
                    } else {
                        println!("[tool] {name} done");
                    }
                }
                AgentEvent::TokenUsage { session, .. } => {
                    tracing::debug!(
                        prompt = session.prompt,
                        completion = session.completion,
                        cache_read = session.cache_read,
                        "session usage"
                    );
                }
                AgentEvent::FatalError(message) => {
                    eprintln!("\nerror: {message}");
                }
                AgentEvent::Aborted => {
                    println!("\n[interrupted]");
                }
                AgentEvent::TurnComplete => {
                    println!();
                }
            }
        }
    });

    agent.run_turn(input, tx).await?;
    let _ = printer.await;
    Ok(())
}

/// Extract printable answer text from a raw stream event, for either
/// dialect.
fn delta_text(ev: &StreamEvent) -> Option<String> {
    match ev.kind {
        StreamEventKind::ContentBlockDelta => {
            let delta = &ev.data.as_ref()?["delta"];
            if delta["type"] == "text_delta" {
                delta["text"].as_str().map(String::from)
            } else {
                None
            }
        }
        StreamEventKind::OpenAiChunk => ev.data.as_ref()?["choices"][0]["delta"]["content"]
            .as_str()
            .map(String::from),
        _ => None,
    }
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}
