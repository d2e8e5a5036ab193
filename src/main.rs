// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::io::{Read, Write};

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};
use nils_core::{AgentEvent, Runtime, TaskError};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = nils_config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::ShowConfig => {
            println!("{}", serde_yaml::to_string(&config).unwrap_or_default());
            Ok(())
        }
        Commands::Sessions => {
            let runtime = Runtime::new(config)?;
            for id in runtime.store().list_sessions()? {
                println!("{id}");
            }
            Ok(())
        }
        Commands::Backups { session } => {
            let runtime = Runtime::new(config)?;
            for backup in runtime.store().list_backups(&session)? {
                println!(
                    "{}  {}  {} messages",
                    backup.id,
                    backup.created_at.format("%Y-%m-%d %H:%M:%S"),
                    backup.messages.len()
                );
            }
            Ok(())
        }
        Commands::Run { task } => {
            let runtime = Runtime::new(config)?;
            let agent = runtime.start_session();
            run_task(runtime, agent, task).await
        }
        Commands::Resume { session, task } => {
            let runtime = Runtime::new(config)?;
            let agent = runtime
                .resume_session(&session)
                .with_context(|| format!("resuming session {session}"))?;
            run_task(runtime, agent, task).await
        }
    }
}

async fn run_task(
    runtime: Runtime,
    mut agent: nils_core::Agent,
    task: Option<String>,
) -> anyhow::Result<()> {
    let task = match task {
        Some(t) => t,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("reading task from stdin")?;
            buf.trim().to_string()
        }
    };
    if task.is_empty() {
        anyhow::bail!("no task given (pass it as an argument or on stdin)");
    }

    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\ninterrupting...");
            ctrl_c_cancel.cancel();
        }
    });

    let (tx, mut rx) = tokio::sync::mpsc::channel(256);
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                AgentEvent::TextDelta(delta) => {
                    print!("{delta}");
                    let _ = std::io::stdout().flush();
                }
                AgentEvent::ToolCallStarted(tc) => {
                    eprintln!("[tool] {} {}", tc.name, tc.args);
                }
                AgentEvent::ToolCallFinished {
                    tool_name,
                    is_error: true,
                    output,
                    ..
                } => {
                    eprintln!("[tool] {tool_name} failed: {output}");
                }
                AgentEvent::ContextCompressed {
                    tokens_before,
                    tokens_after,
                    backup_id,
                    ..
                } => {
                    eprintln!(
                        "[context] compressed {tokens_before} -> {tokens_after} tokens (backup {backup_id})"
                    );
                }
                AgentEvent::Aborted { .. } => {
                    eprintln!("[cancelled]");
                }
                AgentEvent::Error(e) => {
                    eprintln!("[warning] {e}");
                }
                _ => {}
            }
        }
    });

    let session_id = agent.session().id.clone();
    let result = agent.process_task(&task, tx, cancel).await;
    let _ = printer.await;
    runtime.shutdown().await;

    match result {
        Ok(_) => {
            println!();
            eprintln!("[session] {session_id}");
            Ok(())
        }
        Err(TaskError::Cancelled) => {
            eprintln!("[session] {session_id} (resumable)");
            Ok(())
        }
        Err(e) => {
            eprintln!("[session] {session_id} (resumable)");
            Err(e.into())
        }
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "info" } else { "warn" };
    let filter = EnvFilter::try_from_env("NILS_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}
