// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "nils",
    about = "An agentic coding assistant runtime",
    version
)]
pub struct Cli {
    /// Explicit config file (merged over the standard search paths)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log to stderr (level from NILS_LOG / RUST_LOG, default info)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start a new session and run one task
    Run {
        /// The task text; reads stdin when omitted
        task: Option<String>,
    },
    /// Resume a stored session and run another task in it
    Resume {
        /// Session id (see `nils sessions`)
        session: String,
        /// The task text; reads stdin when omitted
        task: Option<String>,
    },
    /// List stored sessions, newest first
    Sessions,
    /// List compression backups for a session
    Backups {
        /// Session id
        session: String,
    },
    /// Print the effective configuration after merging and env overrides
    ShowConfig,
}
