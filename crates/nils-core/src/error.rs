// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use thiserror::Error;

use nils_model::{InvariantBreach, ModelError};
use nils_store::StoreError;

/// Which budget a task ran out of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetKind {
    Turns,
    WallClock,
    Cost,
}

impl std::fmt::Display for BudgetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BudgetKind::Turns => write!(f, "turns"),
            BudgetKind::WallClock => write!(f, "wall_clock"),
            BudgetKind::Cost => write!(f, "cost"),
        }
    }
}

/// Terminal failure of one task.  The session's message log remains valid
/// and saved for every variant; a failed task is always resumable.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("budget exhausted ({kind}) after {turns} turns")]
    BudgetExhausted { kind: BudgetKind, turns: u32 },
    /// Compression ran and the message list still exceeds the provider
    /// hard limit.
    #[error("context overflow: {tokens} tokens exceed the {limit}-token window")]
    ContextOverflow { tokens: usize, limit: usize },
    /// A §3 invariant failed while building a request.  Always a bug.
    #[error("invariant breach: {0}")]
    InvariantBreach(#[from] InvariantBreach),
    /// The model transport gave up after retries.
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("task cancelled")]
    Cancelled,
}
