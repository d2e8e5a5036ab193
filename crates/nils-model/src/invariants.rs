// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Structural invariants of the conversation log.
//!
//! These must hold after every mutation of a session's message list:
//!
//! 1. Every id in any assistant `tool_calls` has exactly one matching tool
//!    message, and that message appears after the assistant message.
//! 2. Every tool message's `tool_call_id` matches some preceding assistant
//!    tool call.
//! 3. System messages form a contiguous prefix, except for system messages
//!    tagged as compression or memory artifacts.
//! 4. Timestamps are non-decreasing.
//!
//! A breach is always a bug in the runtime, never an expected condition.

use std::collections::{HashMap, HashSet};

use thiserror::Error;

use crate::{Message, Role};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvariantBreach {
    #[error("tool call {id} (message {index}) has no matching tool reply")]
    UnansweredToolCall { index: usize, id: String },
    #[error("tool call {id} answered more than once")]
    DuplicateToolReply { id: String },
    #[error("tool message {index} references unknown call id {id}")]
    OrphanToolReply { index: usize, id: String },
    #[error("tool message {index} answers call {id} before it was issued")]
    ReplyBeforeCall { index: usize, id: String },
    #[error("tool message {index} carries no tool_call_id")]
    MissingToolCallId { index: usize },
    #[error("untagged system message at {index} after conversation start")]
    SystemAfterConversation { index: usize },
    #[error("timestamp at message {index} regresses")]
    TimestampRegression { index: usize },
}

/// Validate the full set of log invariants; returns the first breach found.
pub fn validate(messages: &[Message]) -> Result<(), InvariantBreach> {
    // Pass 1: call-site positions and reply pairing.
    let mut call_pos: HashMap<&str, usize> = HashMap::new();
    let mut answered: HashSet<&str> = HashSet::new();

    for (i, m) in messages.iter().enumerate() {
        for tc in &m.tool_calls {
            call_pos.insert(tc.id.as_str(), i);
        }
        if m.role == Role::Tool {
            let id = match m.tool_call_id.as_deref() {
                Some(id) => id,
                None => return Err(InvariantBreach::MissingToolCallId { index: i }),
            };
            match call_pos.get(id) {
                None => {
                    // Either the call never existed or it appears later.
                    let appears_later = messages[i + 1..]
                        .iter()
                        .any(|later| later.tool_calls.iter().any(|tc| tc.id == id));
                    return Err(if appears_later {
                        InvariantBreach::ReplyBeforeCall { index: i, id: id.into() }
                    } else {
                        InvariantBreach::OrphanToolReply { index: i, id: id.into() }
                    });
                }
                Some(_) => {
                    if !answered.insert(id) {
                        return Err(InvariantBreach::DuplicateToolReply { id: id.into() });
                    }
                }
            }
        }
    }

    for (i, m) in messages.iter().enumerate() {
        for tc in &m.tool_calls {
            if !answered.contains(tc.id.as_str()) {
                return Err(InvariantBreach::UnansweredToolCall {
                    index: i,
                    id: tc.id.clone(),
                });
            }
        }
    }

    // Pass 2: system prefix contiguity and timestamp ordering.
    let mut seen_non_system = false;
    let mut last_ts = None;
    for (i, m) in messages.iter().enumerate() {
        match m.role {
            Role::System => {
                if seen_non_system && !m.is_tagged_system() {
                    return Err(InvariantBreach::SystemAfterConversation { index: i });
                }
            }
            _ => seen_non_system = true,
        }
        if let Some(prev) = last_ts {
            if m.timestamp < prev {
                return Err(InvariantBreach::TimestampRegression { index: i });
            }
        }
        last_ts = Some(m.timestamp);
    }

    Ok(())
}

/// Ids of tool calls in `messages` that have no tool reply yet.
///
/// Used by the context assembler to decide whether a slice can be sent
/// as-is or needs repair (synthesized error reply / dropped orphan).
pub fn unanswered_call_ids(messages: &[Message]) -> Vec<String> {
    let answered: HashSet<&str> = messages
        .iter()
        .filter(|m| m.role == Role::Tool)
        .filter_map(|m| m.tool_call_id.as_deref())
        .collect();
    messages
        .iter()
        .flat_map(|m| m.tool_calls.iter())
        .filter(|tc| !answered.contains(tc.id.as_str()))
        .map(|tc| tc.id.clone())
        .collect()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
