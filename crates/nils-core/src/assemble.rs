// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Prepares the exact message list for one model request.
//!
//! In order: compress when the log is over the trigger (backup first),
//! inject relevant memory after the system prefix, repair broken
//! tool-pairing, validate invariants, and reject anything still over the
//! provider hard limit.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use nils_config::AgentConfig;
use nils_model::{
    unanswered_call_ids, Message, ModelProvider, Role, ToolCallRequest, META_MEMORY_CONTEXT,
};
use nils_store::SessionStore;

use crate::{
    compress::{compress_log, SummaryKind},
    memory::MemoryIndex,
    session::Session,
    tokens::estimate_log,
    TaskError,
};

/// What the assembler did, for event reporting.
#[derive(Debug, Default)]
pub struct AssembleOutcome {
    /// The message list to send.
    pub request: Vec<Message>,
    /// Set when compression ran: (tokens_before, tokens_after, kind, backup id).
    pub compressed: Option<(usize, usize, SummaryKind, String)>,
    /// Set when a memory_context message was injected.
    pub memory_score: Option<f32>,
    /// Number of synthesized error replies added during repair.
    pub repairs: usize,
}

/// Build the request list for the next inference, mutating the session when
/// compression or repair changes the durable log.
pub async fn assemble(
    session: &mut Session,
    store: &SessionStore,
    basic_model: &Arc<dyn ModelProvider>,
    memory: &MemoryIndex,
    cfg: &AgentConfig,
    config_snapshot: &Value,
) -> Result<AssembleOutcome, TaskError> {
    let mut outcome = AssembleOutcome::default();

    // 1. Repair tool-pairing before anything else reads the log.  A broken
    //    pairing here means a previous task was interrupted mid-dispatch
    //    (crash, kill); the repair choice is recorded in metadata.
    outcome.repairs = repair_pairing(session);

    // 2. Compression trigger: token fraction or message count.
    let over_tokens = session.is_near_limit(cfg.compression_trigger);
    let over_count = session.messages.len() >= cfg.message_threshold;
    if over_tokens || over_count {
        let tokens_before = session.token_count;
        let backup = store.create_backup(&session.to_record(config_snapshot.clone()), "compression")?;
        if let Some((new_log, kind)) = compress_log(&session.messages, basic_model, cfg).await {
            session.replace_messages(new_log);
            store.save_session(&session.to_record(config_snapshot.clone()))?;
            info!(
                tokens_before,
                tokens_after = session.token_count,
                summary = %kind,
                backup_id = %backup.id,
                "context compressed"
            );
            outcome.compressed = Some((tokens_before, session.token_count, kind, backup.id));
        } else {
            debug!("compression trigger hit but nothing to compress");
        }
    }

    // 3. Validate; any surviving breach is a bug, fatal to the task.
    session.validate()?;

    // 4. Optional memory injection, after the system prefix, request-only;
    //    retrieval context never enters the durable log.
    let mut request = session.messages.clone();
    if let Some(query) = last_user_content(&request) {
        if let Some((doc, score)) = memory.search(&query, 1).into_iter().next() {
            if score >= cfg.memory_threshold {
                let sys_len = request.iter().take_while(|m| m.role == Role::System).count();
                let memory_msg = Message::system(format!(
                    "Relevant context from memory:\n{}",
                    doc.text
                ))
                .with_meta("type", META_MEMORY_CONTEXT);
                request.insert(sys_len, memory_msg);
                outcome.memory_score = Some(score);
            }
        }
    }

    // 5. Hard-limit gate: if the list still does not fit, the task fails
    //    with context_overflow rather than a provider 400.
    let tokens = estimate_log(&request);
    if session.max_tokens > 0 && tokens > session.max_tokens {
        return Err(TaskError::ContextOverflow {
            tokens,
            limit: session.max_tokens,
        });
    }

    outcome.request = request;
    Ok(outcome)
}

/// Fix tool-pairing violations left by an interrupted task.
///
/// A trailing assistant message whose calls are all unanswered and that
/// carries no text is dropped; otherwise each missing reply gets a
/// synthesized error tool message tagged `repair` in metadata.
fn repair_pairing(session: &mut Session) -> usize {
    let missing = unanswered_call_ids(&session.messages);
    if missing.is_empty() {
        return 0;
    }

    if let Some(last) = session.messages.last() {
        let all_on_last = missing
            .iter()
            .all(|id| last.tool_calls.iter().any(|tc| tc.id == *id));
        if last.role == Role::Assistant && last.content.is_empty() && all_on_last {
            warn!(
                call_ids = ?missing,
                "dropping orphaned assistant tool-call message from interrupted task"
            );
            session.messages.pop();
            session.recalculate_tokens();
            return 0;
        }
    }

    let mut repairs = 0;
    for id in missing {
        let name = call_name(&session.messages, &id).unwrap_or_default();
        warn!(call_id = %id, tool_name = %name, "synthesizing error reply for unanswered tool call");
        session.push(
            Message::tool_result(&id, "tool execution was interrupted before completing")
                .with_meta("repair", "synthesized_error_reply")
                .with_meta("error_kind", "execution_error")
                .with_meta("origin_tool", name),
        );
        repairs += 1;
    }
    repairs
}

fn call_name(messages: &[Message], id: &str) -> Option<String> {
    messages
        .iter()
        .flat_map(|m| m.tool_calls.iter())
        .find(|tc: &&ToolCallRequest| tc.id == id)
        .map(|tc| tc.name.clone())
}

fn last_user_content(messages: &[Message]) -> Option<String> {
    messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.clone())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
