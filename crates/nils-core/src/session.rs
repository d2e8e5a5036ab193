// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use nils_model::{InvariantBreach, Message};
use nils_store::SessionRecord;

use crate::tokens::{estimate_log, estimate_message};

/// In-memory conversation session.
///
/// The loop controller is the only writer; every other component reads a
/// snapshot or goes through the controller.  Token accounting is kept
/// incrementally on push and recomputed after wholesale replacement.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub working_dir: PathBuf,
    pub messages: Vec<Message>,
    /// Free-form context string persisted with the session.
    pub context: String,
    /// Provider-side prefix-cache handle, when one is live.
    pub cache_handle: Option<String>,
    /// Approximate total token count for the current message list
    pub token_count: usize,
    /// Maximum context tokens (from the active model's window)
    pub max_tokens: usize,
}

impl Session {
    pub fn new(max_tokens: usize) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            working_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            messages: Vec::new(),
            context: String::new(),
            cache_handle: None,
            token_count: 0,
            max_tokens,
        }
    }

    /// Rebuild a session from its durable record (resume path).
    pub fn from_record(record: SessionRecord, max_tokens: usize) -> Self {
        let mut s = Self {
            id: record.id,
            created_at: record.created_at,
            working_dir: record.working_dir,
            messages: record.messages,
            context: record.context,
            cache_handle: record.cache_handle,
            token_count: 0,
            max_tokens,
        };
        s.recalculate_tokens();
        s
    }

    /// Snapshot for persistence.  `config` is the config snapshot stored
    /// alongside so resume replays with identical budgets.
    pub fn to_record(&self, config: Value) -> SessionRecord {
        SessionRecord {
            id: self.id.clone(),
            created_at: self.created_at,
            updated_at: Utc::now(),
            working_dir: self.working_dir.clone(),
            config,
            messages: self.messages.clone(),
            context: self.context.clone(),
            cache_handle: self.cache_handle.clone(),
        }
    }

    pub fn push(&mut self, msg: Message) {
        self.token_count += estimate_message(&msg);
        self.messages.push(msg);
    }

    /// Fraction of context window consumed (0.0–1.0)
    pub fn context_fraction(&self) -> f32 {
        if self.max_tokens == 0 {
            return 0.0;
        }
        (self.token_count as f32) / (self.max_tokens as f32)
    }

    pub fn is_near_limit(&self, threshold: f32) -> bool {
        self.context_fraction() >= threshold
    }

    /// Recalculate token count from scratch (call after compression).
    pub fn recalculate_tokens(&mut self) {
        self.token_count = estimate_log(&self.messages);
    }

    /// Replace the message list and recalculate token count.
    pub fn replace_messages(&mut self, messages: Vec<Message>) {
        self.messages = messages;
        self.recalculate_tokens();
    }

    /// Check the §3 log invariants.
    pub fn validate(&self) -> Result<(), InvariantBreach> {
        nils_model::validate(&self.messages)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
