// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Content-aware token estimation.
//!
//! The runtime never tokenizes; it approximates with a chars-per-token
//! ratio picked by content class.  Code packs tighter than prose (operators
//! and short identifiers each cost a token), JSON sits between, and very
//! long prose compresses better than the default.  Providers' actual counts
//! drift from these estimates by a few percent, which the compression
//! trigger absorbs by firing below the hard window.

use nils_model::Message;

/// Per-message overhead: role tag, separators, metadata framing.
const MESSAGE_OVERHEAD_TOKENS: usize = 4;
/// Extra overhead per tool call: id, function wrapper, argument framing.
const TOOL_CALL_OVERHEAD_TOKENS: usize = 8;
/// Prose longer than this reads as flowing text, not code.
const LONG_PROSE_THRESHOLD: usize = 10_000;

/// Estimate tokens for a plain text fragment.
pub fn estimate_text(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    let ratio = chars_per_token(text);
    ((text.len() as f32 / ratio) as usize).max(1)
}

/// Estimate tokens for one message including structural overhead.
pub fn estimate_message(msg: &Message) -> usize {
    let mut tokens = MESSAGE_OVERHEAD_TOKENS + estimate_text(&msg.content);
    for tc in &msg.tool_calls {
        tokens += TOOL_CALL_OVERHEAD_TOKENS;
        tokens += estimate_text(&tc.name);
        tokens += estimate_text(&tc.args.to_string());
    }
    tokens
}

/// Estimate tokens for an entire message log.
pub fn estimate_log(messages: &[Message]) -> usize {
    messages.iter().map(estimate_message).sum()
}

fn chars_per_token(text: &str) -> f32 {
    if looks_like_json(text) {
        return 3.0;
    }
    if looks_like_code(text) {
        return 2.5;
    }
    if text.len() > LONG_PROSE_THRESHOLD {
        return 5.0;
    }
    4.0
}

fn looks_like_json(text: &str) -> bool {
    let trimmed = text.trim_start();
    if !(trimmed.starts_with('{') || trimmed.starts_with('[')) {
        return false;
    }
    // Cheap structural check; full parsing would be wasted work on every
    // estimate.  Quote density separates JSON from code blocks that merely
    // open with a brace.
    let quotes = text.bytes().filter(|&b| b == b'"').count();
    quotes >= 2 && text.contains(':')
}

fn looks_like_code(text: &str) -> bool {
    let lines: Vec<&str> = text.lines().take(200).collect();
    if lines.len() < 3 {
        return false;
    }
    let code_markers = lines
        .iter()
        .filter(|l| {
            let t = l.trim_start();
            t.ends_with('{')
                || t.ends_with(';')
                || t.starts_with("fn ")
                || t.starts_with("def ")
                || t.starts_with("import ")
                || t.starts_with("use ")
                || t.starts_with("#include")
                || l.starts_with("    ")
                || l.starts_with('\t')
        })
        .count();
    code_markers * 2 > lines.len()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
