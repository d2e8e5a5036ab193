// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! System prompt assembly.

/// Built-in system prompt used when the config does not override it.
const DEFAULT_SYSTEM_PROMPT: &str = "\
You are an autonomous software engineering assistant. You accomplish tasks \
by reasoning step by step and calling the provided tools. Prefer reading \
before writing; verify your changes; keep responses concise. When the task \
is complete, reply without calling any tool.";

/// Compose the system prompt from the optional override plus the session's
/// free-form context string.
pub fn system_prompt(custom: Option<&str>, context: &str) -> String {
    let base = custom.unwrap_or(DEFAULT_SYSTEM_PROMPT);
    if context.is_empty() {
        base.to_string()
    } else {
        format!("{base}\n\n## Session context\n\n{context}")
    }
}
