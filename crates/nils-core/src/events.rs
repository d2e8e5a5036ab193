// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use nils_tools::ToolCall;

use crate::compress::SummaryKind;

/// Events emitted by the loop controller during a single task.
/// Consumers (CLI, embedders) subscribe to these to drive their output.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// A text chunk streamed from the model
    TextDelta(String),
    /// A complete text response from the model (after streaming finishes)
    TextComplete(String),
    /// A thinking/reasoning chunk from the model
    ThinkingDelta(String),
    /// The model has requested a tool call
    ToolCallStarted(ToolCall),
    /// A tool call finished
    ToolCallFinished {
        call_id: String,
        tool_name: String,
        output: String,
        is_error: bool,
    },
    /// Context was compressed; statistics for the UI
    ContextCompressed {
        tokens_before: usize,
        tokens_after: usize,
        summary: SummaryKind,
        backup_id: String,
    },
    /// Memory retrieval injected additional context into the request
    MemoryInjected { score: f32 },
    /// Token usage reported by the provider for one inference
    TokenUsage {
        input: u32,
        output: u32,
        cache_read: u32,
        cache_write: u32,
        /// Running total across the task (input + output).
        task_total: u64,
    },
    /// The task finished with a tool-call-free assistant message
    TurnComplete,
    /// The task was cancelled; any partial assistant text is preserved
    Aborted { partial_text: String },
    /// A recoverable error occurred
    Error(String),
}
