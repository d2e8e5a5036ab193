// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// A single tool invocation requested by the model.
#[derive(Debug, Clone)]
pub struct ToolCall {
    /// Opaque identifier returned by the model (forwarded verbatim)
    pub id: String,
    pub name: String,
    /// Parsed JSON arguments
    pub args: Value,
}

/// Why a tool call failed.  The kind travels back to the model in the tool
/// reply so it can adjust; it never aborts the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ToolErrorKind {
    #[error("unknown_tool")]
    UnknownTool,
    #[error("invalid_args")]
    InvalidArgs,
    #[error("permission_denied")]
    PermissionDenied,
    #[error("timeout")]
    Timeout,
    #[error("execution_error")]
    ExecutionError,
    #[error("cancelled")]
    Cancelled,
}

/// The result of executing a tool.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub call_id: String,
    pub content: String,
    /// `None` on success; the error kind otherwise.  The content then
    /// carries the human-readable message.
    pub error: Option<ToolErrorKind>,
}

impl ToolOutput {
    pub fn ok(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            content: content.into(),
            error: None,
        }
    }

    pub fn err(call_id: impl Into<String>, kind: ToolErrorKind, msg: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            content: msg.into(),
            error: Some(kind),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Describes the shape of a tool's text output for context-aware truncation.
///
/// When a tool result exceeds the configured token cap, the loop uses this
/// category to pick the right extraction strategy.  Each tool declares its
/// own category; the core never hard-codes tool names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputCategory {
    /// Terminal / process output: keep the first 60 + last 40 lines so both
    /// the command preamble and the final result are visible.
    HeadTail,
    /// Ordered match list: keep the leading matches so the model sees the
    /// highest-relevance results first.
    MatchList,
    /// File content: keep a head and tail window with a separator so the
    /// model sees both the top of the file and the end.
    FileContent,
    /// Generic text: hard-truncate at the character boundary.
    #[default]
    Generic,
}

/// Trait that every tool available to the runtime must implement.
///
/// Tools never call back into the loop; they return results.  A tool that
/// needs session context receives it as an explicit argument through its
/// schema.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for parameters
    fn parameters_schema(&self) -> Value;
    /// Whether this tool mutates observable state.  Mutating calls take an
    /// exclusive lock on their resource key; read-only calls share it.
    fn is_mutating(&self) -> bool {
        false
    }
    /// Logical resource this call touches (file path, "shell", …).
    /// `None` means the call contends with nothing.
    fn resource_key(&self, _args: &Value) -> Option<String> {
        None
    }
    /// Describes the shape of this tool's output for context-aware truncation.
    fn output_category(&self) -> OutputCategory {
        OutputCategory::Generic
    }
    /// Per-tool timeout override; `None` uses the dispatcher default.
    fn timeout(&self) -> Option<std::time::Duration> {
        None
    }
    /// Execute the tool.  Failures should be wrapped in [`ToolOutput::err`];
    /// long-running work must observe `cancel`.
    async fn execute(&self, call: &ToolCall, cancel: &CancellationToken) -> ToolOutput;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
