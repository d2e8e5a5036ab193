// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─── Message types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool invocation carried on an assistant message.
///
/// `args` is the parsed JSON argument object.  On the wire the arguments
/// travel as a JSON-encoded string; parsing happens when the streamed
/// fragments are assembled, so the rest of the runtime never re-parses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub args: Value,
}

/// One entry of the conversation log.
///
/// All parallel tool calls of an assistant turn live on a single message in
/// `tool_calls`; each tool reply is a separate `Role::Tool` message whose
/// `tool_call_id` names the call it answers.  Metadata is an open map; the
/// runtime recognizes `type`, `origin_tool`, `error_kind`, `cancelled`,
/// `repair` and `cache_friendly`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

/// Metadata `type` tag for system messages produced by compression.
pub const META_COMPREHENSIVE_SUMMARY: &str = "comprehensive_ai_summary";
/// Metadata `type` tag for the deterministic compression fallback.
pub const META_STATISTICAL_SUMMARY: &str = "statistical_summary";
/// Metadata `type` tag shared by all compression artifacts.
pub const META_COMPRESSION_SUMMARY: &str = "compression_summary";
/// Metadata `type` tag for injected memory retrieval context.
pub const META_MEMORY_CONTEXT: &str = "memory_context";

impl Message {
    fn with_role(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            metadata: serde_json::Map::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(Role::Assistant, content)
    }

    /// An assistant message carrying tool calls (content may be empty).
    pub fn assistant_with_calls(content: impl Into<String>, calls: Vec<ToolCallRequest>) -> Self {
        let mut m = Self::with_role(Role::Assistant, content);
        m.tool_calls = calls;
        m
    }

    /// A tool reply paired to `call_id`.
    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        let mut m = Self::with_role(Role::Tool, content);
        m.tool_call_id = Some(call_id.into());
        m
    }

    /// Attach a metadata key, builder-style.
    pub fn with_meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Read a string-valued metadata key.
    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }

    /// True for system messages tagged as compression or memory artifacts.
    /// These are allowed to appear after the system prefix.
    pub fn is_tagged_system(&self) -> bool {
        matches!(
            self.meta_str("type"),
            Some(
                META_COMPREHENSIVE_SUMMARY
                    | META_STATISTICAL_SUMMARY
                    | META_COMPRESSION_SUMMARY
                    | META_MEMORY_CONTEXT
            )
        )
    }
}

/// A tool schema provided to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object
    pub parameters: Value,
}

/// Request sent to a model provider.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSchema>,
    pub stream: bool,
    /// Per-request temperature override (compression pins this to a low value).
    pub temperature: Option<f32>,
    /// Per-request output-token cap override.
    pub max_tokens: Option<u32>,
}

/// A single streamed event from the model.
#[derive(Debug, Clone)]
pub enum ResponseEvent {
    /// A text delta streamed from the model
    TextDelta(String),
    /// A thinking/reasoning delta (reasoning-capable models only)
    ThinkingDelta(String),
    /// A tool-call fragment.  Parallel calls interleave by `index`;
    /// `id`/`name` arrive on the first fragment, `arguments` accumulate.
    ToolCallDelta {
        index: u32,
        id: String,
        name: String,
        arguments: String,
    },
    /// The model hit its output-token limit; pending tool-call arguments
    /// may be truncated.
    MaxTokens,
    /// Final usage statistics
    Usage {
        input_tokens: u32,
        output_tokens: u32,
        /// Tokens served from the provider's prompt cache (read hit).
        cache_read_tokens: u32,
        /// Tokens written into the provider's prompt cache.
        cache_write_tokens: u32,
    },
    /// The stream finished normally
    Done,
    /// A recoverable error (non-fatal warning)
    Error(String),
}

/// Token usage from one turn.
#[derive(Debug, Clone, Copy, Default)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cache_read_tokens: u32,
    pub cache_write_tokens: u32,
}

impl Usage {
    pub fn total(&self) -> u64 {
        u64::from(self.input_tokens) + u64::from(self.output_tokens)
    }
}

/// Non-streaming completion result.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub message: Message,
    pub usage: Usage,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
