// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

/// The two model aliases the runtime routes between.
///
/// `basic` handles summarization and other routine calls; `reasoning` (when
/// configured) handles the main agentic inference.  Leaving `reasoning`
/// unset routes everything through `basic`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelsConfig {
    #[serde(default)]
    pub basic: ModelConfig,
    #[serde(default)]
    pub reasoning: Option<ModelConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Provider identifier: "openai" for any OpenAI-compatible endpoint,
    /// "mock" for the scripted test provider.
    pub provider: String,
    /// Model name forwarded to the provider API
    pub name: String,
    /// Environment variable that holds the API key (read at runtime)
    pub api_key_env: Option<String>,
    /// Explicit API key; prefer api_key_env in config files to avoid secrets
    /// in version-controlled files
    pub api_key: Option<String>,
    /// Base URL override.  Useful for local proxies, LiteLLM, or Cloudflare.
    pub base_url: Option<String>,
    /// Maximum tokens to request in a single completion
    pub max_tokens: Option<u32>,
    /// Sampling temperature (0.0–2.0)
    pub temperature: Option<f32>,
    /// Context window in tokens; drives the compression trigger.
    #[serde(default = "default_context_window")]
    pub context_window: usize,

    // ── Prefix caching ────────────────────────────────────────────────────────
    /// Engage the provider-side prefix-cache protocol when the base URL
    /// matches a provider that advertises it.  The stable system prefix is
    /// registered once per session via the provider's caching endpoint and
    /// attached to every subsequent request by id; the handle is deleted at
    /// shutdown.  Providers without the endpoint ignore this flag.
    #[serde(default)]
    pub prefix_cache: bool,
    /// TTL in seconds requested when creating a prefix-cache entry.
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

fn default_context_window() -> usize {
    128_000
}
fn default_cache_ttl_secs() -> u64 {
    300
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: "openai".into(),
            name: "gpt-4o".into(),
            api_key_env: None,
            api_key: None,
            base_url: None,
            max_tokens: Some(4096),
            temperature: Some(0.2),
            context_window: default_context_window(),
            prefix_cache: false,
            cache_ttl_secs: default_cache_ttl_secs(),
        }
    }
}

fn default_max_turns() -> u32 {
    25
}
fn default_compression_trigger() -> f32 {
    0.9
}
fn default_message_threshold() -> usize {
    20
}
fn default_cacheable_prefix_keep() -> usize {
    4
}
fn default_summary_max_tokens() -> u32 {
    1000
}
fn default_summary_temperature() -> f32 {
    0.2
}
fn default_tool_result_token_cap() -> usize {
    4000
}
fn default_memory_threshold() -> f32 {
    0.35
}
fn default_retry_attempts() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Maximum ReAct iterations for one task before the loop fails with a
    /// budget_exhausted error.
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    /// Wall-clock budget per task in seconds (0 = no limit).
    #[serde(default)]
    pub task_timeout_secs: u64,
    /// Total-token ceiling per task, counting provider-reported input and
    /// output tokens across all iterations (0 = no limit).  Serves as the
    /// cost budget without tying the config to any one price sheet.
    #[serde(default)]
    pub max_cost_tokens: u64,
    /// Fraction of the context window at which compression triggers (0.0–1.0).
    #[serde(default = "default_compression_trigger")]
    pub compression_trigger: f32,
    /// Message count at which compression triggers regardless of tokens.
    #[serde(default = "default_message_threshold")]
    pub message_threshold: usize,
    /// Number of leading conversation messages preserved verbatim as the
    /// cacheable prefix during compression.  The prefix is extended past
    /// this count when needed to keep tool-call/result pairs intact.
    #[serde(default = "default_cacheable_prefix_keep")]
    pub cacheable_prefix_keep: usize,
    /// Output budget for the LLM-produced compression summary.
    #[serde(default = "default_summary_max_tokens")]
    pub summary_max_tokens: u32,
    /// Sampling temperature for the compression summary call.
    #[serde(default = "default_summary_temperature")]
    pub summary_temperature: f32,
    /// Maximum tokens allowed for a single tool result before it is
    /// deterministically truncated before entering the session.
    ///
    /// Truncation is content-aware: terminal output keeps head+tail lines,
    /// match lists keep leading matches, file content keeps head+tail.
    /// A value of 0 disables per-result truncation entirely.
    #[serde(default = "default_tool_result_token_cap")]
    pub tool_result_token_cap: usize,
    /// Minimum retrieval score for injecting a memory_context message.
    #[serde(default = "default_memory_threshold")]
    pub memory_threshold: f32,
    /// Model transport retry attempts (network errors and 5xx).
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// System prompt override; leave None to use the built-in prompt
    #[serde(default)]
    pub system_prompt: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
            task_timeout_secs: 0,
            max_cost_tokens: 0,
            compression_trigger: default_compression_trigger(),
            message_threshold: default_message_threshold(),
            cacheable_prefix_keep: default_cacheable_prefix_keep(),
            summary_max_tokens: default_summary_max_tokens(),
            summary_temperature: default_summary_temperature(),
            tool_result_token_cap: default_tool_result_token_cap(),
            memory_threshold: default_memory_threshold(),
            retry_attempts: default_retry_attempts(),
            system_prompt: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Maximum tool calls executing in parallel within one assistant turn.
    pub max_concurrent: usize,
    /// Timeout in seconds for a single tool call (tools may override).
    pub timeout_secs: u64,
    /// Only tools matching these glob patterns may run.  Empty = all tools.
    pub allow_patterns: Vec<String>,
    /// Tools matching these glob patterns are always denied.
    pub deny_patterns: Vec<String>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            timeout_secs: 30,
            allow_patterns: vec![],
            deny_patterns: vec![],
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Root directory for session and backup files
    /// (default: <data_dir>/nils).
    pub data_dir: Option<std::path::PathBuf>,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
