// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! OpenAI-compatible chat completions driver.
//!
//! Speaks the standard `/chat/completions` wire format, streaming (SSE) and
//! non-streaming, including the tool-calling shape: assistant messages carry
//! an array of `{id, type: "function", function: {name, arguments}}` and tool
//! replies carry `role: "tool"` plus `tool_call_id`.
//!
//! Transport failures and 5xx responses are retried with exponential backoff
//! and jitter; 429 honours the server-advised `Retry-After`; other 4xx are
//! returned immediately.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::{debug, warn};

use nils_config::ModelConfig;

use crate::{
    prefix_cache::PrefixCacheClient,
    provider::ResponseStream,
    ChatResponse, CompletionRequest, Message, ModelError, ResponseEvent, Role, ToolCallRequest,
    Usage,
};

// ─── Retry policy ─────────────────────────────────────────────────────────────

/// Exponential backoff with a cap and ±25% jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial: Duration::from_millis(500),
            max: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn with_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// Backoff delay for the given zero-based attempt number, jittered so
    /// that concurrent clients do not retry in lockstep.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.initial.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let base = base.min(self.max.as_secs_f64());
        let base_ms = (base * 1000.0) as u64;
        let jitter_span = base_ms / 4 + 1;
        let jitter = (uuid::Uuid::new_v4().as_u128() % (jitter_span as u128)) as u64;
        Duration::from_millis(base_ms + jitter)
    }
}

// ─── Provider ─────────────────────────────────────────────────────────────────

pub struct OpenAICompatProvider {
    model: String,
    api_key: Option<String>,
    chat_url: String,
    max_tokens: u32,
    temperature: f32,
    context_window: usize,
    client: reqwest::Client,
    retry: RetryPolicy,
    prefix_cache: Option<PrefixCacheClient>,
}

impl OpenAICompatProvider {
    pub fn new(
        model: String,
        api_key: Option<String>,
        base_url: &str,
        max_tokens: Option<u32>,
        temperature: Option<f32>,
        context_window: usize,
        retry: RetryPolicy,
        prefix_cache: Option<PrefixCacheClient>,
    ) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            model,
            api_key,
            chat_url: format!("{base}/chat/completions"),
            max_tokens: max_tokens.unwrap_or(4096),
            temperature: temperature.unwrap_or(0.2),
            context_window,
            client: reqwest::Client::new(),
            retry,
            prefix_cache,
        }
    }

    /// Construct from configuration, wiring up the prefix-cache client when
    /// the capability flag is set.
    pub fn from_config(cfg: &ModelConfig, retry_attempts: u32) -> Self {
        let base_url = cfg
            .base_url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com/v1".into());
        let api_key = cfg.api_key.clone().or_else(|| {
            cfg.api_key_env
                .as_deref()
                .and_then(|var| std::env::var(var).ok())
        });
        let prefix_cache = cfg.prefix_cache.then(|| {
            PrefixCacheClient::new(
                base_url.clone(),
                cfg.name.clone(),
                cfg.cache_ttl_secs,
                api_key.clone(),
            )
        });
        Self::new(
            cfg.name.clone(),
            api_key,
            &base_url,
            cfg.max_tokens,
            cfg.temperature,
            cfg.context_window,
            RetryPolicy::with_attempts(retry_attempts),
            prefix_cache,
        )
    }

    fn build_body(&self, req: &CompletionRequest, wire_messages: &[Value]) -> Value {
        let tools: Vec<Value> = req
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect();

        let mut body = json!({
            "model": self.model,
            "messages": wire_messages,
            "stream": req.stream,
            "max_tokens": req.max_tokens.unwrap_or(self.max_tokens),
            "temperature": req.temperature.unwrap_or(self.temperature),
        });
        if req.stream {
            body["stream_options"] = json!({ "include_usage": true });
        }
        if !tools.is_empty() {
            body["tools"] = json!(tools);
        }
        body
    }

    /// Resolve prefix-cache headers for this request, if the adapter is
    /// engaged and a stable system prefix exists.  Cache failures degrade to
    /// an uncached request; they never fail the completion.
    async fn cache_headers(&self, req: &CompletionRequest, wire: &[Value]) -> Vec<(String, String)> {
        let Some(cache) = &self.prefix_cache else {
            return vec![];
        };
        let prefix_len = req
            .messages
            .iter()
            .take_while(|m| m.role == Role::System)
            .count();
        if prefix_len == 0 {
            return vec![];
        }
        let tools_wire: Vec<Value> = req
            .tools
            .iter()
            .map(|t| serde_json::to_value(t).unwrap_or(Value::Null))
            .collect();
        match cache.prepare(&wire[..prefix_len], &tools_wire).await {
            Ok(headers) => headers
                .pairs()
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
            Err(e) => {
                warn!(error = %e, "prefix cache unavailable; sending uncached request");
                vec![]
            }
        }
    }

    /// Send the request, retrying transient failures per the policy.
    async fn send_with_retry(
        &self,
        body: &Value,
        headers: &[(String, String)],
    ) -> Result<reqwest::Response, ModelError> {
        let mut attempt = 0u32;
        loop {
            let mut http_req = self.client.post(&self.chat_url).json(body);
            if let Some(key) = &self.api_key {
                http_req = http_req.bearer_auth(key);
            }
            for (name, val) in headers {
                http_req = http_req.header(name.as_str(), val.as_str());
            }

            let outcome: Result<(), ModelError> = match http_req.send().await {
                Err(e) => Err(ModelError::Transport(e.to_string())),
                Ok(resp) if resp.status().is_success() => return Ok(resp),
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if status == 429 {
                        let retry_after_secs = resp
                            .headers()
                            .get("retry-after")
                            .and_then(|v| v.to_str().ok())
                            .and_then(|v| v.parse::<u64>().ok())
                            .unwrap_or(1);
                        Err(ModelError::RateLimited { retry_after_secs })
                    } else {
                        let text = resp.text().await.unwrap_or_default();
                        Err(ModelError::Provider {
                            provider: "openai".into(),
                            status,
                            body: text,
                        })
                    }
                }
            };

            let err = outcome.unwrap_err();
            attempt += 1;
            if !err.is_retryable() || attempt >= self.retry.max_attempts {
                return Err(err);
            }
            let delay = match &err {
                // The server told us when to come back; believe it.
                ModelError::RateLimited { retry_after_secs } => {
                    Duration::from_secs(*retry_after_secs)
                }
                _ => self.retry.delay(attempt - 1),
            };
            warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "model request failed; retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl crate::ModelProvider for OpenAICompatProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn context_window(&self) -> usize {
        self.context_window
    }

    async fn complete(&self, req: CompletionRequest) -> Result<ResponseStream, ModelError> {
        let wire = build_wire_messages(&req.messages);
        let mut streamed = req.clone();
        streamed.stream = true;
        let body = self.build_body(&streamed, &wire);
        let headers = self.cache_headers(&req, &wire).await;

        debug!(
            model = %self.model,
            message_count = wire.len(),
            tool_count = req.tools.len(),
            cached = !headers.is_empty(),
            "sending streaming completion request"
        );

        let resp = self.send_with_retry(&body, &headers).await?;

        let byte_stream = resp.bytes_stream();
        // SSE events can be split across multiple TCP packets.  Maintain a
        // line buffer across chunks; emit events only for complete lines.
        let event_stream = byte_stream
            .scan(String::new(), |buf, chunk| {
                let events: Vec<Result<ResponseEvent, ModelError>> = match chunk {
                    Ok(b) => {
                        buf.push_str(&String::from_utf8_lossy(&b));
                        drain_complete_sse_lines(buf)
                    }
                    Err(e) => vec![Err(ModelError::Transport(e.to_string()))],
                };
                std::future::ready(Some(events))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(event_stream))
    }

    async fn chat(&self, mut req: CompletionRequest) -> Result<ChatResponse, ModelError> {
        req.stream = false;
        let wire = build_wire_messages(&req.messages);
        let body = self.build_body(&req, &wire);
        let headers = self.cache_headers(&req, &wire).await;

        debug!(
            model = %self.model,
            message_count = wire.len(),
            "sending completion request"
        );

        let resp = self.send_with_retry(&body, &headers).await?;
        let body: Value = resp
            .json()
            .await
            .map_err(|e| ModelError::MalformedResponse(e.to_string()))?;
        parse_chat_response(&body)
    }

    async fn shutdown(&self) {
        if let Some(cache) = &self.prefix_cache {
            cache.shutdown().await;
        }
    }
}

// ─── Wire serialization ───────────────────────────────────────────────────────

fn role_str(r: &Role) -> &'static str {
    match r {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

/// Convert the message log into the OpenAI wire-format JSON array.
///
/// Extracted as a free function so it can be unit-tested without making HTTP
/// requests.  Metadata and timestamps are runtime-internal and never leave
/// the process.
pub(crate) fn build_wire_messages(messages: &[Message]) -> Vec<Value> {
    messages
        .iter()
        .map(|m| match m.role {
            Role::Assistant if !m.tool_calls.is_empty() => {
                let calls: Vec<Value> = m
                    .tool_calls
                    .iter()
                    .map(|tc| {
                        json!({
                            "id": tc.id,
                            "type": "function",
                            "function": {
                                "name": tc.name,
                                "arguments": tc.args.to_string(),
                            }
                        })
                    })
                    .collect();
                let mut v = json!({ "role": "assistant", "tool_calls": calls });
                if !m.content.is_empty() {
                    v["content"] = json!(m.content);
                }
                v
            }
            Role::Tool => json!({
                "role": "tool",
                "tool_call_id": m.tool_call_id.as_deref().unwrap_or_default(),
                "content": m.content,
            }),
            _ => json!({ "role": role_str(&m.role), "content": m.content }),
        })
        .collect()
}

/// Parse a non-streaming chat completion body.
fn parse_chat_response(body: &Value) -> Result<ChatResponse, ModelError> {
    let message = body["choices"][0]
        .get("message")
        .ok_or_else(|| ModelError::MalformedResponse("missing choices[0].message".into()))?;
    let content = message["content"].as_str().unwrap_or_default().to_string();
    let mut calls: Vec<ToolCallRequest> = Vec::new();
    if let Some(raw_calls) = message["tool_calls"].as_array() {
        for tc in raw_calls {
            let id = tc["id"].as_str().unwrap_or_default().to_string();
            let name = tc["function"]["name"].as_str().unwrap_or_default();
            if name.is_empty() {
                warn!(tool_call_id = %id, "dropping tool call with empty name");
                continue;
            }
            let args_raw = tc["function"]["arguments"].as_str().unwrap_or("{}");
            let args =
                serde_json::from_str(args_raw).unwrap_or(Value::Object(Default::default()));
            calls.push(ToolCallRequest {
                id,
                name: name.to_string(),
                args,
            });
        }
    }
    let usage = body.get("usage").filter(|u| !u.is_null()).map(parse_usage);
    let msg = if calls.is_empty() {
        Message::assistant(content)
    } else {
        Message::assistant_with_calls(content, calls)
    };
    Ok(ChatResponse {
        message: msg,
        usage: usage.unwrap_or_default(),
    })
}

fn parse_usage(usage: &Value) -> Usage {
    let cache_read_tokens = usage
        .get("prompt_tokens_details")
        .and_then(|d| d.get("cached_tokens"))
        .and_then(|t| t.as_u64())
        .unwrap_or(0) as u32;
    Usage {
        input_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0) as u32,
        output_tokens: usage["completion_tokens"].as_u64().unwrap_or(0) as u32,
        cache_read_tokens,
        cache_write_tokens: 0,
    }
}

// ─── SSE parsing ──────────────────────────────────────────────────────────────

/// Parse a single complete SSE `data:` line into a [`ResponseEvent`].
///
/// Returns `None` for empty lines, comment lines, or unparseable data.
fn parse_sse_data_line(line: &str) -> Option<Result<ResponseEvent, ModelError>> {
    let data = line.strip_prefix("data: ")?.trim();
    if data.is_empty() {
        return None;
    }
    if data == "[DONE]" {
        return Some(Ok(ResponseEvent::Done));
    }
    let v: Value = serde_json::from_str(data).ok()?;
    Some(Ok(parse_sse_chunk(&v)))
}

/// Drain all complete `\n`-terminated SSE lines from `buf`.
///
/// Any trailing incomplete line (bytes not yet terminated by `\n`) is left
/// in `buf` so it can be extended by the next TCP chunk.  A single SSE event
/// may be split across multiple TCP packets.
pub(crate) fn drain_complete_sse_lines(
    buf: &mut String,
) -> Vec<Result<ResponseEvent, ModelError>> {
    let mut events = Vec::new();
    while let Some(nl_pos) = buf.find('\n') {
        // Strip the optional Windows-style \r before \n.
        let line = buf[..nl_pos].trim_end_matches('\r').to_string();
        *buf = buf[nl_pos + 1..].to_string();
        if let Some(ev) = parse_sse_data_line(&line) {
            events.push(ev);
        }
    }
    events
}

fn parse_sse_chunk(v: &Value) -> ResponseEvent {
    // Usage-only chunk (emitted when stream_options.include_usage = true)
    if let Some(usage) = v.get("usage").filter(|u| !u.is_null()) {
        let u = parse_usage(usage);
        return ResponseEvent::Usage {
            input_tokens: u.input_tokens,
            output_tokens: u.output_tokens,
            cache_read_tokens: u.cache_read_tokens,
            cache_write_tokens: u.cache_write_tokens,
        };
    }

    let choice = &v["choices"][0];

    // finish_reason=length means the model hit its output-token limit and any
    // pending tool-call arguments are truncated.
    if choice["finish_reason"].as_str() == Some("length") {
        return ResponseEvent::MaxTokens;
    }

    let delta = &choice["delta"];

    // Tool-call fragment.  Each SSE chunk carries exactly one tool-call delta
    // in practice; the index routes accumulation in the loop controller.
    if let Some(tool_calls) = delta.get("tool_calls") {
        if let Some(tc) = tool_calls.get(0) {
            return ResponseEvent::ToolCallDelta {
                index: tc["index"].as_u64().unwrap_or(0) as u32,
                id: tc["id"].as_str().unwrap_or("").to_string(),
                name: tc["function"]["name"].as_str().unwrap_or("").to_string(),
                arguments: tc["function"]["arguments"].as_str().unwrap_or("").to_string(),
            };
        }
    }

    // Reasoning deltas arrive as `reasoning_content` (llama.cpp, DeepSeek)
    // or `reasoning` (OpenRouter-style aggregators).
    let thinking = delta
        .get("reasoning_content")
        .and_then(|c| c.as_str())
        .or_else(|| delta.get("reasoning").and_then(|c| c.as_str()));
    if let Some(thinking) = thinking {
        if !thinking.is_empty() {
            return ResponseEvent::ThinkingDelta(thinking.to_string());
        }
    }

    if let Some(text) = delta.get("content").and_then(|c| c.as_str()) {
        return ResponseEvent::TextDelta(text.to_string());
    }

    ResponseEvent::TextDelta(String::new())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
