// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;

use crate::{
    provider::ResponseStream, CompletionRequest, ModelError, ResponseEvent, Role,
};

/// Deterministic mock provider for tests.  Echoes the last user message
/// back as the assistant response.
#[derive(Default)]
pub struct MockProvider;

#[async_trait]
impl crate::ModelProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }
    fn model_name(&self) -> &str {
        "mock-model"
    }
    fn context_window(&self) -> usize {
        128_000
    }

    async fn complete(&self, req: CompletionRequest) -> Result<ResponseStream, ModelError> {
        let reply = req
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("[no input]")
            .to_string();

        let events: Vec<Result<ResponseEvent, ModelError>> = vec![
            Ok(ResponseEvent::TextDelta(format!("MOCK: {reply}"))),
            Ok(ResponseEvent::Usage {
                input_tokens: 10,
                output_tokens: 10,
                cache_read_tokens: 0,
                cache_write_tokens: 0,
            }),
            Ok(ResponseEvent::Done),
        ];
        Ok(Box::pin(stream::iter(events)))
    }
}

/// A pre-scripted mock provider.  Each call to `complete` (or `chat`) pops
/// the next response script from the front of the queue.  This lets tests
/// specify exact event sequences, including parallel tool calls, without
/// network access.
pub struct ScriptedMockProvider {
    scripts: Arc<Mutex<Vec<Vec<ResponseEvent>>>>,
    context_window: usize,
    /// The last `CompletionRequest` seen by this provider.
    /// Written on each call so tests can inspect what was sent.
    pub last_request: Arc<Mutex<Option<CompletionRequest>>>,
}

impl ScriptedMockProvider {
    /// Build a provider from a list of response scripts.
    /// The outer `Vec` is the ordered list of calls; the inner `Vec` is the
    /// sequence of [`ResponseEvent`]s emitted for that call.
    pub fn new(scripts: Vec<Vec<ResponseEvent>>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts)),
            context_window: 128_000,
            last_request: Arc::new(Mutex::new(None)),
        }
    }

    /// Shrink the claimed context window so compression tests can trip the
    /// trigger with small message logs.
    pub fn with_context_window(mut self, tokens: usize) -> Self {
        self.context_window = tokens;
        self
    }

    /// Convenience: provider that always returns a single text reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        let r = reply.into();
        Self::new(vec![vec![
            ResponseEvent::TextDelta(r),
            ResponseEvent::Usage {
                input_tokens: 5,
                output_tokens: 5,
                cache_read_tokens: 0,
                cache_write_tokens: 0,
            },
            ResponseEvent::Done,
        ]])
    }

    /// Convenience: provider that returns one tool call, then a text reply
    /// on the following call.
    pub fn tool_then_text(
        tool_id: impl Into<String>,
        tool_name: impl Into<String>,
        args_json: impl Into<String>,
        final_text: impl Into<String>,
    ) -> Self {
        Self::new(vec![
            // Round 1 – model emits a tool call
            vec![
                ResponseEvent::ToolCallDelta {
                    index: 0,
                    id: tool_id.into(),
                    name: tool_name.into(),
                    arguments: args_json.into(),
                },
                ResponseEvent::Done,
            ],
            // Round 2 – model responds after seeing the tool result
            vec![
                ResponseEvent::TextDelta(final_text.into()),
                ResponseEvent::Done,
            ],
        ])
    }

    /// Number of scripts not yet consumed.
    pub fn remaining(&self) -> usize {
        self.scripts.lock().unwrap().len()
    }

    fn pop_script(&self, req: &CompletionRequest) -> Vec<ResponseEvent> {
        *self.last_request.lock().unwrap() = Some(req.clone());
        let mut scripts = self.scripts.lock().unwrap();
        if scripts.is_empty() {
            vec![
                ResponseEvent::TextDelta("[script exhausted]".into()),
                ResponseEvent::Done,
            ]
        } else {
            scripts.remove(0)
        }
    }
}

#[async_trait]
impl crate::ModelProvider for ScriptedMockProvider {
    fn name(&self) -> &str {
        "scripted-mock"
    }
    fn model_name(&self) -> &str {
        "scripted"
    }
    fn context_window(&self) -> usize {
        self.context_window
    }

    async fn complete(&self, req: CompletionRequest) -> Result<ResponseStream, ModelError> {
        let events: Vec<Result<ResponseEvent, ModelError>> =
            self.pop_script(&req).into_iter().map(Ok).collect();
        Ok(Box::pin(stream::iter(events)))
    }
}

/// A provider whose every call fails with a transport error.  Used to test
/// retry exhaustion and the compressor's statistical fallback.
#[derive(Default)]
pub struct FailingProvider;

#[async_trait]
impl crate::ModelProvider for FailingProvider {
    fn name(&self) -> &str {
        "failing-mock"
    }
    fn model_name(&self) -> &str {
        "failing"
    }
    fn context_window(&self) -> usize {
        128_000
    }

    async fn complete(&self, _req: CompletionRequest) -> Result<ResponseStream, ModelError> {
        Err(ModelError::Transport("connection refused".into()))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
