// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{Stream, StreamExt};

use crate::{ChatResponse, CompletionRequest, Message, ModelError, ResponseEvent, Usage};

pub type ResponseStream = Pin<Box<dyn Stream<Item = Result<ResponseEvent, ModelError>> + Send>>;

/// Which configured model alias a request should use.
///
/// Summarization and other routine calls go to `Basic`; the main agentic
/// inference goes to `Reasoning` when one is configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    Basic,
    Reasoning,
}

#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Provider id for status display and log fields.
    fn name(&self) -> &str;

    /// Model identifier as reported to users.
    fn model_name(&self) -> &str;

    /// Context window in tokens; drives the compression trigger.
    fn context_window(&self) -> usize;

    /// Send a completion request and return a streaming response.
    async fn complete(&self, req: CompletionRequest) -> Result<ResponseStream, ModelError>;

    /// Non-streaming completion.
    ///
    /// The default implementation drains the stream and folds text deltas
    /// into a single assistant message; providers with a dedicated
    /// non-streaming endpoint may override.
    async fn chat(&self, mut req: CompletionRequest) -> Result<ChatResponse, ModelError> {
        req.stream = false;
        let mut stream = self.complete(req).await?;
        let mut text = String::new();
        let mut usage = Usage::default();
        while let Some(event) = stream.next().await {
            match event? {
                ResponseEvent::TextDelta(delta) => text.push_str(&delta),
                ResponseEvent::Usage {
                    input_tokens,
                    output_tokens,
                    cache_read_tokens,
                    cache_write_tokens,
                } => {
                    usage = Usage {
                        input_tokens,
                        output_tokens,
                        cache_read_tokens,
                        cache_write_tokens,
                    };
                }
                ResponseEvent::Done => break,
                _ => {}
            }
        }
        Ok(ChatResponse {
            message: Message::assistant(text),
            usage,
        })
    }

    /// Release any provider-side resources (prefix-cache handles).
    /// Called once at clean shutdown.
    async fn shutdown(&self) {}
}

/// Routes requests to the configured model aliases.
#[derive(Clone)]
pub struct ModelRouter {
    basic: Arc<dyn ModelProvider>,
    reasoning: Option<Arc<dyn ModelProvider>>,
}

impl ModelRouter {
    pub fn new(basic: Arc<dyn ModelProvider>, reasoning: Option<Arc<dyn ModelProvider>>) -> Self {
        Self { basic, reasoning }
    }

    /// Resolve a model kind to a provider.  `Reasoning` falls back to
    /// `basic` when no reasoning alias is configured.
    pub fn get(&self, kind: ModelKind) -> &Arc<dyn ModelProvider> {
        match kind {
            ModelKind::Basic => &self.basic,
            ModelKind::Reasoning => self.reasoning.as_ref().unwrap_or(&self.basic),
        }
    }

    /// Shut down every distinct provider.
    pub async fn shutdown(&self) {
        self.basic.shutdown().await;
        if let Some(reasoning) = &self.reasoning {
            reasoning.shutdown().await;
        }
    }
}
