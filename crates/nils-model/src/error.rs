// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use thiserror::Error;

/// Errors surfaced by model providers after the retry policy has run out.
#[derive(Debug, Error)]
pub enum ModelError {
    /// Network-level failure (DNS, connect, broken stream).
    #[error("transport error: {0}")]
    Transport(String),
    /// 429 after the advised delay was honoured for every attempt.
    #[error("rate limited by provider (retry-after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: u64 },
    /// Non-retryable provider response (4xx) or 5xx after retries.
    #[error("{provider} error {status}: {body}")]
    Provider {
        provider: String,
        status: u16,
        body: String,
    },
    /// The response body did not match the expected wire shape.
    #[error("malformed provider response: {0}")]
    MalformedResponse(String),
    /// Missing credentials for a provider that requires them.
    #[error("API key not set; provide api_key or api_key_env in config")]
    MissingApiKey,
}

impl ModelError {
    /// True when a fresh attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ModelError::Transport(_) | ModelError::RateLimited { .. } => true,
            ModelError::Provider { status, .. } => *status >= 500,
            _ => false,
        }
    }
}
