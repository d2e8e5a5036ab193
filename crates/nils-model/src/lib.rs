// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
pub mod invariants;
pub mod prefix_cache;
pub(crate) mod openai_compat;
mod error;
mod mock;
mod provider;
mod types;

pub use error::ModelError;
pub use invariants::{unanswered_call_ids, validate, InvariantBreach};
pub use mock::{FailingProvider, MockProvider, ScriptedMockProvider};
pub use openai_compat::{OpenAICompatProvider, RetryPolicy};
pub use provider::{ModelKind, ModelProvider, ModelRouter, ResponseStream};
pub use types::*;

use std::sync::Arc;

use anyhow::bail;
use nils_config::{ModelConfig, ModelsConfig};

/// Construct a provider from configuration.
///
/// `provider` selects the driver: `"openai"` covers every endpoint that
/// speaks the OpenAI-compatible wire format; `"mock"` is the deterministic
/// echo provider for offline runs and tests.
pub fn from_config(cfg: &ModelConfig, retry_attempts: u32) -> anyhow::Result<Arc<dyn ModelProvider>> {
    match cfg.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAICompatProvider::from_config(
            cfg,
            retry_attempts,
        ))),
        "mock" => Ok(Arc::new(MockProvider)),
        other => bail!("unknown model provider '{other}' (expected \"openai\" or \"mock\")"),
    }
}

/// Build the basic/reasoning router from the models section of the config.
pub fn router_from_config(cfg: &ModelsConfig, retry_attempts: u32) -> anyhow::Result<ModelRouter> {
    let basic = from_config(&cfg.basic, retry_attempts)?;
    let reasoning = cfg
        .reasoning
        .as_ref()
        .map(|m| from_config(m, retry_attempts))
        .transpose()?;
    Ok(ModelRouter::new(basic, reasoning))
}
