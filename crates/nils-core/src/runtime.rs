// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Programmatic entry points: start, resume, shutdown.
//!
//! The CLI (or any embedder) is a thin driver over this surface; cancellation
//! is the caller's `CancellationToken` passed into `process_task`.

use std::sync::Arc;

use nils_config::Config;
use nils_model::{router_from_config, ModelRouter};
use nils_store::SessionStore;
use nils_tools::{builtin::ThinkTool, Dispatcher, ToolRegistry};

use crate::{Agent, TaskError};

pub struct Runtime {
    config: Arc<Config>,
    store: Arc<SessionStore>,
    router: ModelRouter,
    tools: Arc<ToolRegistry>,
}

impl Runtime {
    /// Build a runtime with the built-in tool set (`think`).  Embedders that
    /// bring their own tools use [`Runtime::with_registry`].
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let mut registry = ToolRegistry::new();
        registry.register(ThinkTool);
        Self::with_registry(config, registry)
    }

    pub fn with_registry(config: Config, registry: ToolRegistry) -> anyhow::Result<Self> {
        let router = router_from_config(&config.models, config.agent.retry_attempts)?;
        let store = Arc::new(SessionStore::open(config.store.data_dir.clone())?);
        Ok(Self {
            config: Arc::new(config),
            store,
            router,
            tools: Arc::new(registry),
        })
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    fn dispatcher(&self) -> Dispatcher {
        Dispatcher::from_config(Arc::clone(&self.tools), &self.config.tools)
    }

    /// Create a fresh session and the agent driving it.
    pub fn start_session(&self) -> Agent {
        Agent::new(
            self.router.clone(),
            Arc::clone(&self.tools),
            self.dispatcher(),
            Arc::clone(&self.store),
            Arc::clone(&self.config),
        )
    }

    /// Load a persisted session by id.  Falls back to its newest backup when
    /// the session file is corrupt.
    pub fn resume_session(&self, id: &str) -> Result<Agent, TaskError> {
        let record = self.store.load_session(id)?;
        Ok(Agent::resume(
            record,
            self.router.clone(),
            Arc::clone(&self.tools),
            self.dispatcher(),
            Arc::clone(&self.store),
            Arc::clone(&self.config),
        ))
    }

    /// Release provider-side resources (prefix-cache handles).  Call once at
    /// clean process shutdown.
    pub async fn shutdown(&self) {
        self.router.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nils_config::{ModelConfig, ModelsConfig, StoreConfig};
    use tempfile::TempDir;

    fn mock_config(dir: &TempDir) -> Config {
        Config {
            models: ModelsConfig {
                basic: ModelConfig {
                    provider: "mock".into(),
                    ..ModelConfig::default()
                },
                reasoning: None,
            },
            store: StoreConfig {
                data_dir: Some(dir.path().to_path_buf()),
            },
            ..Config::default()
        }
    }

    #[test]
    fn runtime_builds_with_mock_provider() {
        let dir = TempDir::new().unwrap();
        let rt = Runtime::new(mock_config(&dir)).unwrap();
        let agent = rt.start_session();
        assert!(agent.session().messages.is_empty());
    }

    #[test]
    fn resume_unknown_session_errors() {
        let dir = TempDir::new().unwrap();
        let rt = Runtime::new(mock_config(&dir)).unwrap();
        assert!(rt.resume_session("missing").is_err());
    }
}
