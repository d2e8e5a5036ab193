// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod loader;
mod schema;

pub use loader::load;
pub use schema::{
    AgentConfig, Config, ModelConfig, ModelsConfig, StoreConfig, ToolsConfig,
};
