// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use crate::Config;

/// Ordered list of config file locations searched from lowest to highest priority.
/// Later files override earlier ones.
fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // 1. System-wide default
    paths.push(PathBuf::from("/etc/nils/config.yaml"));
    paths.push(PathBuf::from("/etc/nils/config.yml"));

    // 2. XDG / home
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".config/nils/config.yaml"));
        paths.push(home.join(".config/nils/config.yml"));
    }
    if let Some(cfg) = dirs::config_dir() {
        paths.push(cfg.join("nils/config.yaml"));
        paths.push(cfg.join("nils/config.yml"));
    }

    // 3. Workspace-local
    paths.push(PathBuf::from(".nils/config.yaml"));
    paths.push(PathBuf::from(".nils/config.yml"));
    paths.push(PathBuf::from(".nils.yaml"));
    paths.push(PathBuf::from(".nils.yml"));

    paths
}

/// Load configuration by merging all discovered YAML files, then apply
/// environment overrides (env > file > defaults).
/// The `extra` argument may provide an explicit path (e.g. `--config` CLI flag).
pub fn load(extra: Option<&Path>) -> anyhow::Result<Config> {
    let mut merged = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());

    for path in config_search_paths() {
        if path.is_file() {
            debug!(path = %path.display(), "loading config layer");
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let layer: serde_yaml::Value = serde_yaml::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            merge_yaml(&mut merged, layer);
        }
    }

    if let Some(p) = extra {
        debug!(path = %p.display(), "loading explicit config");
        let text =
            std::fs::read_to_string(p).with_context(|| format!("reading {}", p.display()))?;
        let layer: serde_yaml::Value =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", p.display()))?;
        merge_yaml(&mut merged, layer);
    }

    let mut config: Config = if matches!(merged, serde_yaml::Value::Mapping(ref m) if m.is_empty())
    {
        Config::default()
    } else {
        serde_yaml::from_value(merged).unwrap_or_default()
    };

    apply_env_overrides(&mut config);
    Ok(config)
}

/// Environment variables beat anything read from disk.
///
/// - `NILS_API_KEY`     — API key for both model aliases
/// - `NILS_TOOL_ALLOW`  — comma-separated tool allowlist patterns
/// - `NILS_TOOL_DENY`   — comma-separated tool denylist patterns
fn apply_env_overrides(config: &mut Config) {
    if let Ok(key) = std::env::var("NILS_API_KEY") {
        if !key.is_empty() {
            config.models.basic.api_key = Some(key.clone());
            if let Some(reasoning) = config.models.reasoning.as_mut() {
                reasoning.api_key = Some(key);
            }
        }
    }
    if let Ok(list) = std::env::var("NILS_TOOL_ALLOW") {
        config.tools.allow_patterns = split_list(&list);
    }
    if let Ok(list) = std::env::var("NILS_TOOL_DENY") {
        config.tools.deny_patterns = split_list(&list);
    }
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(String::from)
        .collect()
}

/// Deep-merge `src` into `dst`; src wins on scalar conflicts.
fn merge_yaml(dst: &mut serde_yaml::Value, src: serde_yaml::Value) {
    match (dst, src) {
        (serde_yaml::Value::Mapping(d), serde_yaml::Value::Mapping(s)) => {
            for (k, v) in s {
                let entry = d
                    .entry(k)
                    .or_insert(serde_yaml::Value::Mapping(serde_yaml::Mapping::new()));
                merge_yaml(entry, v);
            }
        }
        (dst, src) => *dst = src,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
