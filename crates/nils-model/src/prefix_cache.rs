// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Provider-side prefix-cache protocol.
//!
//! Providers that advertise the caching endpoint accept a one-time
//! registration of the stable system prefix:
//!
//! - `POST {base}/caching` with `{model, messages, ttl, tools?}` → `{cache_id}`
//! - subsequent chat requests carry the id and a TTL-reset marker as request
//!   headers while still including the identical prefix in the body (the
//!   provider verifies by hash)
//! - `DELETE {base}/caching/{id}` at shutdown
//!
//! Consistency contract: the registered prefix and tools schema must be
//! byte-identical to what each request sends.  Any drift invalidates the
//! handle: the old entry is deleted and a new one created.

use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::ModelError;

pub const CACHE_ID_HEADER: &str = "x-cache-id";
pub const CACHE_TTL_RESET_HEADER: &str = "x-cache-ttl-reset";

/// A live provider-side cache entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheHandle {
    pub id: String,
    prefix_hash: String,
    tools_hash: String,
}

/// What `prepare` decided to do for the current request.
#[derive(Debug, Clone, PartialEq, Eq)]
enum CachePlan {
    /// Prefix and tools unchanged: reuse the stored id.
    Reuse { cache_id: String },
    /// No handle yet, or the fingerprint drifted: (re)create.
    Create { delete_first: Option<String> },
}

/// Header pairs to attach to a chat request that rides an existing entry.
#[derive(Debug, Clone)]
pub struct CacheHeaders {
    pub cache_id: String,
    pub ttl_secs: u64,
}

impl CacheHeaders {
    pub fn pairs(&self) -> [(&'static str, String); 2] {
        [
            (CACHE_ID_HEADER, self.cache_id.clone()),
            (CACHE_TTL_RESET_HEADER, self.ttl_secs.to_string()),
        ]
    }
}

fn fingerprint(value: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

fn plan(current: Option<&CacheHandle>, prefix_hash: &str, tools_hash: &str) -> CachePlan {
    match current {
        Some(handle) if handle.prefix_hash == prefix_hash && handle.tools_hash == tools_hash => {
            CachePlan::Reuse {
                cache_id: handle.id.clone(),
            }
        }
        Some(handle) => CachePlan::Create {
            delete_first: Some(handle.id.clone()),
        },
        None => CachePlan::Create { delete_first: None },
    }
}

pub struct PrefixCacheClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    ttl_secs: u64,
    api_key: Option<String>,
    state: Mutex<Option<CacheHandle>>,
}

impl PrefixCacheClient {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        ttl_secs: u64,
        api_key: Option<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            ttl_secs,
            api_key,
            state: Mutex::new(None),
        }
    }

    /// Ensure a cache entry exists for the given wire-format prefix and tools,
    /// creating or rebuilding as needed, and return the headers to attach.
    ///
    /// `prefix` must be exactly the leading system messages of the outgoing
    /// request body, in wire format; the provider verifies the hash.
    pub async fn prepare(
        &self,
        prefix: &[Value],
        tools: &[Value],
    ) -> Result<CacheHeaders, ModelError> {
        let prefix_value = Value::Array(prefix.to_vec());
        let tools_value = Value::Array(tools.to_vec());
        let prefix_hash = fingerprint(&prefix_value);
        let tools_hash = fingerprint(&tools_value);

        let mut state = self.state.lock().await;
        match plan(state.as_ref(), &prefix_hash, &tools_hash) {
            CachePlan::Reuse { cache_id } => {
                debug!(cache_id = %cache_id, "reusing prefix cache entry");
                Ok(CacheHeaders {
                    cache_id,
                    ttl_secs: self.ttl_secs,
                })
            }
            CachePlan::Create { delete_first } => {
                if let Some(old) = delete_first {
                    warn!(cache_id = %old, "prefix drifted; invalidating cache entry");
                    self.delete(&old).await;
                }
                let id = self.create(prefix_value, tools_value).await?;
                *state = Some(CacheHandle {
                    id: id.clone(),
                    prefix_hash,
                    tools_hash,
                });
                Ok(CacheHeaders {
                    cache_id: id,
                    ttl_secs: self.ttl_secs,
                })
            }
        }
    }

    async fn create(&self, prefix: Value, tools: Value) -> Result<String, ModelError> {
        let mut body = json!({
            "model": self.model,
            "messages": prefix,
            "ttl": self.ttl_secs,
        });
        if tools.as_array().is_some_and(|t| !t.is_empty()) {
            body["tools"] = tools;
        }
        let mut req = self.http.post(format!("{}/caching", self.base_url)).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| ModelError::Transport(e.to_string()))?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(ModelError::Provider {
                provider: "prefix-cache".into(),
                status,
                body,
            });
        }
        let body: Value = resp
            .json()
            .await
            .map_err(|e| ModelError::MalformedResponse(e.to_string()))?;
        body["cache_id"]
            .as_str()
            .map(String::from)
            .ok_or_else(|| ModelError::MalformedResponse("missing cache_id".into()))
    }

    /// Best-effort delete; a failed delete only means the entry expires by TTL.
    async fn delete(&self, id: &str) {
        let mut req = self.http.delete(format!("{}/caching/{}", self.base_url, id));
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        if let Err(e) = req.send().await {
            warn!(cache_id = %id, error = %e, "prefix cache delete failed");
        }
    }

    /// The currently held cache id, if any.
    pub async fn current_id(&self) -> Option<String> {
        self.state.lock().await.as_ref().map(|h| h.id.clone())
    }

    /// Delete the live entry.  Called at clean process shutdown.
    pub async fn shutdown(&self) {
        let handle = self.state.lock().await.take();
        if let Some(handle) = handle {
            debug!(cache_id = %handle.id, "deleting prefix cache entry at shutdown");
            self.delete(&handle.id).await;
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
