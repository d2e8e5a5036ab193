// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Concurrent execution of the tool calls emitted in one assistant turn.
//!
//! Contract: given the ordered `tool_calls` of an assistant message and a
//! cancellation token, return one [`ToolOutput`] per call, in call order,
//! regardless of completion order.  Errors become error outputs; nothing
//! here aborts the loop.
//!
//! Concurrency policy:
//! - every call is spawned immediately, in call order; the dispatch loop
//!   itself never waits on contention;
//! - at most `max_concurrent` calls execute at once (counting semaphore);
//! - each call optionally names a logical resource (file path, "shell").
//!   Per resource, calls form a reader/writer queue in call order: a
//!   mutating call waits for every earlier holder of the same resource,
//!   a read-only call waits only for the most recent earlier mutator.
//!   Read-only calls overlap freely with each other and with mutators of
//!   disjoint resources.  The queue state lives for one turn only.
//! - each call runs under an individual timeout (tool override or default).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use tokio::sync::{oneshot, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use nils_config::ToolsConfig;

use crate::{
    validate::validate_args, PatternPolicy, PolicyDecision, PolicyEvaluator, Tool, ToolCall,
    ToolErrorKind, ToolOutput, ToolRegistry,
};

/// Resolves when a predecessor call on the same resource has finished.
/// Cloneable so several successors can wait on the same predecessor; a
/// dropped sender (task panic) resolves it too, so the chain never wedges.
type DoneSignal = Shared<BoxFuture<'static, ()>>;

/// Per-resource ordering state for one turn.
#[derive(Default)]
struct ResourceQueue {
    /// Done-signal of the most recent mutating call on this resource.
    last_write: Option<DoneSignal>,
    /// Done-signals of read-only calls admitted since that mutator.
    readers: Vec<DoneSignal>,
}

impl ResourceQueue {
    /// Register a call and return the predecessors it must wait for.
    fn admit(&mut self, mutating: bool, done: DoneSignal) -> Vec<DoneSignal> {
        if mutating {
            // A writer waits for every current holder: the readers admitted
            // since the last writer, and that writer itself.
            let mut waits: Vec<DoneSignal> = self.readers.drain(..).collect();
            if let Some(write) = self.last_write.take() {
                waits.push(write);
            }
            self.last_write = Some(done);
            waits
        } else {
            // A reader only waits for the most recent writer; readers share.
            let waits: Vec<DoneSignal> = self.last_write.iter().cloned().collect();
            self.readers.push(done);
            waits
        }
    }
}

pub struct Dispatcher {
    registry: Arc<ToolRegistry>,
    policy: Arc<dyn PolicyEvaluator>,
    permits: Arc<Semaphore>,
    default_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ToolRegistry>,
        policy: Arc<dyn PolicyEvaluator>,
        max_concurrent: usize,
        default_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            policy,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            default_timeout,
        }
    }

    pub fn from_config(registry: Arc<ToolRegistry>, cfg: &ToolsConfig) -> Self {
        Self::new(
            registry,
            Arc::new(PatternPolicy::from_config(cfg)),
            cfg.max_concurrent,
            Duration::from_secs(cfg.timeout_secs),
        )
    }

    /// Execute every call in `calls`; the returned vector is index-aligned
    /// with the input.
    pub async fn dispatch(
        &self,
        calls: &[ToolCall],
        cancel: &CancellationToken,
    ) -> Vec<ToolOutput> {
        // Per-turn resource queues.  Keys come from each tool's resource_key;
        // discarded when this call returns.  Registration is synchronous, so
        // predecessor order is exactly call order; the waiting itself happens
        // inside each spawned task, never in this loop.
        let mut queues: HashMap<String, ResourceQueue> = HashMap::new();

        let mut tasks = Vec::with_capacity(calls.len());
        for call in calls {
            let call = call.clone();

            if cancel.is_cancelled() {
                tasks.push(Handle::Immediate(cancelled_output(&call.id)));
                continue;
            }

            let tool = match self.registry.get(&call.name) {
                Some(t) => t,
                None => {
                    warn!(tool_name = %call.name, call_id = %call.id, "unknown tool requested");
                    tasks.push(Handle::Immediate(ToolOutput::err(
                        &call.id,
                        ToolErrorKind::UnknownTool,
                        format!("unknown tool: {}", call.name),
                    )));
                    continue;
                }
            };

            match self.policy.evaluate(&call) {
                PolicyDecision::Deny => {
                    tasks.push(Handle::Immediate(ToolOutput::err(
                        &call.id,
                        ToolErrorKind::PermissionDenied,
                        format!("tool '{}' denied by policy", call.name),
                    )));
                    continue;
                }
                PolicyDecision::AllowWithConfirmation => {
                    // Confirmation UX lives outside the runtime.
                    warn!(tool_name = %call.name, "policy requested confirmation; proceeding");
                }
                PolicyDecision::Allow => {}
            }

            if let Err(reason) = validate_args(&tool.parameters_schema(), &call.args) {
                tasks.push(Handle::Immediate(ToolOutput::err(
                    &call.id,
                    ToolErrorKind::InvalidArgs,
                    format!("invalid arguments: {reason}"),
                )));
                continue;
            }

            let (predecessors, done_tx) = match tool.resource_key(&call.args) {
                Some(key) => {
                    let (done_tx, done_rx) = oneshot::channel::<()>();
                    let done: DoneSignal = done_rx.map(|_| ()).boxed().shared();
                    let waits = queues
                        .entry(key)
                        .or_default()
                        .admit(tool.is_mutating(), done);
                    (waits, Some(done_tx))
                }
                None => (Vec::new(), None),
            };

            let permits = Arc::clone(&self.permits);
            let cancel = cancel.clone();
            let timeout = tool.timeout().unwrap_or(self.default_timeout);
            let call_id = call.id.clone();
            let task = tokio::spawn(async move {
                let output = async {
                    if !predecessors.is_empty() {
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => return cancelled_output(&call.id),
                            _ = join_all(predecessors) => {}
                        }
                    }
                    // The permit is taken after the resource wait so a queued
                    // call cannot hold a slot it is not using yet.
                    let permit = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return cancelled_output(&call.id),
                        permit = permits.acquire_owned() => permit,
                    };
                    let _permit = match permit {
                        Ok(p) => p,
                        // Only possible if the semaphore is closed, which the
                        // dispatcher never does.
                        Err(e) => {
                            return ToolOutput::err(
                                &call.id,
                                ToolErrorKind::ExecutionError,
                                format!("concurrency limiter closed: {e}"),
                            )
                        }
                    };
                    debug!(tool_name = %call.name, call_id = %call.id, "executing tool");
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => cancelled_output(&call.id),
                        result = tokio::time::timeout(timeout, tool.execute(&call, &cancel)) => {
                            match result {
                                Ok(output) => output,
                                Err(_) => ToolOutput::err(
                                    &call.id,
                                    ToolErrorKind::Timeout,
                                    format!("tool '{}' exceeded {}s timeout", call.name, timeout.as_secs()),
                                ),
                            }
                        }
                    }
                }
                .await;
                // Release successors on every exit path, including timeout
                // and cancellation.
                if let Some(tx) = done_tx {
                    let _ = tx.send(());
                }
                output
            });
            tasks.push(Handle::Spawned(task, call_id));
        }

        // Await in call order; completion order does not matter.
        let mut outputs = Vec::with_capacity(tasks.len());
        for handle in tasks {
            match handle {
                Handle::Immediate(out) => outputs.push(out),
                Handle::Spawned(task, call_id) => {
                    let out = match task.await {
                        Ok(out) => out,
                        Err(e) => {
                            warn!(call_id = %call_id, "tool task panicked: {e}");
                            ToolOutput::err(
                                &call_id,
                                ToolErrorKind::ExecutionError,
                                format!("tool execution panicked: {e}"),
                            )
                        }
                    };
                    outputs.push(out);
                }
            }
        }
        outputs
    }
}

enum Handle {
    Immediate(ToolOutput),
    Spawned(tokio::task::JoinHandle<ToolOutput>, String),
}

fn cancelled_output(call_id: &str) -> ToolOutput {
    ToolOutput::err(call_id, ToolErrorKind::Cancelled, "task cancelled")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
