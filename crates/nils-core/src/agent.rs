// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use nils_config::Config;
use nils_model::{
    CompletionRequest, Message, ModelKind, ModelRouter, ResponseEvent, ToolCallRequest,
};
use nils_store::{SessionRecord, SessionStore};
use nils_tools::{Dispatcher, ToolCall, ToolRegistry};

use crate::{
    assemble::assemble,
    compress::smart_truncate,
    events::AgentEvent,
    memory::MemoryIndex,
    prompts::system_prompt,
    session::Session,
    BudgetKind, TaskError,
};

/// Where one task currently stands.  Transitions:
/// `Idle → Thinking → Acting → Observing → (Thinking | Done | Failed | Cancelled)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Idle,
    Thinking,
    Acting,
    Observing,
    Done,
    Failed,
    Cancelled,
}

/// The loop controller.  Owns a session and drives the model ↔ tool loop.
pub struct Agent {
    session: Session,
    router: ModelRouter,
    tools: Arc<ToolRegistry>,
    dispatcher: Dispatcher,
    store: Arc<SessionStore>,
    memory: MemoryIndex,
    config: Arc<Config>,
    config_snapshot: serde_json::Value,
    state: TaskState,
}

impl Agent {
    pub fn new(
        router: ModelRouter,
        tools: Arc<ToolRegistry>,
        dispatcher: Dispatcher,
        store: Arc<SessionStore>,
        config: Arc<Config>,
    ) -> Self {
        let window = router.get(ModelKind::Reasoning).context_window();
        let config_snapshot = serde_json::to_value(&*config).unwrap_or_default();
        Self {
            session: Session::new(window),
            router,
            tools,
            dispatcher,
            store,
            memory: MemoryIndex::new(),
            config,
            config_snapshot,
            state: TaskState::Idle,
        }
    }

    /// Rebuild an agent around a persisted session (resume path).
    pub fn resume(
        record: SessionRecord,
        router: ModelRouter,
        tools: Arc<ToolRegistry>,
        dispatcher: Dispatcher,
        store: Arc<SessionStore>,
        config: Arc<Config>,
    ) -> Self {
        let window = router.get(ModelKind::Reasoning).context_window();
        let config_snapshot = serde_json::to_value(&*config).unwrap_or_default();
        Self {
            session: Session::from_record(record, window),
            router,
            tools,
            dispatcher,
            store,
            memory: MemoryIndex::new(),
            config,
            config_snapshot,
            state: TaskState::Idle,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn memory_mut(&mut self) -> &mut MemoryIndex {
        &mut self.memory
    }

    fn persist(&self) -> Result<(), TaskError> {
        self.store
            .save_session(&self.session.to_record(self.config_snapshot.clone()))?;
        Ok(())
    }

    fn set_state(&mut self, next: TaskState) {
        debug!(session_id = %self.session.id, from = ?self.state, to = ?next, "task state");
        self.state = next;
    }

    /// Drive one task from `user_input` to a terminal state, streaming
    /// incremental output through `tx`.  Returns the final assistant
    /// message, or the error that ended the task.  The session is saved at
    /// every terminal state; failed and cancelled tasks stay resumable.
    pub async fn process_task(
        &mut self,
        user_input: &str,
        tx: mpsc::Sender<AgentEvent>,
        cancel: CancellationToken,
    ) -> Result<Message, TaskError> {
        if cancel.is_cancelled() {
            self.set_state(TaskState::Cancelled);
            let _ = tx
                .send(AgentEvent::Aborted {
                    partial_text: String::new(),
                })
                .await;
            return Err(TaskError::Cancelled);
        }

        let started = Instant::now();
        let mut turns = 0u32;
        let mut cost_tokens = 0u64;

        if self.session.messages.is_empty() {
            let prompt = system_prompt(
                self.config.agent.system_prompt.as_deref(),
                &self.session.context,
            );
            self.session.push(Message::system(prompt));
        }
        self.session.push(Message::user(user_input));
        self.persist()?;

        loop {
            self.set_state(TaskState::Thinking);

            let assembled = match assemble(
                &mut self.session,
                &self.store,
                self.router.get(ModelKind::Basic),
                &self.memory,
                &self.config.agent,
                &self.config_snapshot,
            )
            .await
            {
                Ok(a) => a,
                Err(e) => return self.fail(e).await,
            };
            if let Some((tokens_before, tokens_after, summary, backup_id)) = &assembled.compressed
            {
                let _ = tx
                    .send(AgentEvent::ContextCompressed {
                        tokens_before: *tokens_before,
                        tokens_after: *tokens_after,
                        summary: *summary,
                        backup_id: backup_id.clone(),
                    })
                    .await;
            }
            if let Some(score) = assembled.memory_score {
                let _ = tx.send(AgentEvent::MemoryInjected { score }).await;
            }

            let turn = match self
                .stream_one_turn(assembled.request, &tx, &cancel, &mut cost_tokens)
                .await
            {
                Ok(t) => t,
                Err(e) => return self.fail(e).await,
            };

            let (text, calls) = match turn {
                TurnResult::Cancelled { partial } => return self.abort(partial, &tx).await,
                TurnResult::Completed { text, calls } => (text, calls),
            };

            // Termination: a tool-call-free assistant message ends the task.
            // A `think` call is still a call; the loop keeps going.
            if calls.is_empty() {
                let assistant = Message::assistant(text);
                self.session.push(assistant.clone());
                self.set_state(TaskState::Done);
                self.persist()?;
                // Completed answers feed the retrieval index for later tasks.
                if !assistant.content.is_empty() {
                    self.memory.insert(assistant.content.clone());
                }
                let _ = tx.send(AgentEvent::TurnComplete).await;
                return Ok(assistant);
            }

            self.session
                .push(Message::assistant_with_calls(text, calls.clone()));

            self.set_state(TaskState::Acting);
            let tool_calls: Vec<ToolCall> = calls
                .iter()
                .map(|c| ToolCall {
                    id: c.id.clone(),
                    name: c.name.clone(),
                    args: c.args.clone(),
                })
                .collect();
            for tc in &tool_calls {
                let _ = tx.send(AgentEvent::ToolCallStarted(tc.clone())).await;
            }
            let outputs = self.dispatcher.dispatch(&tool_calls, &cancel).await;

            // Results enter the log in call order, whatever the completion
            // order was, with content-aware truncation applied first.
            self.set_state(TaskState::Observing);
            let cap = self.config.agent.tool_result_token_cap;
            for (tc, output) in tool_calls.iter().zip(outputs.iter()) {
                let category = self.tools.output_category(&tc.name);
                let content = smart_truncate(&output.content, category, cap);
                let mut msg = Message::tool_result(&tc.id, content)
                    .with_meta("origin_tool", tc.name.clone());
                if let Some(kind) = output.error {
                    msg = msg.with_meta("error_kind", kind.to_string());
                }
                self.session.push(msg);
                let _ = tx
                    .send(AgentEvent::ToolCallFinished {
                        call_id: tc.id.clone(),
                        tool_name: tc.name.clone(),
                        output: output.content.clone(),
                        is_error: output.is_error(),
                    })
                    .await;
            }
            self.persist()?;

            if cancel.is_cancelled() {
                return self.abort(String::new(), &tx).await;
            }

            // Budget gate, after tool results are in the log so nothing is
            // lost when a budget ends the task.
            turns += 1;
            if turns >= self.config.agent.max_turns {
                return self
                    .fail(TaskError::BudgetExhausted {
                        kind: BudgetKind::Turns,
                        turns,
                    })
                    .await;
            }
            let timeout = self.config.agent.task_timeout_secs;
            if timeout > 0 && started.elapsed().as_secs() >= timeout {
                return self
                    .fail(TaskError::BudgetExhausted {
                        kind: BudgetKind::WallClock,
                        turns,
                    })
                    .await;
            }
            let ceiling = self.config.agent.max_cost_tokens;
            if ceiling > 0 && cost_tokens >= ceiling {
                return self
                    .fail(TaskError::BudgetExhausted {
                        kind: BudgetKind::Cost,
                        turns,
                    })
                    .await;
            }
        }
    }

    async fn fail(&mut self, err: TaskError) -> Result<Message, TaskError> {
        self.set_state(TaskState::Failed);
        // Best effort: the log is consistent at every failure point and a
        // failed task must stay resumable.
        if let Err(save_err) = self.persist() {
            warn!(session_id = %self.session.id, error = %save_err, "failed to save session during task failure");
        }
        Err(err)
    }

    async fn abort(
        &mut self,
        partial_text: String,
        tx: &mpsc::Sender<AgentEvent>,
    ) -> Result<Message, TaskError> {
        self.set_state(TaskState::Cancelled);
        if !partial_text.is_empty() {
            self.session.push(
                Message::assistant(partial_text.clone()).with_meta("cancelled", true),
            );
        }
        if let Err(save_err) = self.persist() {
            warn!(session_id = %self.session.id, error = %save_err, "failed to save session during abort");
        }
        let _ = tx.send(AgentEvent::Aborted { partial_text }).await;
        Err(TaskError::Cancelled)
    }

    /// Call the model once, streaming deltas and collecting tool-call
    /// fragments until the stream finishes or the task is cancelled.
    async fn stream_one_turn(
        &mut self,
        request: Vec<Message>,
        tx: &mpsc::Sender<AgentEvent>,
        cancel: &CancellationToken,
        cost_tokens: &mut u64,
    ) -> Result<TurnResult, TaskError> {
        let tools: Vec<nils_model::ToolSchema> = self
            .tools
            .schemas()
            .into_iter()
            .map(|s| nils_model::ToolSchema {
                name: s.name,
                description: s.description,
                parameters: s.parameters,
            })
            .collect();

        let req = CompletionRequest {
            messages: request,
            tools,
            stream: true,
            temperature: None,
            max_tokens: None,
        };

        let model = self.router.get(ModelKind::Reasoning).clone();
        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Ok(TurnResult::Cancelled { partial: String::new() })
            }
            result = model.complete(req) => result?,
        };

        let mut full_text = String::new();
        // Keyed by the parallel-tool-call index from the provider: fragments
        // for different calls interleave by index.
        let mut pending: HashMap<u32, PendingToolCall> = HashMap::new();

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Ok(TurnResult::Cancelled { partial: full_text })
                }
                ev = stream.next() => ev,
            };
            let Some(event) = event else { break };
            match event? {
                ResponseEvent::TextDelta(delta) if !delta.is_empty() => {
                    full_text.push_str(&delta);
                    let _ = tx.send(AgentEvent::TextDelta(delta)).await;
                }
                ResponseEvent::ThinkingDelta(delta) => {
                    let _ = tx.send(AgentEvent::ThinkingDelta(delta)).await;
                }
                ResponseEvent::ToolCallDelta {
                    index,
                    id,
                    name,
                    arguments,
                } => {
                    let ptc = pending.entry(index).or_insert_with(PendingToolCall::default);
                    if !id.is_empty() {
                        ptc.id = id;
                    }
                    if !name.is_empty() {
                        ptc.name = name;
                    }
                    ptc.args_buf.push_str(&arguments);
                }
                ResponseEvent::MaxTokens => {
                    warn!("model hit its output token limit; pending tool calls may be truncated");
                }
                ResponseEvent::Usage {
                    input_tokens,
                    output_tokens,
                    cache_read_tokens,
                    cache_write_tokens,
                } => {
                    *cost_tokens += u64::from(input_tokens) + u64::from(output_tokens);
                    let _ = tx
                        .send(AgentEvent::TokenUsage {
                            input: input_tokens,
                            output: output_tokens,
                            cache_read: cache_read_tokens,
                            cache_write: cache_write_tokens,
                            task_total: *cost_tokens,
                        })
                        .await;
                }
                ResponseEvent::Done => break,
                ResponseEvent::Error(e) => {
                    warn!("model stream error: {e}");
                    let _ = tx.send(AgentEvent::Error(e)).await;
                }
                ResponseEvent::TextDelta(_) => {}
            }
        }

        // Flush accumulated tool calls ordered by provider index.  Calls
        // with an empty name cannot be dispatched and are dropped; storing
        // them would corrupt the history sent back on the next turn.  An
        // empty id gets a synthetic fallback so pairing still works.
        let mut pending_sorted: Vec<(u32, PendingToolCall)> = pending.into_iter().collect();
        pending_sorted.sort_by_key(|(idx, _)| *idx);
        let mut calls = Vec::with_capacity(pending_sorted.len());
        for (i, (_, ptc)) in pending_sorted.into_iter().enumerate() {
            if ptc.name.is_empty() {
                warn!(tool_call_id = %ptc.id, "dropping tool call with empty name from model");
                continue;
            }
            let mut call = ptc.finish();
            if call.id.is_empty() {
                call.id = format!("tc_synthetic_{i}");
                warn!(
                    tool_name = %call.name,
                    tool_call_id = %call.id,
                    "tool call from model had empty id; generated synthetic id"
                );
            }
            calls.push(call);
        }

        if !full_text.is_empty() {
            let _ = tx.send(AgentEvent::TextComplete(full_text.clone())).await;
        }

        Ok(TurnResult::Completed {
            text: full_text,
            calls,
        })
    }
}

enum TurnResult {
    Completed {
        text: String,
        calls: Vec<ToolCallRequest>,
    },
    Cancelled {
        partial: String,
    },
}

#[derive(Default)]
struct PendingToolCall {
    id: String,
    name: String,
    args_buf: String,
}

impl PendingToolCall {
    fn finish(self) -> ToolCallRequest {
        // Always resolve to a JSON object: providers reject null tool-call
        // input on the next request.
        let args = if self.args_buf.is_empty() {
            warn!(
                tool_name = %self.name,
                tool_call_id = %self.id,
                "model sent tool call with empty arguments; substituting {{}}"
            );
            serde_json::Value::Object(Default::default())
        } else {
            match serde_json::from_str(&self.args_buf) {
                Ok(v) => v,
                Err(parse_err) => match attempt_json_repair(&self.args_buf) {
                    Some(v) => {
                        warn!(
                            tool_name = %self.name,
                            tool_call_id = %self.id,
                            "repaired invalid JSON arguments from model"
                        );
                        v
                    }
                    None => {
                        warn!(
                            tool_name = %self.name,
                            tool_call_id = %self.id,
                            args_buf = %self.args_buf,
                            error = %parse_err,
                            "model sent tool call with invalid JSON arguments; substituting {{}}"
                        );
                        serde_json::Value::Object(Default::default())
                    }
                },
            }
        };
        ToolCallRequest {
            id: self.id,
            name: self.name,
            args,
        }
    }
}

/// Attempt to repair common JSON syntax errors in streamed tool arguments:
/// invalid escape sequences inside strings, and truncated objects missing
/// their closing quote or brace.
fn attempt_json_repair(json_str: &str) -> Option<serde_json::Value> {
    let fixed = fix_invalid_json_escapes(json_str);
    if let Ok(v) = serde_json::from_str::<serde_json::Value>(&fixed) {
        return Some(v);
    }

    if !fixed.trim().ends_with('}') {
        let mut completed = fixed.clone();
        let quote_count = fixed.chars().filter(|&c| c == '"').count();
        if quote_count % 2 == 1 {
            completed.push('"');
        }
        if !completed.trim().ends_with('}') {
            completed.push('}');
        }
        if let Ok(v) = serde_json::from_str::<serde_json::Value>(&completed) {
            return Some(v);
        }
    }

    None
}

/// Walk through a JSON string and replace any invalid escape sequences inside
/// string values with a properly escaped backslash.
///
/// Valid JSON escape characters are: `"`, `\`, `/`, `b`, `f`, `n`, `r`, `t`, `u`.
/// Anything else (e.g. `\c`, `\p`, `\(`) is turned into `\\X` so the
/// resulting JSON round-trips through serde_json without a parse error.
fn fix_invalid_json_escapes(json_str: &str) -> String {
    let mut result = String::with_capacity(json_str.len() + 16);
    let mut chars = json_str.chars();
    let mut in_string = false;

    while let Some(c) = chars.next() {
        if in_string {
            match c {
                '\\' => match chars.next() {
                    Some(next)
                        if matches!(next, '"' | '\\' | '/' | 'b' | 'f' | 'n' | 'r' | 't' | 'u') =>
                    {
                        result.push('\\');
                        result.push(next);
                    }
                    Some(next) => {
                        result.push('\\');
                        result.push('\\');
                        result.push(next);
                    }
                    None => result.push('\\'),
                },
                '"' => {
                    in_string = false;
                    result.push('"');
                }
                _ => result.push(c),
            }
        } else {
            if c == '"' {
                in_string = true;
            }
            result.push(c);
        }
    }
    result
}

// ─── Unit tests (free functions; loop scenarios live in tests.rs) ─────────────
