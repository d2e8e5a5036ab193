// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Loop controller scenarios.
//!
//! Uses ScriptedMockProvider and in-memory test tools so every scenario is
//! deterministic and requires no network access.
#[cfg(test)]
mod loop_tests {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::{json, Value};
    use tempfile::TempDir;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use nils_config::Config;
    use nils_model::{
        validate, ModelRouter, ResponseEvent, Role, ScriptedMockProvider,
    };
    use nils_store::SessionStore;
    use nils_tools::{
        builtin::ThinkTool, Dispatcher, OutputCategory, PatternPolicy, Tool, ToolCall,
        ToolErrorKind, ToolOutput, ToolRegistry,
    };

    use crate::{Agent, AgentEvent, BudgetKind, TaskError, TaskState};

    // ── Test tools ────────────────────────────────────────────────────────────

    /// Shared fake filesystem for the fs-flavoured test tools.
    type FakeFs = Arc<Mutex<HashMap<String, String>>>;

    struct FileListTool;

    #[async_trait]
    impl Tool for FileListTool {
        fn name(&self) -> &str {
            "file_list"
        }
        fn description(&self) -> &str {
            "list files in a directory"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object", "required": ["path"], "properties": {"path": {"type": "string"}}})
        }
        fn output_category(&self) -> OutputCategory {
            OutputCategory::MatchList
        }
        async fn execute(&self, call: &ToolCall, _cancel: &CancellationToken) -> ToolOutput {
            ToolOutput::ok(&call.id, "a.txt\nb.txt\nc.txt")
        }
    }

    struct FileReadTool {
        fs: FakeFs,
        delay_ms: u64,
    }

    #[async_trait]
    impl Tool for FileReadTool {
        fn name(&self) -> &str {
            "file_read"
        }
        fn description(&self) -> &str {
            "read a file"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object", "required": ["path"], "properties": {"path": {"type": "string"}}})
        }
        fn resource_key(&self, args: &Value) -> Option<String> {
            args["path"].as_str().map(String::from)
        }
        fn output_category(&self) -> OutputCategory {
            OutputCategory::FileContent
        }
        async fn execute(&self, call: &ToolCall, _cancel: &CancellationToken) -> ToolOutput {
            if self.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            }
            let path = call.args["path"].as_str().unwrap_or_default();
            match self.fs.lock().unwrap().get(path) {
                Some(content) => ToolOutput::ok(&call.id, content.clone()),
                None => ToolOutput::err(
                    &call.id,
                    ToolErrorKind::ExecutionError,
                    format!("{path}: not found"),
                ),
            }
        }
    }

    /// Fake shell: `rm <path>` deletes from the fake fs.  Mutating, keyed on
    /// the path it touches.
    struct BashTool {
        fs: FakeFs,
        delay_ms: u64,
    }

    #[async_trait]
    impl Tool for BashTool {
        fn name(&self) -> &str {
            "bash"
        }
        fn description(&self) -> &str {
            "run a shell command"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object", "required": ["command"], "properties": {"command": {"type": "string"}}})
        }
        fn is_mutating(&self) -> bool {
            true
        }
        fn resource_key(&self, args: &Value) -> Option<String> {
            args["command"]
                .as_str()
                .and_then(|c| c.split_whitespace().last())
                .map(String::from)
        }
        fn output_category(&self) -> OutputCategory {
            OutputCategory::HeadTail
        }
        async fn execute(&self, call: &ToolCall, _cancel: &CancellationToken) -> ToolOutput {
            if self.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            }
            let command = call.args["command"].as_str().unwrap_or_default();
            if let Some(path) = command.strip_prefix("rm ") {
                self.fs.lock().unwrap().remove(path.trim());
                ToolOutput::ok(&call.id, "")
            } else {
                ToolOutput::ok(&call.id, format!("ran: {command}"))
            }
        }
    }

    // ── Harness ───────────────────────────────────────────────────────────────

    struct Harness {
        agent: Agent,
        store: Arc<SessionStore>,
        _dir: TempDir,
    }

    fn harness(model: ScriptedMockProvider, registry: ToolRegistry, config: Config) -> Harness {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(SessionStore::open(Some(dir.path().to_path_buf())).unwrap());
        let registry = Arc::new(registry);
        let dispatcher = Dispatcher::new(
            Arc::clone(&registry),
            Arc::new(PatternPolicy::allow_all()),
            config.tools.max_concurrent,
            Duration::from_secs(config.tools.timeout_secs),
        );
        let router = ModelRouter::new(Arc::new(model), None);
        let agent = Agent::new(
            router,
            registry,
            dispatcher,
            Arc::clone(&store),
            Arc::new(config),
        );
        Harness {
            agent,
            store,
            _dir: dir,
        }
    }

    fn default_harness(model: ScriptedMockProvider) -> Harness {
        harness(model, ToolRegistry::default(), Config::default())
    }

    /// Drain the channel until TurnComplete / Aborted or channel close.
    async fn collect_events(mut rx: mpsc::Receiver<AgentEvent>) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        while let Some(ev) = rx.recv().await {
            let done = matches!(ev, AgentEvent::TurnComplete | AgentEvent::Aborted { .. });
            events.push(ev);
            if done {
                break;
            }
        }
        events
    }

    fn tool_call_script(id: &str, name: &str, args: &str) -> Vec<ResponseEvent> {
        vec![
            ResponseEvent::ToolCallDelta {
                index: 0,
                id: id.into(),
                name: name.into(),
                arguments: args.into(),
            },
            ResponseEvent::Done,
        ]
    }

    fn text_script(text: &str) -> Vec<ResponseEvent> {
        vec![ResponseEvent::TextDelta(text.into()), ResponseEvent::Done]
    }

    // ── Scenario 1: simple echo ───────────────────────────────────────────────

    #[tokio::test]
    async fn simple_echo_terminates_after_one_inference() {
        let model = ScriptedMockProvider::always_text("2+2 equals 4");
        let mut h = default_harness(model);
        let (tx, rx) = mpsc::channel(64);

        let result = h
            .agent
            .process_task("What is 2+2?", tx, CancellationToken::new())
            .await
            .unwrap();
        let events = collect_events(rx).await;

        assert_eq!(result.content, "2+2 equals 4");
        let msgs = &h.agent.session().messages;
        assert_eq!(msgs.len(), 3, "log must be [system, user, assistant]");
        assert_eq!(msgs[0].role, Role::System);
        assert_eq!(msgs[1].role, Role::User);
        assert_eq!(msgs[2].role, Role::Assistant);
        assert_eq!(h.agent.state(), TaskState::Done);
        assert!(events.iter().any(|e| matches!(e, AgentEvent::TextDelta(_))));
        assert!(events.iter().any(|e| matches!(e, AgentEvent::TurnComplete)));
        // No compression, therefore no backup.
        assert!(h
            .store
            .list_backups(&h.agent.session().id)
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn session_is_saved_at_completion() {
        let model = ScriptedMockProvider::always_text("saved");
        let mut h = default_harness(model);
        let (tx, _rx) = mpsc::channel(64);
        h.agent
            .process_task("persist me", tx, CancellationToken::new())
            .await
            .unwrap();
        let loaded = h.store.load_session(&h.agent.session().id).unwrap();
        assert_eq!(loaded.messages.len(), 3);
    }

    // ── Scenario 2: single tool round-trip ────────────────────────────────────

    #[tokio::test]
    async fn single_tool_round_trip() {
        let model = ScriptedMockProvider::new(vec![
            tool_call_script("a1", "file_list", r#"{"path": "/tmp"}"#),
            text_script("the directory holds a.txt, b.txt and c.txt"),
        ]);
        let mut reg = ToolRegistry::new();
        reg.register(FileListTool);
        let mut h = harness(model, reg, Config::default());
        let (tx, rx) = mpsc::channel(64);

        let result = h
            .agent
            .process_task("List files in /tmp", tx, CancellationToken::new())
            .await
            .unwrap();
        let events = collect_events(rx).await;

        assert!(result.content.contains("a.txt"));
        let msgs = &h.agent.session().messages;
        // [system, user, assistant+call, tool, assistant]
        assert_eq!(msgs.len(), 5);
        assert!(validate(msgs).is_ok());
        let paired: Vec<_> = msgs
            .iter()
            .filter(|m| m.tool_call_id.as_deref() == Some("a1"))
            .collect();
        assert_eq!(paired.len(), 1, "id a1 paired exactly once");
        assert!(paired[0].content.contains("a.txt"));
        assert_eq!(paired[0].meta_str("origin_tool"), Some("file_list"));

        assert!(events
            .iter()
            .any(|e| matches!(e, AgentEvent::ToolCallStarted(tc) if tc.name == "file_list")));
        assert!(events.iter().any(
            |e| matches!(e, AgentEvent::ToolCallFinished { call_id, is_error, .. }
                if call_id == "a1" && !is_error)
        ));
    }

    // ── Scenario 3: parallel reads keep call order ────────────────────────────

    #[tokio::test]
    async fn parallel_reads_append_results_in_call_order() {
        let fs: FakeFs = Arc::new(Mutex::new(HashMap::from([
            ("/a".to_string(), "alpha".to_string()),
            ("/b".to_string(), "beta".to_string()),
            ("/c".to_string(), "gamma".to_string()),
        ])));
        // Three reads on distinct paths run in parallel; the log order must
        // still be a1, a2, a3 whatever order they finish in.
        let model = ScriptedMockProvider::new(vec![
            vec![
                ResponseEvent::ToolCallDelta {
                    index: 0,
                    id: "a1".into(),
                    name: "file_read".into(),
                    arguments: r#"{"path": "/a"}"#.into(),
                },
                ResponseEvent::ToolCallDelta {
                    index: 1,
                    id: "a2".into(),
                    name: "file_read".into(),
                    arguments: r#"{"path": "/b"}"#.into(),
                },
                ResponseEvent::ToolCallDelta {
                    index: 2,
                    id: "a3".into(),
                    name: "file_read".into(),
                    arguments: r#"{"path": "/c"}"#.into(),
                },
                ResponseEvent::Done,
            ],
            text_script("read all three"),
        ]);
        let mut reg = ToolRegistry::new();
        reg.register(FileReadTool { fs, delay_ms: 30 });
        let mut h = harness(model, reg, Config::default());
        let (tx, _rx) = mpsc::channel(64);

        h.agent
            .process_task("read a, b and c", tx, CancellationToken::new())
            .await
            .unwrap();

        let msgs = &h.agent.session().messages;
        let tool_ids: Vec<&str> = msgs
            .iter()
            .filter(|m| m.role == Role::Tool)
            .filter_map(|m| m.tool_call_id.as_deref())
            .collect();
        assert_eq!(tool_ids, vec!["a1", "a2", "a3"]);
        assert!(validate(msgs).is_ok());
    }

    // ── Scenario 4: mutation serialized against read on the same resource ─────

    #[tokio::test]
    async fn bash_rm_then_read_same_path_serializes_and_read_fails() {
        let fs: FakeFs = Arc::new(Mutex::new(HashMap::from([(
            "/tmp/x".to_string(),
            "doomed".to_string(),
        )])));
        let model = ScriptedMockProvider::new(vec![
            vec![
                ResponseEvent::ToolCallDelta {
                    index: 0,
                    id: "b1".into(),
                    name: "bash".into(),
                    arguments: r#"{"command": "rm /tmp/x"}"#.into(),
                },
                ResponseEvent::ToolCallDelta {
                    index: 1,
                    id: "r1".into(),
                    name: "file_read".into(),
                    arguments: r#"{"path": "/tmp/x"}"#.into(),
                },
                ResponseEvent::Done,
            ],
            text_script("the file is gone"),
        ]);
        let mut reg = ToolRegistry::new();
        reg.register(BashTool {
            fs: Arc::clone(&fs),
            delay_ms: 30,
        });
        reg.register(FileReadTool { fs, delay_ms: 0 });
        let mut h = harness(model, reg, Config::default());
        let (tx, _rx) = mpsc::channel(64);

        let result = h
            .agent
            .process_task("delete /tmp/x then read it", tx, CancellationToken::new())
            .await
            .unwrap();

        // The read waited for the rm, so it observed the deletion.
        let msgs = &h.agent.session().messages;
        let read_reply = msgs
            .iter()
            .find(|m| m.tool_call_id.as_deref() == Some("r1"))
            .unwrap();
        assert!(read_reply.content.contains("not found"));
        assert_eq!(read_reply.meta_str("error_kind"), Some("execution_error"));
        // The loop continued past the tool error.
        assert_eq!(result.content, "the file is gone");
        assert!(validate(msgs).is_ok());
    }

    // ── Tool errors feed back, loop continues ─────────────────────────────────

    #[tokio::test]
    async fn unknown_tool_error_fed_back_to_model() {
        let model = ScriptedMockProvider::new(vec![
            tool_call_script("u1", "no_such_tool", "{}"),
            text_script("recovered"),
        ]);
        let mut h = default_harness(model);
        let (tx, _rx) = mpsc::channel(64);

        let result = h
            .agent
            .process_task("use a ghost tool", tx, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.content, "recovered");
        let reply = h
            .agent
            .session()
            .messages
            .iter()
            .find(|m| m.tool_call_id.as_deref() == Some("u1"))
            .unwrap();
        assert_eq!(reply.meta_str("error_kind"), Some("unknown_tool"));
    }

    // ── think tool does not terminate ─────────────────────────────────────────

    #[tokio::test]
    async fn think_call_continues_the_loop() {
        let model = ScriptedMockProvider::new(vec![
            tool_call_script("t1", "think", r#"{"thought": "inspect the parser first"}"#),
            text_script("final answer after thinking"),
        ]);
        let mut reg = ToolRegistry::new();
        reg.register(ThinkTool);
        let mut h = harness(model, reg, Config::default());
        let (tx, _rx) = mpsc::channel(64);

        let result = h
            .agent
            .process_task("solve it", tx, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.content, "final answer after thinking");
        let msgs = &h.agent.session().messages;
        assert!(msgs.iter().any(|m| m.tool_call_id.as_deref() == Some("t1")));
        assert!(validate(msgs).is_ok());
    }

    // ── Budgets ───────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn max_turns_one_with_tool_call_exhausts_budget() {
        let model = ScriptedMockProvider::new(vec![tool_call_script(
            "a1",
            "file_list",
            r#"{"path": "/"}"#,
        )]);
        let mut reg = ToolRegistry::new();
        reg.register(FileListTool);
        let mut config = Config::default();
        config.agent.max_turns = 1;
        let mut h = harness(model, reg, config);
        let (tx, _rx) = mpsc::channel(64);

        let err = h
            .agent
            .process_task("list", tx, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TaskError::BudgetExhausted {
                kind: BudgetKind::Turns,
                turns: 1
            }
        ));
        assert_eq!(h.agent.state(), TaskState::Failed);
        // The log stays valid: the call and its reply are both recorded.
        let msgs = &h.agent.session().messages;
        assert!(validate(msgs).is_ok());
        assert!(msgs.iter().any(|m| m.tool_call_id.as_deref() == Some("a1")));
        // And the failed session was saved for resume.
        assert!(h.store.load_session(&h.agent.session().id).is_ok());
    }

    #[tokio::test]
    async fn cost_ceiling_ends_the_task() {
        let model = ScriptedMockProvider::new(vec![
            vec![
                ResponseEvent::ToolCallDelta {
                    index: 0,
                    id: "a1".into(),
                    name: "file_list".into(),
                    arguments: r#"{"path": "/"}"#.into(),
                },
                ResponseEvent::Usage {
                    input_tokens: 900,
                    output_tokens: 200,
                    cache_read_tokens: 0,
                    cache_write_tokens: 0,
                },
                ResponseEvent::Done,
            ],
            text_script("never reached"),
        ]);
        let mut reg = ToolRegistry::new();
        reg.register(FileListTool);
        let mut config = Config::default();
        config.agent.max_cost_tokens = 1000;
        let mut h = harness(model, reg, config);
        let (tx, _rx) = mpsc::channel(64);

        let err = h
            .agent
            .process_task("list", tx, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TaskError::BudgetExhausted {
                kind: BudgetKind::Cost,
                ..
            }
        ));
    }

    // ── Cancellation ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn pre_cancelled_task_aborts_without_touching_history() {
        let model = ScriptedMockProvider::always_text("never");
        let mut h = default_harness(model);
        let (tx, rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = h.agent.process_task("hi", tx, cancel).await.unwrap_err();
        assert!(matches!(err, TaskError::Cancelled));
        assert!(h.agent.session().messages.is_empty());
        let events = collect_events(rx).await;
        assert!(events
            .iter()
            .any(|e| matches!(e, AgentEvent::Aborted { partial_text } if partial_text.is_empty())));
    }

    #[tokio::test]
    async fn cancel_after_tool_started_leaves_session_resumable() {
        /// A tool that blocks until cancelled.
        struct BlockingTool;
        #[async_trait]
        impl Tool for BlockingTool {
            fn name(&self) -> &str {
                "blocker"
            }
            fn description(&self) -> &str {
                "blocks until cancelled"
            }
            fn parameters_schema(&self) -> Value {
                json!({"type": "object"})
            }
            async fn execute(&self, call: &ToolCall, cancel: &CancellationToken) -> ToolOutput {
                cancel.cancelled().await;
                ToolOutput::err(&call.id, ToolErrorKind::Cancelled, "interrupted")
            }
        }

        let model = ScriptedMockProvider::new(vec![tool_call_script("b1", "blocker", "{}")]);
        let mut reg = ToolRegistry::new();
        reg.register(BlockingTool);
        let mut h = harness(model, reg, Config::default());
        let (tx, rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });

        let err = h
            .agent
            .process_task("block forever", tx, cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::Cancelled));
        assert_eq!(h.agent.state(), TaskState::Cancelled);

        // Invariants hold: the call has a (cancelled) reply in the log.
        let msgs = &h.agent.session().messages;
        assert!(validate(msgs).is_ok());
        let reply = msgs
            .iter()
            .find(|m| m.tool_call_id.as_deref() == Some("b1"))
            .unwrap();
        assert_eq!(reply.meta_str("error_kind"), Some("cancelled"));

        // Resumable: the saved record parses and matches the in-memory log.
        let saved = h.store.load_session(&h.agent.session().id).unwrap();
        assert_eq!(saved.messages.len(), msgs.len());

        let events = collect_events(rx).await;
        assert!(events
            .iter()
            .any(|e| matches!(e, AgentEvent::Aborted { .. })));
    }

    // ── Scenario 5: compression cycle inside a task ───────────────────────────

    #[tokio::test]
    async fn oversized_history_is_compressed_with_backup_before_inference() {
        // Script order: the compression summary is requested first (basic
        // model), then the actual inference runs.
        let model = ScriptedMockProvider::new(vec![
            text_script("summary of the long prior conversation"),
            text_script("final reply"),
        ]);
        let mut h = default_harness(model);

        // Seed a long history: system + 12 turns = 25 messages ≥ threshold.
        h.agent.session_mut().push(nils_model::Message::system("seed system prompt"));
        for i in 0..12 {
            h.agent
                .session_mut()
                .push(nils_model::Message::user(format!("old question {i}")));
            h.agent
                .session_mut()
                .push(nils_model::Message::assistant(format!("old answer {i}")));
        }
        let original_len = h.agent.session().messages.len();
        let (tx, rx) = mpsc::channel(64);

        let result = h
            .agent
            .process_task("and now?", tx, CancellationToken::new())
            .await
            .unwrap();
        let events = collect_events(rx).await;

        assert_eq!(result.content, "final reply");
        let compressed = events.iter().find_map(|e| match e {
            AgentEvent::ContextCompressed {
                tokens_before,
                tokens_after,
                backup_id,
                ..
            } => Some((*tokens_before, *tokens_after, backup_id.clone())),
            _ => None,
        });
        let (before, after, backup_id) = compressed.expect("compression event expected");
        assert!(after <= before);

        let msgs = &h.agent.session().messages;
        assert!(validate(msgs).is_ok());
        assert!(msgs.len() < original_len);
        assert!(msgs
            .iter()
            .any(|m| m.meta_str("type") == Some("comprehensive_ai_summary")));

        // Exactly one backup; restoring it returns the pre-compression log
        // (plus the user message appended before assembly ran).
        let backups = h.store.list_backups(&h.agent.session().id).unwrap();
        assert_eq!(backups.len(), 1);
        assert_eq!(backups[0].id, backup_id);
        assert_eq!(backups[0].messages.len(), original_len + 1);
    }

    // ── Tool result truncation ────────────────────────────────────────────────

    #[tokio::test]
    async fn oversized_tool_result_is_truncated_before_entering_log() {
        struct VerboseTool;
        #[async_trait]
        impl Tool for VerboseTool {
            fn name(&self) -> &str {
                "verbose"
            }
            fn description(&self) -> &str {
                "produces a huge output"
            }
            fn parameters_schema(&self) -> Value {
                json!({"type": "object"})
            }
            async fn execute(&self, call: &ToolCall, _cancel: &CancellationToken) -> ToolOutput {
                let big: String = (0..20_000)
                    .map(|i| format!("line {i}\n"))
                    .collect();
                ToolOutput::ok(&call.id, big)
            }
        }
        let model = ScriptedMockProvider::new(vec![
            tool_call_script("v1", "verbose", "{}"),
            text_script("ok"),
        ]);
        let mut reg = ToolRegistry::new();
        reg.register(VerboseTool);
        let mut config = Config::default();
        config.agent.tool_result_token_cap = 100;
        let mut h = harness(model, reg, config);
        let (tx, _rx) = mpsc::channel(64);

        h.agent
            .process_task("spam me", tx, CancellationToken::new())
            .await
            .unwrap();
        let reply = h
            .agent
            .session()
            .messages
            .iter()
            .find(|m| m.tool_call_id.as_deref() == Some("v1"))
            .unwrap();
        assert!(reply.content.len() < 2000);
        assert!(reply.content.contains("omitted"));
    }

    // ── Transport failure surfaces after retries ──────────────────────────────

    #[tokio::test]
    async fn model_failure_fails_the_task_but_keeps_the_log() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(SessionStore::open(Some(dir.path().to_path_buf())).unwrap());
        let registry = Arc::new(ToolRegistry::default());
        let dispatcher = Dispatcher::new(
            Arc::clone(&registry),
            Arc::new(PatternPolicy::allow_all()),
            10,
            Duration::from_secs(5),
        );
        let router = ModelRouter::new(Arc::new(nils_model::FailingProvider), None);
        let mut agent = Agent::new(
            router,
            registry,
            dispatcher,
            Arc::clone(&store),
            Arc::new(Config::default()),
        );
        let (tx, _rx) = mpsc::channel(64);

        let err = agent
            .process_task("hello", tx, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::Model(_)));
        assert_eq!(agent.state(), TaskState::Failed);
        // System + user made it into the saved log before the failure.
        let saved = store.load_session(&agent.session().id).unwrap();
        assert_eq!(saved.messages.len(), 2);
    }
}
