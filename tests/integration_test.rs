// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! End-to-end tests through the public runtime surface, using the mock
//! model provider so no network access is needed.
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use nils_config::{Config, ModelConfig, ModelsConfig, StoreConfig};
use nils_core::{AgentEvent, Runtime};
use nils_model::Role;

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

#[tokio::test]
async fn run_one_task_against_mock_provider() {
    let dir = TempDir::new().unwrap();
    let runtime = Runtime::new(mock_config(&dir)).unwrap();
    let mut agent = runtime.start_session();
    let (tx, mut rx) = mpsc::channel(64);

    let result = agent
        .process_task("hello", tx, CancellationToken::new())
        .await
        .unwrap();
    assert!(result.content.contains("MOCK"));

    let mut got_text = false;
    while let Ok(event) = rx.try_recv() {
        if let AgentEvent::TextDelta(t) = event {
            assert!(t.contains("MOCK"));
            got_text = true;
        }
    }
    assert!(got_text, "expected at least one TextDelta event");
    runtime.shutdown().await;
}

#[tokio::test]
async fn completed_session_can_be_resumed_and_continued() {
    let dir = TempDir::new().unwrap();
    let runtime = Runtime::new(mock_config(&dir)).unwrap();

    let session_id = {
        let mut agent = runtime.start_session();
        let (tx, _rx) = mpsc::channel(64);
        agent
            .process_task("first task", tx, CancellationToken::new())
            .await
            .unwrap();
        agent.session().id.clone()
    };

    // A fresh runtime over the same store resumes the session by id.
    let runtime2 = Runtime::new(mock_config(&dir)).unwrap();
    let mut resumed = runtime2.resume_session(&session_id).unwrap();
    assert_eq!(resumed.session().messages.len(), 3);
    assert_eq!(resumed.session().messages[0].role, Role::System);

    let (tx, _rx) = mpsc::channel(64);
    resumed
        .process_task("second task", tx, CancellationToken::new())
        .await
        .unwrap();
    // [system, user, assistant] + [user, assistant]
    assert_eq!(resumed.session().messages.len(), 5);
    assert!(nils_model::validate(&resumed.session().messages).is_ok());
}

#[tokio::test]
async fn sessions_are_listed_after_save() {
    let dir = TempDir::new().unwrap();
    let runtime = Runtime::new(mock_config(&dir)).unwrap();
    let mut agent = runtime.start_session();
    let (tx, _rx) = mpsc::channel(64);
    agent
        .process_task("list me", tx, CancellationToken::new())
        .await
        .unwrap();

    let ids = runtime.store().list_sessions().unwrap();
    assert!(ids.contains(&agent.session().id));
}
