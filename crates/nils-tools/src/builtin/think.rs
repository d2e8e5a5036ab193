// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::{Tool, ToolCall, ToolOutput};

/// Scratch-reasoning tool.
///
/// Gives the model a place to write down intermediate reasoning without
/// producing user-visible output.  A `think` call never ends the task;
/// the loop keeps iterating until a tool-call-free assistant message
/// appears.
#[derive(Default)]
pub struct ThinkTool;

#[async_trait]
impl Tool for ThinkTool {
    fn name(&self) -> &str {
        "think"
    }

    fn description(&self) -> &str {
        "Record a thought or intermediate reasoning step. \
         Use this to plan before acting; it has no side effects."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["thought"],
            "properties": {
                "thought": {
                    "type": "string",
                    "description": "The reasoning to record"
                }
            }
        })
    }

    async fn execute(&self, call: &ToolCall, _cancel: &CancellationToken) -> ToolOutput {
        ToolOutput::ok(&call.id, "Thought recorded.")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn think_always_succeeds() {
        let tool = ThinkTool;
        let call = ToolCall {
            id: "t1".into(),
            name: "think".into(),
            args: json!({"thought": "the failing test points at the parser"}),
        };
        let out = tool.execute(&call, &CancellationToken::new()).await;
        assert!(!out.is_error());
        assert_eq!(out.call_id, "t1");
    }

    #[test]
    fn think_is_read_only_and_unkeyed() {
        let tool = ThinkTool;
        assert!(!tool.is_mutating());
        assert!(tool.resource_key(&json!({})).is_none());
    }
}
