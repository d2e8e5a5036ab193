// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Cache-friendly context compression.
//!
//! The log is split into the leading system prefix, a cacheable prefix of
//! the conversation (stable across turns, so provider-side prefix caches
//! stay warm), and a compressible tail.  The tail is replaced by a single
//! summary message: LLM-written when the model cooperates, deterministic
//! statistics otherwise.  System messages from the original prefix are
//! never modified and nothing is reordered; summaries produced by earlier
//! compressions live in the conversation and are themselves compressible.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use nils_config::AgentConfig;
use nils_model::{
    unanswered_call_ids, CompletionRequest, Message, ModelProvider, Role,
    META_COMPREHENSIVE_SUMMARY, META_STATISTICAL_SUMMARY,
};
use nils_tools::OutputCategory;

// ─── Compression prompt ───────────────────────────────────────────────────────

const SUMMARIZE_PROMPT: &str =
    "You are a context compression assistant. Summarise the following conversation history \
     in a concise, information-dense way. Preserve all technical details, decisions, file \
     names, code snippets, and tool outputs that may be relevant to future work. \
     The summary will replace the original history to free up context space.";

/// Which summary the compressor produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummaryKind {
    /// LLM-written summary (`comprehensive_ai_summary`)
    Comprehensive,
    /// Deterministic fallback (`statistical_summary`)
    Statistical,
}

impl std::fmt::Display for SummaryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SummaryKind::Comprehensive => write!(f, "comprehensive"),
            SummaryKind::Statistical => write!(f, "statistical"),
        }
    }
}

/// Split point between the leading system prefix and the conversation.
fn system_prefix_len(messages: &[Message]) -> usize {
    messages
        .iter()
        .take_while(|m| m.role == Role::System)
        .count()
}

/// Length of the cacheable prefix of `conversation`: the first `keep` items,
/// extended forward until every tool call inside is answered inside.  The
/// resulting prefix can be cut after without breaking pairing invariants.
pub(crate) fn cacheable_prefix_len(conversation: &[Message], keep: usize) -> usize {
    let mut end = keep.min(conversation.len());
    while end < conversation.len() && !unanswered_call_ids(&conversation[..end]).is_empty() {
        end += 1;
    }
    end
}

/// Compress `messages`, replacing the tail with one summary message.
///
/// Returns `None` when there is nothing to compress (the conversation fits
/// inside the cacheable prefix).  The caller owns backup creation; this
/// function only computes the replacement log.
pub async fn compress_log(
    messages: &[Message],
    model: &Arc<dyn ModelProvider>,
    cfg: &AgentConfig,
) -> Option<(Vec<Message>, SummaryKind)> {
    let sys_len = system_prefix_len(messages);
    let (system, conversation) = messages.split_at(sys_len);

    if conversation.len() <= cfg.cacheable_prefix_keep {
        return None;
    }
    let prefix_len = cacheable_prefix_len(conversation, cfg.cacheable_prefix_keep);
    let (prefix, tail) = conversation.split_at(prefix_len);
    if tail.is_empty() {
        return None;
    }

    let (summary_text, kind) = match summarize_with_model(tail, model, cfg).await {
        Some(text) => (text, SummaryKind::Comprehensive),
        None => (statistical_summary(tail), SummaryKind::Statistical),
    };
    let meta_type = match kind {
        SummaryKind::Comprehensive => META_COMPREHENSIVE_SUMMARY,
        SummaryKind::Statistical => META_STATISTICAL_SUMMARY,
    };
    let summary = Message::system(summary_text)
        .with_meta("type", meta_type)
        .with_meta("cache_friendly", true)
        .with_meta("compressed_messages", tail.len());

    let mut new_log = Vec::with_capacity(sys_len + prefix_len + 1);
    new_log.extend_from_slice(system);
    new_log.extend_from_slice(prefix);
    new_log.push(summary);
    Some((new_log, kind))
}

/// Ask the basic model for a summary; low temperature, bounded output.
/// Any failure (transport, empty text) falls back to statistics.
async fn summarize_with_model(
    tail: &[Message],
    model: &Arc<dyn ModelProvider>,
    cfg: &AgentConfig,
) -> Option<String> {
    let req = CompletionRequest {
        messages: vec![
            Message::system(SUMMARIZE_PROMPT),
            Message::user(serialize_history(tail)),
        ],
        temperature: Some(cfg.summary_temperature),
        max_tokens: Some(cfg.summary_max_tokens),
        ..Default::default()
    };
    match model.chat(req).await {
        Ok(resp) if !resp.message.content.trim().is_empty() => Some(resp.message.content),
        Ok(_) => {
            warn!("compression summary came back empty; using statistical fallback");
            None
        }
        Err(e) => {
            warn!(error = %e, "compression summary call failed; using statistical fallback");
            None
        }
    }
}

/// Deterministic summary: role counts, tool names invoked, topic keywords.
/// Never fails, never calls the model.
pub fn statistical_summary(tail: &[Message]) -> String {
    let mut role_counts: HashMap<&str, usize> = HashMap::new();
    let mut tool_names: Vec<String> = Vec::new();
    let mut word_freq: HashMap<String, usize> = HashMap::new();

    for m in tail {
        let role = match m.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        };
        *role_counts.entry(role).or_default() += 1;
        for tc in &m.tool_calls {
            if !tool_names.contains(&tc.name) {
                tool_names.push(tc.name.clone());
            }
        }
        for word in m
            .content
            .split(|c: char| !c.is_alphanumeric() && c != '_')
            .filter(|w| w.len() > 3)
        {
            *word_freq.entry(word.to_lowercase()).or_default() += 1;
        }
    }

    let mut keywords: Vec<(String, usize)> = word_freq.into_iter().collect();
    keywords.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    let keywords: Vec<String> = keywords.into_iter().take(8).map(|(w, _)| w).collect();

    let mut roles: Vec<(&str, usize)> = role_counts.into_iter().collect();
    roles.sort();
    let roles_text = roles
        .iter()
        .map(|(r, n)| format!("{n} {r}"))
        .collect::<Vec<_>>()
        .join(", ");

    let mut out = format!(
        "[Earlier conversation compressed: {} messages ({roles_text}).",
        tail.len()
    );
    if !tool_names.is_empty() {
        out.push_str(&format!(" Tools used: {}.", tool_names.join(", ")));
    }
    if !keywords.is_empty() {
        out.push_str(&format!(" Topics: {}.", keywords.join(", ")));
    }
    out.push(']');
    out
}

/// Serialise a message list into plain text for the compression prompt.
fn serialize_history(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|m| {
            let role = match m.role {
                Role::System => "System",
                Role::User => "User",
                Role::Assistant => "Assistant",
                Role::Tool => "Tool",
            };
            let mut line = format!("{role}: {}", m.content);
            for tc in &m.tool_calls {
                line.push_str(&format!("\n[tool_call: {}({})]", tc.name, tc.args));
            }
            if let Some(id) = &m.tool_call_id {
                line.push_str(&format!("\n[answers: {id}]"));
            }
            line
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

// ─── Tool-result truncation ───────────────────────────────────────────────────

/// Deterministic, content-aware tool-result truncation.
///
/// Returns `content` unchanged when it fits within `cap_tokens`.  Otherwise
/// applies a category-specific extraction strategy; every truncated result
/// ends with an explicit notice so the model knows more content exists and
/// how to retrieve it.
pub fn smart_truncate(content: &str, category: OutputCategory, cap_tokens: usize) -> String {
    if cap_tokens == 0 {
        return content.to_string();
    }
    let cap_chars = cap_tokens * 4;
    if content.len() <= cap_chars {
        return content.to_string();
    }
    let omitted_bytes = content.len().saturating_sub(cap_chars);
    match category {
        OutputCategory::HeadTail => head_tail_lines(
            content,
            cap_chars,
            60,
            40,
            &format!("[... {{lines}} lines / {omitted_bytes} bytes omitted ...]"),
        ),
        OutputCategory::MatchList => head_lines(
            content,
            cap_chars,
            &format!(
                "[... {{lines}} more matches omitted ({omitted_bytes} bytes); \
                     use a more specific pattern to see them ...]"
            ),
        ),
        OutputCategory::FileContent => head_tail_lines(
            content,
            cap_chars,
            usize::MAX,
            usize::MAX,
            &format!(
                "[... {{lines}} lines omitted ({omitted_bytes} bytes); \
                     read again with offset/limit to see more ...]"
            ),
        ),
        OutputCategory::Generic => {
            let cut = content[..cap_chars]
                .rfind('\n')
                .map(|p| p + 1)
                .unwrap_or(cap_chars);
            format!(
                "{}\n[... {omitted_bytes} bytes omitted; \
                 content truncated to fit context budget ...]",
                &content[..cut]
            )
        }
    }
}

/// Keep only the leading lines that fit within `cap_chars`.
fn head_lines(content: &str, cap_chars: usize, notice_template: &str) -> String {
    let lines: Vec<&str> = content.lines().collect();
    let mut kept = String::with_capacity(cap_chars);
    let mut kept_count = 0usize;
    for line in &lines {
        let needed = if kept.is_empty() {
            line.len()
        } else {
            line.len() + 1
        };
        if kept.len() + needed > cap_chars {
            break;
        }
        if !kept.is_empty() {
            kept.push('\n');
        }
        kept.push_str(line);
        kept_count += 1;
    }
    let omitted = lines.len().saturating_sub(kept_count);
    if omitted == 0 {
        return content[..cap_chars.min(content.len())].to_string();
    }
    let notice = notice_template.replace("{lines}", &omitted.to_string());
    format!("{kept}\n{notice}")
}

/// Keep `max_head` leading lines and `max_tail` trailing lines, inserting a
/// notice between them.  Pass `usize::MAX` to split evenly by character budget.
fn head_tail_lines(
    content: &str,
    cap_chars: usize,
    max_head: usize,
    max_tail: usize,
    notice_template: &str,
) -> String {
    let lines: Vec<&str> = content.lines().collect();
    let half_cap = cap_chars / 2;

    let mut head = String::with_capacity(half_cap);
    let mut head_count = 0usize;
    for line in lines.iter().take(max_head) {
        let needed = if head.is_empty() {
            line.len()
        } else {
            line.len() + 1
        };
        if head.len() + needed > half_cap {
            break;
        }
        if !head.is_empty() {
            head.push('\n');
        }
        head.push_str(line);
        head_count += 1;
    }

    let mut tail_lines: Vec<&str> = Vec::new();
    let mut tail_chars = 0usize;
    for line in lines.iter().rev().take(max_tail) {
        let needed = if tail_lines.is_empty() {
            line.len()
        } else {
            line.len() + 1
        };
        if tail_chars + needed > half_cap {
            break;
        }
        tail_chars += needed;
        tail_lines.push(line);
    }
    tail_lines.reverse();
    let tail_count = tail_lines.len();
    let tail = tail_lines.join("\n");

    let omitted = lines.len().saturating_sub(head_count + tail_count);
    if omitted == 0 {
        return content[..cap_chars.min(content.len())].to_string();
    }
    let notice = notice_template.replace("{lines}", &omitted.to_string());
    format!("{head}\n{notice}\n{tail}")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokens::estimate_log;
    use nils_model::{validate, ScriptedMockProvider, ToolCallRequest};
    use nils_model::{FailingProvider, ResponseEvent};
    use serde_json::json;

    fn call(id: &str, name: &str) -> ToolCallRequest {
        ToolCallRequest {
            id: id.into(),
            name: name.into(),
            args: json!({"path": "/tmp"}),
        }
    }

    fn agent_cfg() -> AgentConfig {
        AgentConfig::default()
    }

    /// system + N user/assistant pairs
    fn log_with_turns(turns: usize) -> Vec<Message> {
        let mut log = vec![Message::system("you are a coding agent")];
        for i in 0..turns {
            log.push(Message::user(format!(
                "user question number {i} about the parser module"
            )));
            log.push(Message::assistant(format!(
                "assistant answer number {i} explaining the fix in detail"
            )));
        }
        log
    }

    fn summarizer() -> Arc<dyn ModelProvider> {
        Arc::new(ScriptedMockProvider::always_text(
            "Earlier turns discussed the parser module fixes.",
        ))
    }

    // ── cacheable_prefix_len ──────────────────────────────────────────────────

    #[test]
    fn prefix_is_keep_when_no_pairs_straddle() {
        let conv = vec![
            Message::user("a"),
            Message::assistant("b"),
            Message::user("c"),
            Message::assistant("d"),
            Message::user("e"),
        ];
        assert_eq!(cacheable_prefix_len(&conv, 4), 4);
    }

    #[test]
    fn prefix_extends_to_close_tool_pairs() {
        let conv = vec![
            Message::user("a"),
            Message::assistant("b"),
            Message::user("c"),
            Message::assistant_with_calls("", vec![call("t1", "file_read")]),
            Message::tool_result("t1", "contents"),
            Message::assistant("done"),
        ];
        // keep=4 cuts between the call and its reply; the prefix must grow
        // to include the reply.
        assert_eq!(cacheable_prefix_len(&conv, 4), 5);
    }

    #[test]
    fn prefix_extends_past_parallel_replies() {
        let conv = vec![
            Message::user("a"),
            Message::assistant("b"),
            Message::user("c"),
            Message::assistant_with_calls("", vec![call("t1", "grep"), call("t2", "grep")]),
            Message::tool_result("t1", "r1"),
            Message::tool_result("t2", "r2"),
            Message::assistant("done"),
        ];
        assert_eq!(cacheable_prefix_len(&conv, 4), 6);
    }

    #[test]
    fn prefix_clamped_to_conversation_len() {
        let conv = vec![Message::user("only")];
        assert_eq!(cacheable_prefix_len(&conv, 4), 1);
    }

    // ── compress_log ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn short_conversation_is_left_alone() {
        let log = log_with_turns(2); // 4 conversation messages = keep
        let result = compress_log(&log, &summarizer(), &agent_cfg()).await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn long_conversation_gets_exactly_one_summary() {
        let log = log_with_turns(12);
        let (new_log, kind) = compress_log(&log, &summarizer(), &agent_cfg())
            .await
            .unwrap();
        assert_eq!(kind, SummaryKind::Comprehensive);
        // system + 4 prefix + 1 summary
        assert_eq!(new_log.len(), 6);
        let summaries: Vec<&Message> = new_log
            .iter()
            .filter(|m| m.meta_str("type") == Some(META_COMPREHENSIVE_SUMMARY))
            .collect();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].role, Role::System);
    }

    #[tokio::test]
    async fn compressed_log_preserves_invariants() {
        let mut log = log_with_turns(3);
        log.push(Message::assistant_with_calls("", vec![call("t1", "bash")]));
        log.push(Message::tool_result("t1", "done"));
        for i in 0..6 {
            log.push(Message::user(format!("follow-up {i}")));
            log.push(Message::assistant(format!("answer {i}")));
        }
        let (new_log, _) = compress_log(&log, &summarizer(), &agent_cfg())
            .await
            .unwrap();
        assert!(validate(&new_log).is_ok(), "compressed log breaks invariants");
    }

    #[tokio::test]
    async fn compression_is_token_monotone() {
        let log = log_with_turns(15);
        let before = estimate_log(&log);
        let (new_log, _) = compress_log(&log, &summarizer(), &agent_cfg())
            .await
            .unwrap();
        assert!(estimate_log(&new_log) <= before);
    }

    #[tokio::test]
    async fn system_prefix_is_untouched() {
        let log = log_with_turns(10);
        let (new_log, _) = compress_log(&log, &summarizer(), &agent_cfg())
            .await
            .unwrap();
        assert_eq!(new_log[0].content, "you are a coding agent");
        assert_eq!(new_log[0].timestamp, log[0].timestamp);
    }

    #[tokio::test]
    async fn cacheable_prefix_survives_verbatim() {
        let log = log_with_turns(10);
        let (new_log, _) = compress_log(&log, &summarizer(), &agent_cfg())
            .await
            .unwrap();
        // conversation prefix = first 4 non-system messages, byte-identical
        for (new_msg, old_msg) in new_log[1..5].iter().zip(log[1..5].iter()) {
            assert_eq!(new_msg.content, old_msg.content);
            assert_eq!(new_msg.timestamp, old_msg.timestamp);
        }
    }

    #[tokio::test]
    async fn model_failure_falls_back_to_statistical_summary() {
        let failing: Arc<dyn ModelProvider> = Arc::new(FailingProvider);
        let log = log_with_turns(10);
        let (new_log, kind) = compress_log(&log, &failing, &agent_cfg()).await.unwrap();
        assert_eq!(kind, SummaryKind::Statistical);
        let summary = new_log.last().unwrap();
        assert_eq!(summary.meta_str("type"), Some(META_STATISTICAL_SUMMARY));
        assert!(summary.content.contains("compressed"));
    }

    #[tokio::test]
    async fn empty_model_reply_falls_back_to_statistical_summary() {
        let empty: Arc<dyn ModelProvider> = Arc::new(ScriptedMockProvider::new(vec![vec![
            ResponseEvent::TextDelta("".into()),
            ResponseEvent::Done,
        ]]));
        let log = log_with_turns(10);
        let (_, kind) = compress_log(&log, &empty, &agent_cfg()).await.unwrap();
        assert_eq!(kind, SummaryKind::Statistical);
    }

    #[tokio::test]
    async fn summarizer_receives_low_temperature_and_bounded_output() {
        let provider = ScriptedMockProvider::always_text("summary");
        let last_request = provider.last_request.clone();
        let model: Arc<dyn ModelProvider> = Arc::new(provider);
        let log = log_with_turns(10);
        let _ = compress_log(&log, &model, &agent_cfg()).await.unwrap();
        let req = last_request.lock().unwrap().clone().unwrap();
        assert_eq!(req.temperature, Some(0.2));
        assert_eq!(req.max_tokens, Some(1000));
    }

    #[tokio::test]
    async fn earlier_summaries_are_themselves_compressible() {
        // A summary from a previous compression sits in the conversation and
        // must not accumulate forever: a second compression may fold it into
        // the new tail.
        let mut log = log_with_turns(3);
        log.push(
            Message::system("[old summary]").with_meta("type", META_COMPREHENSIVE_SUMMARY),
        );
        for i in 0..8 {
            log.push(Message::user(format!("q{i}")));
            log.push(Message::assistant(format!("a{i}")));
        }
        let (new_log, _) = compress_log(&log, &summarizer(), &agent_cfg())
            .await
            .unwrap();
        assert!(validate(&new_log).is_ok());
        let old_summaries = new_log
            .iter()
            .filter(|m| m.content == "[old summary]")
            .count();
        assert_eq!(old_summaries, 0, "stale summary should be folded away");
    }

    // ── statistical_summary ───────────────────────────────────────────────────

    #[test]
    fn statistical_summary_counts_roles_and_tools() {
        let tail = vec![
            Message::user("please refactor the tokenizer module"),
            Message::assistant_with_calls("", vec![call("t1", "file_read")]),
            Message::tool_result("t1", "source text"),
            Message::assistant("refactored the tokenizer"),
        ];
        let s = statistical_summary(&tail);
        assert!(s.contains("4 messages"));
        assert!(s.contains("file_read"));
        assert!(s.contains("tokenizer"), "keyword missing: {s}");
    }

    #[test]
    fn statistical_summary_handles_empty_tail() {
        let s = statistical_summary(&[]);
        assert!(s.contains("0 messages"));
    }

    // ── smart_truncate ────────────────────────────────────────────────────────

    fn make_lines(n: usize) -> String {
        (0..n)
            .map(|i| format!("line {i}"))
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[test]
    fn truncate_returns_original_when_under_cap() {
        let short = "hello world";
        assert_eq!(smart_truncate(short, OutputCategory::HeadTail, 100), short);
    }

    #[test]
    fn truncate_zero_cap_returns_original() {
        let content = "a".repeat(10_000);
        assert_eq!(smart_truncate(&content, OutputCategory::HeadTail, 0), content);
    }

    #[test]
    fn all_categories_add_omission_notice_when_truncated() {
        let content = make_lines(1000);
        for category in [
            OutputCategory::HeadTail,
            OutputCategory::MatchList,
            OutputCategory::FileContent,
            OutputCategory::Generic,
        ] {
            let result = smart_truncate(&content, category, 10);
            assert!(
                result.contains("omitted"),
                "{category:?} truncation must include an omission notice"
            );
        }
    }

    #[test]
    fn headtail_preserves_first_and_last_lines() {
        let content = make_lines(200);
        let result = smart_truncate(&content, OutputCategory::HeadTail, 50);
        assert!(result.contains("line 0"));
        assert!(result.contains("line 199"));
    }

    #[test]
    fn matchlist_keeps_only_leading_matches() {
        let content = (0..500)
            .map(|i| format!("match {i}: some content"))
            .collect::<Vec<_>>()
            .join("\n");
        let result = smart_truncate(&content, OutputCategory::MatchList, 50);
        assert!(result.contains("match 0:"));
        assert!(
            !result.contains("match 499:"),
            "MatchList must not jump to the tail"
        );
    }

    #[test]
    fn filecontent_drops_middle_lines() {
        let content = make_lines(1000);
        let result = smart_truncate(&content, OutputCategory::FileContent, 50);
        assert!(result.contains("line 0"));
        assert!(result.contains("line 999"));
        assert!(!result.contains("line 500\n") && !result.contains("\nline 500"));
    }

    #[test]
    fn generic_truncates_at_newline_boundary() {
        let content = format!("{}\n{}", "a".repeat(10), "b".repeat(100));
        let result = smart_truncate(&content, OutputCategory::Generic, 5);
        assert!(!result.contains("bbb"));
    }

    #[test]
    fn generic_falls_back_to_hard_cut_when_no_newline() {
        let content = "x".repeat(10_000);
        let result = smart_truncate(&content, OutputCategory::Generic, 10);
        let x_count = result.chars().take_while(|&c| c == 'x').count();
        assert_eq!(x_count, 40);
    }
}
