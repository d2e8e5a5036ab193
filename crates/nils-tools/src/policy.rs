// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use regex::Regex;

use nils_config::ToolsConfig;

use crate::ToolCall;

/// What the policy layer decided about a pending tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyDecision {
    /// Run without asking
    Allow,
    /// Run, but an interactive front-end should confirm first.  The
    /// dispatcher itself treats this as Allow (confirmation UX lives
    /// outside the runtime).
    AllowWithConfirmation,
    /// Never run; surfaces as a permission_denied tool error
    Deny,
}

/// Hook evaluated for every tool call before execution.
///
/// The default implementation is [`PatternPolicy`]; embedders can supply
/// their own evaluator (path checks, dangerous-command signatures) without
/// touching the dispatcher.
pub trait PolicyEvaluator: Send + Sync {
    fn evaluate(&self, call: &ToolCall) -> PolicyDecision;
}

/// Glob-pattern allow/deny policy over tool names.
///
/// Deny wins over allow.  An empty allowlist admits every tool; a non-empty
/// allowlist admits only matching tools.
#[derive(Debug)]
pub struct PatternPolicy {
    allow_patterns: Vec<Regex>,
    deny_patterns: Vec<Regex>,
}

impl PatternPolicy {
    pub fn from_config(cfg: &ToolsConfig) -> Self {
        let compile = |patterns: &[String]| -> Vec<Regex> {
            patterns.iter().filter_map(|p| glob_to_regex(p)).collect()
        };
        Self {
            allow_patterns: compile(&cfg.allow_patterns),
            deny_patterns: compile(&cfg.deny_patterns),
        }
    }

    /// A policy with no patterns: everything allowed.
    pub fn allow_all() -> Self {
        Self {
            allow_patterns: vec![],
            deny_patterns: vec![],
        }
    }
}

impl PolicyEvaluator for PatternPolicy {
    fn evaluate(&self, call: &ToolCall) -> PolicyDecision {
        for re in &self.deny_patterns {
            if re.is_match(&call.name) {
                return PolicyDecision::Deny;
            }
        }
        if self.allow_patterns.is_empty() {
            return PolicyDecision::Allow;
        }
        for re in &self.allow_patterns {
            if re.is_match(&call.name) {
                return PolicyDecision::Allow;
            }
        }
        PolicyDecision::Deny
    }
}

/// Convert a simple shell glob pattern to a [`Regex`].
/// Only `*` (match anything) and `?` (match one char) are supported.
fn glob_to_regex(pattern: &str) -> Option<Regex> {
    let mut re = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            c => {
                for esc in regex::escape(&c.to_string()).chars() {
                    re.push(esc);
                }
            }
        }
    }
    re.push('$');
    Regex::new(&re).ok()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn policy_with(allow: &[&str], deny: &[&str]) -> PatternPolicy {
        PatternPolicy::from_config(&ToolsConfig {
            allow_patterns: allow.iter().map(|s| s.to_string()).collect(),
            deny_patterns: deny.iter().map(|s| s.to_string()).collect(),
            ..ToolsConfig::default()
        })
    }

    fn call(name: &str) -> ToolCall {
        ToolCall {
            id: "c1".into(),
            name: name.into(),
            args: json!({}),
        }
    }

    // ── Deny takes priority ───────────────────────────────────────────────────

    #[test]
    fn deny_beats_allow_for_same_pattern() {
        let p = policy_with(&["bash"], &["bash"]);
        assert_eq!(p.evaluate(&call("bash")), PolicyDecision::Deny);
    }

    #[test]
    fn deny_wildcard_blocks_family() {
        let p = policy_with(&[], &["file_*"]);
        assert_eq!(p.evaluate(&call("file_update")), PolicyDecision::Deny);
        assert_eq!(p.evaluate(&call("grep")), PolicyDecision::Allow);
    }

    // ── Allowlist semantics ───────────────────────────────────────────────────

    #[test]
    fn empty_allowlist_admits_everything() {
        let p = policy_with(&[], &[]);
        assert_eq!(p.evaluate(&call("anything")), PolicyDecision::Allow);
    }

    #[test]
    fn nonempty_allowlist_is_exhaustive() {
        let p = policy_with(&["file_read", "grep"], &[]);
        assert_eq!(p.evaluate(&call("grep")), PolicyDecision::Allow);
        assert_eq!(p.evaluate(&call("bash")), PolicyDecision::Deny);
    }

    #[test]
    fn question_mark_matches_one_char() {
        let p = policy_with(&["tool?"], &[]);
        assert_eq!(p.evaluate(&call("tool1")), PolicyDecision::Allow);
        assert_eq!(p.evaluate(&call("tool12")), PolicyDecision::Deny);
    }

    #[test]
    fn allow_all_helper_allows() {
        let p = PatternPolicy::allow_all();
        assert_eq!(p.evaluate(&call("bash")), PolicyDecision::Allow);
    }
}
