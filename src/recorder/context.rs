// SPDX-License-Identifier: MIT
//
// Context synthesis. Everything here is a pure function of the entry list,
// so the resumption prompt is reproducible: identical inputs yield
// byte-identical prompts.

use chrono::DateTime;
use serde::Serialize;
use serde_json::Value;

use super::{EntryType, JournalEntry};

/// Number of recent entries rendered into the prompt's log block.
pub const RECENT_LOG_LIMIT: usize = 10;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextSummary {
    pub summary_text: String,
    pub immediate_goal: String,
    pub key_decisions: Vec<String>,
    pub unresolved_issues: Vec<String>,
    pub error_count: usize,
    pub entry_count: usize,
}

/// Render an entry's opaque content as display text.
fn content_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Synthesize a summary from entries ordered newest first.
///
/// The first context snapshot encountered (i.e. the latest) wins; errors are
/// counted across the window; the two most recent errors surface as
/// unresolved issues.
pub fn synthesize(entries_newest_first: &[JournalEntry]) -> ContextSummary {
    let mut latest_snapshot = None;
    let mut errors: Vec<String> = Vec::new();

    for entry in entries_newest_first {
        if latest_snapshot.is_none() {
            if let Some(snap) = &entry.context_snapshot {
                latest_snapshot = Some(snap.clone());
            }
        }
        if entry.entry_type == EntryType::Error {
            errors.push(content_text(&entry.content));
        }
    }

    let summary_text = latest_snapshot
        .as_ref()
        .and_then(|s| s.current_task.as_deref())
        .map(|task| format!("Working on: {task}"))
        .unwrap_or_else(|| "No context available".to_string());

    let mut immediate_goal = latest_snapshot
        .as_ref()
        .and_then(|s| s.blocking_issue.as_deref())
        .map(str::to_string)
        .unwrap_or_else(|| "Continue work".to_string());
    if let Some(last_error) = errors.first() {
        immediate_goal = format!("Fix error: {}", truncate_chars(last_error, 80));
    }

    let key_decisions = latest_snapshot
        .map(|s| s.recent_decisions)
        .unwrap_or_default();

    let unresolved_issues = errors
        .iter()
        .take(2)
        .map(|e| truncate_chars(e, 60))
        .collect();

    ContextSummary {
        summary_text,
        immediate_goal,
        key_decisions,
        unresolved_issues,
        error_count: errors.len(),
        entry_count: entries_newest_first.len(),
    }
}

/// Format an RFC 3339 timestamp as `HH:MM` (UTC). Unparseable timestamps
/// render as `--:--` so the prompt stays deterministic.
fn short_time(ts: &str) -> String {
    DateTime::parse_from_rfc3339(ts)
        .map(|t| t.format("%H:%M").to_string())
        .unwrap_or_else(|_| "--:--".to_string())
}

/// The resumption prompt: fixed protocol instructions, the summary fields,
/// unresolved issues (omitted when empty), and the last ten entries in
/// chronological order.
pub fn resumption_prompt(
    agent_id: &str,
    summary: &ContextSummary,
    entries_newest_first: &[JournalEntry],
) -> String {
    let mut out = String::new();
    out.push_str(&format!("=== RESUMPTION CONTEXT: {agent_id} ===\n\n"));
    out.push_str(
        "You are resuming work after a restart. Protocol: log a THOUGHT entry as you\n\
         reason, a CHECKPOINT entry when your working state changes, and an ERROR\n\
         entry when something fails. Keep your journal current so the next restart\n\
         can resume from it.\n\n",
    );

    out.push_str(&format!("SUMMARY: {}\n", summary.summary_text));
    out.push_str(&format!("IMMEDIATE GOAL: {}\n", summary.immediate_goal));

    if !summary.key_decisions.is_empty() {
        out.push_str("KEY DECISIONS:\n");
        for decision in &summary.key_decisions {
            out.push_str(&format!("- {decision}\n"));
        }
    }

    if !summary.unresolved_issues.is_empty() {
        out.push_str("\nUNRESOLVED ISSUES:\n");
        for issue in &summary.unresolved_issues {
            out.push_str(&format!("- {issue}\n"));
        }
    }

    if !entries_newest_first.is_empty() {
        out.push_str("\nRECENT LOGS:\n");
        // Last ten, reversed so they read oldest to newest.
        for entry in entries_newest_first.iter().take(RECENT_LOG_LIMIT).rev() {
            out.push_str(&format!(
                "- [{}] {}: {}\n",
                short_time(&entry.timestamp),
                entry.entry_type.as_str(),
                truncate_chars(&content_text(&entry.content), 100),
            ));
        }
    }

    out.push_str("\nAcknowledge this context and state your next step before continuing.\n");
    out
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::ContextSnapshot;
    use serde_json::json;

    fn entry(ty: EntryType, content: &str, ts: &str) -> JournalEntry {
        JournalEntry {
            id: format!("{ts}-{content}"),
            session_id: "s1".to_string(),
            agent_id: "claude/chat".to_string(),
            timestamp: ts.to_string(),
            entry_type: ty,
            content: json!(content),
            context_snapshot: None,
            target_agent: None,
            tags: None,
        }
    }

    #[test]
    fn empty_journal_yields_no_context() {
        let summary = synthesize(&[]);
        assert_eq!(summary.summary_text, "No context available");
        assert_eq!(summary.immediate_goal, "Continue work");
        assert!(summary.key_decisions.is_empty());
        assert!(summary.unresolved_issues.is_empty());
    }

    #[test]
    fn latest_snapshot_and_errors_drive_the_summary() {
        let mut checkpoint = entry(EntryType::Checkpoint, "saved", "2026-08-01T10:00:00Z");
        checkpoint.context_snapshot = Some(ContextSnapshot {
            current_task: Some("auth flow".to_string()),
            blocking_issue: Some("jwt".to_string()),
            recent_decisions: vec!["use HS256".to_string()],
            ..Default::default()
        });
        let error = entry(EntryType::Error, "RecursionDepthExceeded", "2026-08-01T10:05:00Z");

        // Newest first.
        let summary = synthesize(&[error, checkpoint]);
        assert_eq!(summary.summary_text, "Working on: auth flow");
        assert!(summary.immediate_goal.starts_with("Fix error: RecursionDepthExceeded"));
        assert_eq!(summary.key_decisions, vec!["use HS256"]);
        assert_eq!(summary.unresolved_issues, vec!["RecursionDepthExceeded"]);
        assert_eq!(summary.error_count, 1);
    }

    #[test]
    fn blocking_issue_is_goal_when_no_errors() {
        let mut checkpoint = entry(EntryType::Checkpoint, "saved", "2026-08-01T10:00:00Z");
        checkpoint.context_snapshot = Some(ContextSnapshot {
            current_task: Some("auth flow".to_string()),
            blocking_issue: Some("waiting on schema review".to_string()),
            ..Default::default()
        });
        let summary = synthesize(&[checkpoint]);
        assert_eq!(summary.immediate_goal, "waiting on schema review");
    }

    #[test]
    fn unresolved_issues_keep_two_most_recent_errors_truncated() {
        let long = "x".repeat(100);
        let entries = vec![
            entry(EntryType::Error, &long, "2026-08-01T10:03:00Z"),
            entry(EntryType::Error, "second", "2026-08-01T10:02:00Z"),
            entry(EntryType::Error, "third", "2026-08-01T10:01:00Z"),
        ];
        let summary = synthesize(&entries);
        assert_eq!(summary.unresolved_issues.len(), 2);
        assert_eq!(summary.unresolved_issues[0].len(), 60);
        assert_eq!(summary.unresolved_issues[1], "second");
    }

    #[test]
    fn prompt_is_deterministic_and_chronological() {
        let entries = vec![
            entry(EntryType::Error, "boom", "2026-08-01T10:05:00Z"),
            entry(EntryType::Thought, "thinking", "2026-08-01T10:00:00Z"),
        ];
        let summary = synthesize(&entries);
        let a = resumption_prompt("claude/chat", &summary, &entries);
        let b = resumption_prompt("claude/chat", &summary, &entries);
        assert_eq!(a, b);

        let logs_at = a.find("RECENT LOGS:").unwrap();
        let logs = &a[logs_at..];
        let thought_at = logs.find("[10:00] THOUGHT: thinking").unwrap();
        let error_at = logs.find("[10:05] ERROR: boom").unwrap();
        assert!(thought_at < error_at, "logs must read oldest to newest");
        assert!(a.ends_with("state your next step before continuing.\n"));
    }

    #[test]
    fn prompt_omits_empty_sections() {
        let summary = synthesize(&[]);
        let prompt = resumption_prompt("claude/chat", &summary, &[]);
        assert!(!prompt.contains("UNRESOLVED ISSUES"));
        assert!(!prompt.contains("RECENT LOGS"));
        assert!(prompt.contains("SUMMARY: No context available"));
    }
}
