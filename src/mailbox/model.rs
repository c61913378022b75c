// SPDX-License-Identifier: MIT

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How long a message lives before the TTL sweep removes it.
pub const MESSAGE_TTL_HOURS: i64 = 48;

// ─── Enums ────────────────────────────────────────────────────────────────────

/// Message lifecycle status. Mutated only through the transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Approved,
    InProgress,
    Read,
    Completed,
    Failed,
    Expired,
}

impl MessageStatus {
    /// Targets reachable from `self`. `Completed` is terminal; `Failed`
    /// may be retried back to `Pending`.
    pub fn allowed_targets(self) -> &'static [MessageStatus] {
        use MessageStatus::*;
        match self {
            Pending => &[Approved, Failed],
            Approved => &[InProgress, Failed],
            InProgress => &[Completed, Failed],
            Read => &[InProgress],
            Completed => &[],
            Failed => &[Pending],
            Expired => &[],
        }
    }

    pub fn can_transition_to(self, target: MessageStatus) -> bool {
        self.allowed_targets().contains(&target)
    }

    /// Statuses returned by a default inbox check.
    pub fn is_actionable(self) -> bool {
        matches!(
            self,
            MessageStatus::Pending | MessageStatus::Approved | MessageStatus::InProgress
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Approved => "approved",
            MessageStatus::InProgress => "in_progress",
            MessageStatus::Read => "read",
            MessageStatus::Completed => "completed",
            MessageStatus::Failed => "failed",
            MessageStatus::Expired => "expired",
        }
    }
}

impl std::str::FromStr for MessageStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(MessageStatus::Pending),
            "approved" => Ok(MessageStatus::Approved),
            "in_progress" => Ok(MessageStatus::InProgress),
            "read" => Ok(MessageStatus::Read),
            "completed" => Ok(MessageStatus::Completed),
            "failed" => Ok(MessageStatus::Failed),
            "expired" => Ok(MessageStatus::Expired),
            other => Err(anyhow::anyhow!("INVALID:unknown status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RoutingMode {
    #[default]
    Direct,
    Cowork,
}

/// Reserved task-text verbs that affect conversation state instead of
/// carrying work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlType {
    #[serde(rename = "REPLY_SKIP")]
    ReplySkip,
    #[serde(rename = "ANNOUNCE_SKIP")]
    AnnounceSkip,
    #[serde(rename = "CONVERSATION_END")]
    ConversationEnd,
}

impl ControlType {
    /// Detect a control message by exact match of the trimmed task text,
    /// case-insensitive.
    pub fn from_task(task: &str) -> Option<ControlType> {
        match task.trim().to_ascii_uppercase().as_str() {
            "REPLY_SKIP" => Some(ControlType::ReplySkip),
            "ANNOUNCE_SKIP" => Some(ControlType::AnnounceSkip),
            "CONVERSATION_END" => Some(ControlType::ConversationEnd),
            _ => None,
        }
    }
}

// ─── Attachments ──────────────────────────────────────────────────────────────

/// A file carried by a message: either inlined content or a reference into
/// the blob store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageFile {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

// ─── Message ──────────────────────────────────────────────────────────────────

/// A mailbox message. The wire envelope uses camelCase keys; `timestamp` is
/// the creation time and `expires_at` is always creation + 48 h.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub to: String,
    pub from: String,
    pub timestamp: String,
    pub expires_at: String,
    pub status: MessageStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_at: Option<String>,
    pub task: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default)]
    pub files: Vec<MessageFile>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_excerpt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub routing: RoutingMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routed_at: Option<String>,
    /// Destination override for cowork routing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cowork_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    /// Root message id of the thread; equals `id` for roots.
    pub thread_id: String,
    #[serde(default)]
    pub reply_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_control_message: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub control_type: Option<ControlType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_status: Option<String>,
}

impl Message {
    /// Stamp a fresh message: id, timestamps, TTL, self-threaded.
    /// Threading and status are adjusted afterwards by the store.
    pub fn new(to: String, from: String, task: String) -> Self {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        Message {
            thread_id: id.clone(),
            id,
            to,
            from,
            timestamp: now.to_rfc3339(),
            expires_at: (now + Duration::hours(MESSAGE_TTL_HOURS)).to_rfc3339(),
            status: MessageStatus::Pending,
            read_at: None,
            task,
            context: None,
            files: Vec::new(),
            project_name: None,
            conversation_excerpt: None,
            project: None,
            priority: None,
            tags: None,
            routing: RoutingMode::Direct,
            routed_at: None,
            destination: None,
            cowork_status: None,
            reply_to: None,
            reply_count: 0,
            is_control_message: None,
            control_type: None,
            thread_status: None,
        }
    }

    /// True when project metadata rides on the message, which relaxes the
    /// inbox path rule to allow a single segment.
    pub fn has_project_metadata(&self) -> bool {
        self.project.is_some() || self.project_name.is_some()
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        DateTime::parse_from_rfc3339(&self.expires_at)
            .map(|t| t.with_timezone(&Utc) <= now)
            .unwrap_or(false)
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(&self.timestamp)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now())
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_table_matches_lifecycle() {
        use MessageStatus::*;
        assert!(Pending.can_transition_to(Approved));
        assert!(Pending.can_transition_to(Failed));
        assert!(!Pending.can_transition_to(Completed));
        assert!(Approved.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Completed));
        assert!(Read.can_transition_to(InProgress));
        assert!(!Read.can_transition_to(Completed));
        assert!(Completed.allowed_targets().is_empty());
        assert!(Failed.can_transition_to(Pending));
        assert!(!Failed.can_transition_to(Approved));
    }

    #[test]
    fn status_round_trips_exact_wire_strings() {
        for (s, wire) in [
            (MessageStatus::Pending, "pending"),
            (MessageStatus::InProgress, "in_progress"),
            (MessageStatus::Expired, "expired"),
        ] {
            assert_eq!(serde_json::to_string(&s).unwrap(), format!("\"{wire}\""));
            assert_eq!(wire.parse::<MessageStatus>().unwrap(), s);
        }
    }

    #[test]
    fn control_type_matches_trimmed_case_insensitive() {
        assert_eq!(
            ControlType::from_task("  conversation_end "),
            Some(ControlType::ConversationEnd)
        );
        assert_eq!(ControlType::from_task("REPLY_SKIP"), Some(ControlType::ReplySkip));
        assert_eq!(ControlType::from_task("please reply"), None);
        // Embedded verbs are not control messages.
        assert_eq!(ControlType::from_task("do CONVERSATION_END later"), None);
    }

    #[test]
    fn new_message_expires_48h_after_creation() {
        let msg = Message::new("replit/main".into(), "cursor/dev".into(), "deploy".into());
        let created = DateTime::parse_from_rfc3339(&msg.timestamp).unwrap();
        let expires = DateTime::parse_from_rfc3339(&msg.expires_at).unwrap();
        assert_eq!(expires - created, Duration::hours(48));
        assert_eq!(msg.thread_id, msg.id);
        assert_eq!(msg.status, MessageStatus::Pending);
    }

    #[test]
    fn envelope_uses_camel_case_keys() {
        let msg = Message::new("replit/main".into(), "cursor/dev".into(), "deploy".into());
        let v = serde_json::to_value(&msg).unwrap();
        assert!(v.get("expiresAt").is_some());
        assert!(v.get("threadId").is_some());
        assert!(v.get("replyCount").is_some());
        assert!(v.get("expires_at").is_none());
    }
}
