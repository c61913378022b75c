// SPDX-License-Identifier: MIT

use serde::Deserialize;
use serde_json::{json, Value};

pub const PROTOCOL_VERSION: &str = "1.0";

// ─── Client frames ────────────────────────────────────────────────────────────

/// Frames a bridge client may send, tagged by `type`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Auth {
        agent_id: String,
        #[serde(default)]
        capabilities: Option<Vec<String>>,
        #[serde(default)]
        token: Option<String>,
    },
    Ping,
    Message {
        to: String,
        content: String,
        #[serde(default)]
        metadata: Option<Value>,
    },
    Command {
        to: String,
        action: String,
        #[serde(default)]
        payload: Option<Value>,
        #[serde(default)]
        await_response: Option<bool>,
        #[serde(default)]
        command_id: Option<String>,
    },
    Response {
        command_id: String,
        to: String,
        #[serde(default)]
        result: Option<Value>,
        #[serde(default)]
        error: Option<String>,
    },
    Broadcast {
        channel: String,
        content: Value,
    },
    Subscribe {
        channels: Vec<String>,
    },
    ListAgents {
        #[serde(default)]
        filter: Option<AgentFilter>,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentFilter {
    #[serde(default)]
    pub online: Option<bool>,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub capability: Option<String>,
}

// ─── Server frames ────────────────────────────────────────────────────────────

pub fn welcome() -> String {
    json!({"type": "welcome", "protocol_version": PROTOCOL_VERSION}).to_string()
}

pub fn error(message: &str) -> String {
    json!({"type": "error", "error": message}).to_string()
}

pub fn auth_success(agent_id: &str, online_agents: &[String]) -> String {
    json!({
        "type": "auth_success",
        "agent_id": agent_id,
        "online_agents": online_agents,
    })
    .to_string()
}

pub fn presence(agent_id: &str, status: &str) -> String {
    json!({"type": "presence", "agent_id": agent_id, "status": status}).to_string()
}

pub fn pong() -> String {
    json!({"type": "pong"}).to_string()
}

pub fn goodbye() -> String {
    json!({"type": "goodbye", "reason": "server shutting down"}).to_string()
}

pub fn replaced() -> String {
    json!({
        "type": "replaced",
        "reason": "another connection authenticated with this agent id",
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_parse_by_type_tag() {
        let frame: ClientFrame = serde_json::from_str(
            r#"{"type":"auth","agent_id":"replit/agent","token":"abc"}"#,
        )
        .unwrap();
        assert!(matches!(frame, ClientFrame::Auth { ref agent_id, .. } if agent_id == "replit/agent"));

        let frame: ClientFrame =
            serde_json::from_str(r#"{"type":"message","to":"claude/web","content":"hi"}"#).unwrap();
        assert!(matches!(frame, ClientFrame::Message { .. }));

        let frame: ClientFrame =
            serde_json::from_str(r#"{"type":"list_agents","filter":{"online":true}}"#).unwrap();
        match frame {
            ClientFrame::ListAgents { filter } => assert_eq!(filter.unwrap().online, Some(true)),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn unknown_type_fails_to_parse() {
        assert!(serde_json::from_str::<ClientFrame>(r#"{"type":"warp"}"#).is_err());
    }
}
