use serde::{Deserialize, Serialize};

use crate::ModelSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartKind {
    Text,
    Reasoning,
    /// Tool calls, files, step markers and anything else the platform emits.
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePart {
    #[serde(rename = "type")]
    pub kind: PartKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl MessagePart {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: PartKind::Text,
            text: Some(text.into()),
        }
    }

    pub fn reasoning(text: impl Into<String>) -> Self {
        Self {
            kind: PartKind::Reasoning,
            text: Some(text.into()),
        }
    }

    /// Text carried by a text or reasoning part, if non-empty.
    pub fn readable_text(&self) -> Option<&str> {
        match self.kind {
            PartKind::Text | PartKind::Reasoning => {
                self.text.as_deref().filter(|text| !text.is_empty())
            }
            PartKind::Other => None,
        }
    }
}

/// One entry of a session's message history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMessage {
    pub role: MessageRole,
    #[serde(default)]
    pub parts: Vec<MessagePart>,
}

impl SessionMessage {
    pub fn assistant(parts: Vec<MessagePart>) -> Self {
        Self {
            role: MessageRole::Assistant,
            parts,
        }
    }

    pub fn user(parts: Vec<MessagePart>) -> Self {
        Self {
            role: MessageRole::User,
            parts,
        }
    }
}

/// Visibility of the delegation tools on a spawned agent's first prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolPermissions {
    pub background_task: bool,
    pub task: bool,
}

impl ToolPermissions {
    pub fn for_delegation(can_delegate: bool) -> Self {
        Self {
            background_task: can_delegate,
            task: can_delegate,
        }
    }
}

/// Body of a prompt submitted to a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PromptBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<ToolPermissions>,
    pub parts: Vec<MessagePart>,
}

impl PromptBody {
    /// A plain text prompt with no agent, model or tool overrides.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            parts: vec![MessagePart::text(text)],
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unknown_roles_and_part_types_deserialize_as_other() {
        let message: SessionMessage = serde_json::from_value(json!({
            "role": "tool",
            "parts": [{"type": "step-start"}, {"type": "text", "text": "hi"}]
        }))
        .expect("message");
        assert_eq!(message.role, MessageRole::Other);
        assert_eq!(message.parts[0].kind, PartKind::Other);
        assert_eq!(message.parts[1].readable_text(), Some("hi"));
    }

    #[test]
    fn readable_text_skips_empty_and_foreign_parts() {
        assert_eq!(MessagePart::text("").readable_text(), None);
        assert_eq!(MessagePart::reasoning("hmm").readable_text(), Some("hmm"));
        let file = MessagePart {
            kind: PartKind::Other,
            text: Some("ignored".to_string()),
        };
        assert_eq!(file.readable_text(), None);
    }

    #[test]
    fn prompt_body_serializes_tools_map() {
        let body = PromptBody {
            agent: Some("2-code-search".to_string()),
            tools: Some(ToolPermissions::for_delegation(false)),
            ..PromptBody::text("find it")
        };
        let value = serde_json::to_value(&body).expect("json");
        assert_eq!(
            value["tools"],
            json!({"background_task": false, "task": false})
        );
        assert_eq!(value["parts"][0], json!({"type": "text", "text": "find it"}));
        assert!(value.get("model").is_none());
    }
}
