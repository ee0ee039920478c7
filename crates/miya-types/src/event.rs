use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const SESSION_STATUS_EVENT: &str = "session.status";
pub const SESSION_STATUS_IDLE: &str = "idle";

/// Untyped event as forwarded by the host's dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub properties: Value,
}

impl HostEvent {
    pub fn new(event_type: impl Into<String>, properties: Value) -> Self {
        Self {
            event_type: event_type.into(),
            properties,
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        self.properties
            .get("sessionID")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
    }

    /// Status kind of a `session.status` payload. Accepts both
    /// `{"status": {"type": "idle"}}` and `{"status": "idle"}`.
    pub fn status_type(&self) -> Option<&str> {
        let status = self.properties.get("status")?;
        status
            .get("type")
            .and_then(Value::as_str)
            .or_else(|| status.as_str())
    }
}
