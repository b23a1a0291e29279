//! Envelope wire format shared by inbound and outbound gateway traffic.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// `{type, data, realm_id?, channel_id?, user_id?}`. The set of `type` values
/// is open; the dispatcher ignores ones it does not know.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realm_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl Envelope {
    pub fn new(kind: &str, data: Value) -> Self {
        Self {
            kind: kind.to_string(),
            data,
            realm_id: None,
            channel_id: None,
            user_id: None,
        }
    }

    pub fn with_channel(mut self, channel_id: &str) -> Self {
        self.channel_id = Some(channel_id.to_string());
        self
    }

    /// The `typing` event fanned out to a channel.
    pub fn typing(user_id: &str, channel_id: &str, is_typing: bool) -> Self {
        Self::new(
            EventType::TYPING,
            serde_json::json!({ "user_id": user_id, "is_typing": is_typing }),
        )
        .with_channel(channel_id)
    }
}

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

/// Envelope `type` values understood by the gateway.
pub struct EventType;

impl EventType {
    pub const JOIN_REALM: &'static str = "join_realm";
    pub const JOIN_CHANNEL: &'static str = "join_channel";
    pub const LEAVE_REALM: &'static str = "leave_realm";
    pub const LEAVE_CHANNEL: &'static str = "leave_channel";
    pub const TYPING_START: &'static str = "typing_start";
    pub const TYPING_STOP: &'static str = "typing_stop";
    pub const TYPING: &'static str = "typing";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_minimal_envelope() {
        let env: Envelope = serde_json::from_str(r#"{"type":"join_channel","channel_id":"ch_1"}"#).unwrap();
        assert_eq!(env.kind, EventType::JOIN_CHANNEL);
        assert_eq!(env.channel_id.as_deref(), Some("ch_1"));
        assert!(env.data.is_null());
        assert!(env.realm_id.is_none());
    }

    #[test]
    fn unknown_type_still_decodes() {
        let env: Envelope =
            serde_json::from_str(r#"{"type":"future_thing","data":{"x":1},"extra":true}"#).unwrap();
        assert_eq!(env.kind, "future_thing");
        assert_eq!(env.data["x"], 1);
    }

    #[test]
    fn typing_event_omits_absent_ids() {
        let json = serde_json::to_value(Envelope::typing("usr_1", "general", true)).unwrap();
        assert_eq!(json["type"], "typing");
        assert_eq!(json["channel_id"], "general");
        assert_eq!(json["data"]["user_id"], "usr_1");
        assert_eq!(json["data"]["is_typing"], true);
        assert!(json.get("realm_id").is_none());
    }
}
