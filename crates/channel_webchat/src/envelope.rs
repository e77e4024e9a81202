use std::collections::HashMap;

use channel_plugin::message::Attachment;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameType {
    Message,
    Typing,
    Read,
    Connect,
    Error,
    Ack,
    Presence,
}

/// One JSON frame on the widget connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: FrameType,
    #[serde(default)]
    pub payload: Payload,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Payload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_typing: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub(crate) fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

impl Envelope {
    pub fn new(kind: FrameType, payload: Payload) -> Self {
        Self { kind, payload }
    }

    pub fn ack(id: Option<String>) -> Self {
        Self::new(FrameType::Ack, Payload { id, ..Default::default() })
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(
            FrameType::Error,
            Payload {
                error: Some(message.into()),
                ..Default::default()
            },
        )
    }

    pub fn typing(is_typing: bool) -> Self {
        Self::new(
            FrameType::Typing,
            Payload {
                is_typing,
                ..Default::default()
            },
        )
    }

    pub fn read(message_id: impl Into<String>) -> Self {
        Self::new(
            FrameType::Read,
            Payload {
                id: Some(message_id.into()),
                ..Default::default()
            },
        )
    }

    /// Sent once after a successful upgrade.
    pub fn connect(session_id: &str, widget_title: &str, widget_color: &str) -> Self {
        Self::new(
            FrameType::Connect,
            Payload {
                id: Some(session_id.to_string()),
                metadata: HashMap::from([
                    ("session_id".to_string(), session_id.to_string()),
                    ("widget_title".to_string(), widget_title.to_string()),
                    ("widget_color".to_string(), widget_color.to_string()),
                ]),
                timestamp: Some(now_rfc3339()),
                ..Default::default()
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_fields_are_omitted() {
        let v = serde_json::to_value(Envelope::typing(false)).unwrap();
        assert_eq!(v, json!({"type": "typing", "payload": {}}));

        let v = serde_json::to_value(Envelope::typing(true)).unwrap();
        assert_eq!(v, json!({"type": "typing", "payload": {"is_typing": true}}));
    }

    #[test]
    fn widget_frames_parse() {
        let raw = r#"{"type":"message","payload":{"id":"c-1","content_type":"text","content":"hi",
            "attachments":[{"type":"image","url":"https://x/y.png","size_bytes":10}]}}"#;
        let env: Envelope = serde_json::from_str(raw).unwrap();
        assert_eq!(env.kind, FrameType::Message);
        assert_eq!(env.payload.content.as_deref(), Some("hi"));
        assert_eq!(env.payload.attachments[0].kind, "image");
        assert!(!env.payload.is_typing);

        let env: Envelope = serde_json::from_str(r#"{"type":"presence"}"#).unwrap();
        assert_eq!(env.kind, FrameType::Presence);
        assert_eq!(env.payload, Payload::default());
    }

    #[test]
    fn connect_frame_carries_widget_config() {
        let env = Envelope::connect("s-1", "Chat with us", "#007bff");
        assert_eq!(env.payload.id.as_deref(), Some("s-1"));
        assert_eq!(env.payload.metadata["widget_color"], "#007bff");
        assert!(env.payload.timestamp.is_some());
    }
}
