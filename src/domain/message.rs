use std::collections::HashMap;

use channel_plugin::message::{Attachment, ContentType, MessageStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SenderType {
    Contact,
    Bot,
    User,
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sender_type: SenderType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
    pub content_type: ContentType,
    pub content: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub status: MessageStatus,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    /// Provider id. Inbound messages are de-duplicated on it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Message {
    pub fn new(
        conversation_id: impl Into<String>,
        sender_type: SenderType,
        content_type: ContentType,
        content: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: super::new_id(),
            conversation_id: conversation_id.into(),
            sender_type,
            sender_id: None,
            content_type,
            content: content.into(),
            metadata: HashMap::new(),
            status: MessageStatus::Pending,
            attachments: Vec::new(),
            external_id: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `next` if that is a forward transition. Returns whether the
    /// status changed.
    pub fn advance(&mut self, next: MessageStatus, error: Option<String>) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        if next == MessageStatus::Failed {
            self.error = error;
        }
        self.updated_at = Utc::now();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_is_monotonic_and_failed_is_terminal() {
        let mut message = Message::new("conv", SenderType::Bot, ContentType::Text, "hi");
        assert!(message.advance(MessageStatus::Delivered, None));
        assert!(!message.advance(MessageStatus::Sent, None));
        assert!(!message.advance(MessageStatus::Failed, Some("late".into())));
        assert_eq!(message.status, MessageStatus::Delivered);

        let mut message = Message::new("conv", SenderType::Bot, ContentType::Text, "hi");
        assert!(message.advance(MessageStatus::Failed, Some("rejected".into())));
        assert_eq!(message.error.as_deref(), Some("rejected"));
        assert!(!message.advance(MessageStatus::Read, None));
    }
}
