use std::collections::HashMap;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumIter, EnumString};

/// Kind of external messaging surface an adapter talks to.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    JsonSchema,
    Display,
    EnumString,
    EnumIter,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ChannelType {
    Webchat,
    Whatsapp,
    WhatsappOfficial,
    Telegram,
    Sms,
    Rcs,
    Instagram,
    Facebook,
    Email,
    Voice,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    JsonSchema,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ContentType {
    #[default]
    Text,
    Image,
    Video,
    Audio,
    Document,
    Location,
    Contact,
    Template,
    Interactive,
}

/// Delivery status of a message.
///
/// Status only moves forward (`pending → sent → delivered → read`); `failed`
/// can be reached from `pending` or `sent` and is terminal.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    JsonSchema,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MessageStatus {
    #[default]
    Pending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    fn rank(self) -> u8 {
        match self {
            MessageStatus::Pending => 0,
            MessageStatus::Sent => 1,
            MessageStatus::Delivered => 2,
            MessageStatus::Read => 3,
            MessageStatus::Failed => u8::MAX,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, MessageStatus::Failed)
    }

    pub fn can_transition_to(self, next: MessageStatus) -> bool {
        match (self, next) {
            (MessageStatus::Failed, _) => false,
            (MessageStatus::Pending | MessageStatus::Sent, MessageStatus::Failed) => true,
            (_, MessageStatus::Failed) => false,
            (current, next) => next.rank() > current.rank(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct Attachment {
    #[serde(rename = "type")]
    pub kind: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

/// A message ready to be delivered by an adapter.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct OutboundMessage {
    pub id: String,
    pub conversation_id: String,
    pub recipient_id: String,
    pub content_type: ContentType,
    pub content: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

/// Outcome of a send. Provider failures are reported here, not as errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SendResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    pub status: MessageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl SendResult {
    pub fn sent(external_id: impl Into<String>) -> Self {
        Self::succeeded(external_id, MessageStatus::Sent)
    }

    pub fn delivered(external_id: impl Into<String>) -> Self {
        Self::succeeded(external_id, MessageStatus::Delivered)
    }

    fn succeeded(external_id: impl Into<String>, status: MessageStatus) -> Self {
        Self {
            success: true,
            external_id: Some(external_id.into()),
            status,
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            external_id: None,
            status: MessageStatus::Failed,
            error: Some(error.into()),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct Media {
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct MediaUpload {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl MediaUpload {
    pub fn not_implemented() -> Self {
        Self {
            success: false,
            media_id: None,
            url: None,
            error: Some("not implemented".to_string()),
            expires_at: None,
        }
    }
}

/// Static description of what a channel can render. Declared once per
/// adapter version.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct ChannelCapabilities {
    pub supported_content_types: Vec<ContentType>,
    pub supports_media: bool,
    pub supports_location: bool,
    pub supports_templates: bool,
    pub supports_interactive: bool,
    pub supports_read_receipts: bool,
    pub supports_typing_indicator: bool,
    pub supports_reactions: bool,
    pub supports_replies: bool,
    pub supports_forwarding: bool,
    pub max_message_length: u32,
    pub max_media_size: u64,
    pub max_attachments: u32,
    #[serde(default)]
    pub supported_media_types: Vec<String>,
}

impl ChannelCapabilities {
    pub fn supports(&self, content_type: ContentType) -> bool {
        self.supported_content_types.contains(&content_type)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ChannelInfo {
    #[serde(rename = "type")]
    pub channel_type: ChannelType,
    pub name: String,
    pub description: String,
    pub version: String,
    #[serde(default)]
    pub author: String,
    pub capabilities: ChannelCapabilities,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_connected_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

/// A message received from a channel, before contact/conversation resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct InboundMessage {
    pub id: String,
    #[serde(default)]
    pub external_id: String,
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    pub content_type: ContentType,
    pub content: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub timestamp: DateTime<Utc>,
}

/// Delivery report pushed by a channel for a previously sent message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct StatusCallback {
    #[serde(default)]
    pub message_id: String,
    pub external_id: String,
    pub status: MessageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TypingIndicator {
    pub recipient_id: String,
    pub is_typing: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ReadReceipt {
    pub recipient_id: String,
    pub message_id: String,
}
