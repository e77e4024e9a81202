use std::collections::HashMap;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{AsRefStr, Display, EnumString};

pub const META_ESCALATION_REASON: &str = "escalation_reason";
pub const META_ESCALATED_BY: &str = "escalated_by";
pub const META_ESCALATED_AT: &str = "escalated_at";
pub const META_ESCALATED_FROM_BOT: &str = "escalated_from_bot";

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConversationStatus {
    #[default]
    Open,
    Pending,
    Resolved,
    Closed,
}

/// Ordered from least to most urgent.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
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
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl Priority {
    /// Unknown or empty labels map to `normal`.
    pub fn from_label(label: &str) -> Self {
        label.trim().to_lowercase().parse().unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub tenant_id: String,
    pub contact_id: String,
    pub channel_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_user_id: Option<String>,
    pub status: ConversationStatus,
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    pub unread_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_reply_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(
        tenant_id: impl Into<String>,
        channel_id: impl Into<String>,
        contact_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: super::new_id(),
            tenant_id: tenant_id.into(),
            contact_id: contact_id.into(),
            channel_id: channel_id.into(),
            assigned_user_id: None,
            status: ConversationStatus::Open,
            priority: Priority::Normal,
            subject: None,
            tags: Vec::new(),
            metadata: HashMap::new(),
            unread_count: 0,
            last_message_at: None,
            first_reply_at: None,
            resolved_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Open and pending conversations count against the one-per-pair rule.
    pub fn is_open(&self) -> bool {
        matches!(self.status, ConversationStatus::Open | ConversationStatus::Pending)
    }

    /// Reopens a resolved or closed conversation. Returns whether it changed.
    pub fn reopen(&mut self) -> bool {
        if self.is_open() {
            return false;
        }
        self.status = ConversationStatus::Open;
        self.resolved_at = None;
        self.updated_at = Utc::now();
        true
    }

    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    pub fn escalated_at(&self) -> Option<DateTime<Utc>> {
        self.meta_str(META_ESCALATED_AT)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc))
    }
}
