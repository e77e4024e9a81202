use std::collections::HashMap;

use channel_plugin::message::{ChannelCapabilities, ChannelType};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionState {
    Connected,
    #[default]
    Disconnected,
    Error,
}

/// A configured integration with one external messaging surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub id: String,
    pub tenant_id: String,
    #[serde(rename = "type")]
    pub channel_type: ChannelType,
    pub name: String,
    pub enabled: bool,
    #[serde(default)]
    pub connection_status: ConnectionState,
    #[serde(default)]
    pub config: HashMap<String, String>,
    /// Filled from the adapter once the channel is connected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<ChannelCapabilities>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Channel {
    pub fn new(
        id: impl Into<String>,
        tenant_id: impl Into<String>,
        channel_type: ChannelType,
        name: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            tenant_id: tenant_id.into(),
            channel_type,
            name: name.into(),
            enabled: true,
            connection_status: ConnectionState::Disconnected,
            config: HashMap::new(),
            capabilities: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Enabled by configuration and currently connected.
    pub fn is_active(&self) -> bool {
        self.enabled && self.connection_status == ConnectionState::Connected
    }

    /// Declared capabilities win; channels without a known adapter fall back
    /// to the types that render native buttons and lists.
    pub fn supports_interactive(&self) -> bool {
        match &self.capabilities {
            Some(caps) => caps.supports_interactive,
            None => matches!(
                self.channel_type,
                ChannelType::Whatsapp | ChannelType::WhatsappOfficial | ChannelType::Telegram
            ),
        }
    }

    pub fn mark(&mut self, state: ConnectionState) {
        self.connection_status = state;
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_needs_enabled_and_connected() {
        let mut channel = Channel::new("ch", "t", ChannelType::Sms, "SMS");
        assert!(!channel.is_active());
        channel.mark(ConnectionState::Connected);
        assert!(channel.is_active());
        channel.enabled = false;
        assert!(!channel.is_active());
    }

    #[test]
    fn interactive_support_prefers_capabilities() {
        let mut channel = Channel::new("ch", "t", ChannelType::Telegram, "bot");
        assert!(channel.supports_interactive());
        channel.capabilities = Some(ChannelCapabilities::default());
        assert!(!channel.supports_interactive());

        let mut webchat = Channel::new("wc", "t", ChannelType::Webchat, "site");
        assert!(!webchat.supports_interactive());
        webchat.capabilities = Some(ChannelCapabilities {
            supports_interactive: true,
            ..Default::default()
        });
        assert!(webchat.supports_interactive());
    }
}
