use std::collections::HashMap;

use channel_plugin::message::ChannelType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Binds a channel-specific identifier to one contact per tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactIdentity {
    pub id: String,
    pub contact_id: String,
    pub channel_type: ChannelType,
    pub identifier: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl ContactIdentity {
    pub fn new(
        contact_id: impl Into<String>,
        channel_type: ChannelType,
        identifier: impl Into<String>,
        metadata: HashMap<String, String>,
    ) -> Self {
        Self {
            id: super::new_id(),
            contact_id: contact_id.into(),
            channel_type,
            identifier: identifier.into(),
            metadata,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default)]
    pub custom_fields: HashMap<String, String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub identities: Vec<ContactIdentity>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Contact {
    pub fn new(tenant_id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: super::new_id(),
            tenant_id: tenant_id.into(),
            name: name.into(),
            email: None,
            phone: None,
            custom_fields: HashMap::new(),
            tags: Vec::new(),
            identities: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn identity_for(&self, channel_type: ChannelType) -> Option<&str> {
        self.identities
            .iter()
            .find(|i| i.channel_type == channel_type)
            .map(|i| i.identifier.as_str())
    }

    /// Address to deliver to on `channel_type`: the channel identity, then
    /// phone, then email. Empty when the contact has none of them.
    pub fn recipient_for(&self, channel_type: ChannelType) -> String {
        self.identity_for(channel_type)
            .or(self.phone.as_deref().filter(|p| !p.is_empty()))
            .or(self.email.as_deref().filter(|e| !e.is_empty()))
            .unwrap_or_default()
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recipient_falls_back_to_phone_then_email() {
        let mut contact = Contact::new("t", "Ana");
        assert_eq!(contact.recipient_for(ChannelType::Sms), "");

        contact.email = Some("ana@example.com".into());
        assert_eq!(contact.recipient_for(ChannelType::Sms), "ana@example.com");

        contact.phone = Some("+5511999".into());
        assert_eq!(contact.recipient_for(ChannelType::Sms), "+5511999");

        contact.identities.push(ContactIdentity::new(
            &contact.id,
            ChannelType::Telegram,
            "tg-42",
            HashMap::new(),
        ));
        assert_eq!(contact.recipient_for(ChannelType::Telegram), "tg-42");
        assert_eq!(contact.recipient_for(ChannelType::Sms), "+5511999");
    }
}
