use std::collections::HashMap;
use std::sync::Arc;

use channel_plugin::message::{Attachment, ContentType, InboundMessage};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use opentelemetry::KeyValue;
use tracing::{debug, info, warn};

use crate::domain::{Channel, Contact, ContactIdentity, Conversation, Message, SenderType};
use crate::error::{GatewayError, Result};
use crate::events::{Event, EventSink, EventType};
use crate::logger::Metrics;
use crate::repository::Repositories;

pub const UNKNOWN_CONTACT_NAME: &str = "Unknown";

/// Metadata keys adapters use to describe the sender.
pub const META_SENDER_ID: &str = "sender_id";
pub const META_SENDER_NAME: &str = "sender_name";
pub const META_NAME: &str = "name";
pub const META_PHONE: &str = "phone";
pub const META_EMAIL: &str = "email";

#[derive(Debug, Clone)]
pub struct ReceiveMessageInput {
    pub channel_id: String,
    pub external_id: String,
    pub sender_id: String,
    pub sender_name: Option<String>,
    pub content_type: ContentType,
    pub content: String,
    pub metadata: HashMap<String, String>,
    pub attachments: Vec<Attachment>,
    pub timestamp: DateTime<Utc>,
}

impl ReceiveMessageInput {
    pub fn from_inbound(channel_id: impl Into<String>, message: InboundMessage) -> Self {
        Self {
            channel_id: channel_id.into(),
            external_id: message.external_id,
            sender_id: message.sender_id,
            sender_name: message.sender_name,
            content_type: message.content_type,
            content: message.content,
            metadata: message.metadata,
            attachments: message.attachments,
            timestamp: message.timestamp,
        }
    }

    fn meta(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }

    /// Phone beats the adapter's metadata sender id, which beats the
    /// envelope sender id.
    fn identifier(&self) -> &str {
        self.meta(META_PHONE)
            .or(self.meta(META_SENDER_ID))
            .unwrap_or(self.sender_id.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct ReceiveMessageOutput {
    pub message: Message,
    pub conversation: Conversation,
    pub contact: Contact,
    /// The conversation was created by this message.
    pub is_new: bool,
    pub contact_created: bool,
}

type DeliveryKey = (String, String);

/// A delivery being processed, keyed by `(channel_id, external_id)`.
/// Released on drop.
struct Claim<'a> {
    inflight: &'a DashMap<DeliveryKey, ()>,
    key: DeliveryKey,
}

impl<'a> Claim<'a> {
    fn take(inflight: &'a DashMap<DeliveryKey, ()>, channel_id: &str, external_id: &str) -> Option<Self> {
        let key = (channel_id.to_string(), external_id.to_string());
        match inflight.entry(key.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(());
                Some(Self { inflight, key })
            }
        }
    }
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.inflight.remove(&self.key);
    }
}

pub struct ReceiveMessage {
    repos: Repositories,
    events: Arc<dyn EventSink>,
    metrics: Metrics,
    inflight: DashMap<DeliveryKey, ()>,
}

impl ReceiveMessage {
    pub fn new(repos: Repositories, events: Arc<dyn EventSink>, metrics: Metrics) -> Self {
        Self {
            repos,
            events,
            metrics,
            inflight: DashMap::new(),
        }
    }

    /// Created events are emitted only once the message itself is stored,
    /// so a delivery that loses a duplicate race leaves no trace.
    pub async fn execute(&self, input: ReceiveMessageInput) -> Result<ReceiveMessageOutput> {
        let _claim = if input.external_id.is_empty() {
            None
        } else {
            let claim = Claim::take(&self.inflight, &input.channel_id, &input.external_id)
                .ok_or_else(|| GatewayError::conflict("message already exists"))?;
            let stored = self
                .repos
                .messages
                .find_by_external_id(&input.channel_id, &input.external_id)
                .await?;
            if stored.is_some() {
                return Err(GatewayError::conflict("message already exists"));
            }
            Some(claim)
        };

        let channel = self
            .repos
            .channels
            .find_by_id(&input.channel_id)
            .await?
            .ok_or_else(|| GatewayError::not_found("channel not found"))?;

        let (contact, contact_created) = self.resolve_contact(&channel, &input).await?;
        let (conversation, is_new) = self.resolve_conversation(&channel, &contact).await?;

        let mut message = Message::new(
            &conversation.id,
            SenderType::Contact,
            input.content_type,
            input.content,
        );
        message.sender_id = Some(contact.id.clone());
        message.metadata = input.metadata;
        message.attachments = input.attachments;
        message.external_id = Some(input.external_id).filter(|e| !e.is_empty());
        message.created_at = input.timestamp;
        self.repos.messages.create(&message).await?;

        if contact_created {
            self.events.emit(
                Event::new(EventType::ContactCreated, &channel.tenant_id)
                    .with("contact_id", contact.id.as_str())
                    .with("name", contact.name.as_str())
                    .with_opt("phone", contact.phone.clone())
                    .with_opt("email", contact.email.clone()),
            );
        }
        if is_new {
            self.events.emit(
                Event::new(EventType::ConversationCreated, &channel.tenant_id)
                    .with("conversation_id", conversation.id.as_str())
                    .with("channel_id", channel.id.as_str())
                    .with("contact_id", contact.id.as_str()),
            );
        }

        if let Err(err) = self.repos.conversations.increment_unread(&conversation.id).await {
            warn!(conversation_id = %conversation.id, "incrementing unread count: {err}");
        }
        let conversation = self.reopen_if_closed(conversation).await;

        self.metrics
            .messages_received
            .add(1, &[KeyValue::new("channel_type", channel.channel_type.to_string())]);
        self.events.emit(
            Event::new(EventType::MessageReceived, &channel.tenant_id)
                .with("message_id", message.id.as_str())
                .with("conversation_id", conversation.id.as_str())
                .with("contact_id", contact.id.as_str())
                .with("channel_id", channel.id.as_str())
                .with("content_type", message.content_type.as_ref())
                .with("content", message.content.as_str()),
        );
        debug!(message_id = %message.id, conversation_id = %conversation.id, "message received");

        Ok(ReceiveMessageOutput {
            message,
            conversation,
            contact,
            is_new,
            contact_created,
        })
    }

    async fn resolve_contact(
        &self,
        channel: &Channel,
        input: &ReceiveMessageInput,
    ) -> Result<(Contact, bool)> {
        let contacts = &self.repos.contacts;
        let tenant_id = channel.tenant_id.as_str();
        let channel_type = channel.channel_type;
        let identifier = input.identifier();

        if let Some(contact) = contacts
            .find_by_identity(tenant_id, channel_type, identifier)
            .await?
        {
            return Ok((contact, false));
        }

        let phone = input.meta(META_PHONE);
        if let Some(phone) = phone {
            if let Some(contact) = contacts.find_by_phone(tenant_id, phone).await? {
                let identity =
                    ContactIdentity::new(&contact.id, channel_type, identifier, HashMap::new());
                if let Err(err) = contacts.add_identity(tenant_id, identity).await {
                    warn!(contact_id = %contact.id, "linking identity to contact: {err}");
                }
                return Ok((contact, false));
            }
        }

        let name = input
            .meta(META_NAME)
            .or(input.meta(META_SENDER_NAME))
            .or(input.sender_name.as_deref().filter(|n| !n.is_empty()))
            .unwrap_or(UNKNOWN_CONTACT_NAME);
        let mut contact = Contact::new(tenant_id, name);
        contact.phone = phone.map(str::to_string);
        contact.email = input.meta(META_EMAIL).map(str::to_string);
        contacts.create(&contact).await?;

        let identity = ContactIdentity::new(&contact.id, channel_type, identifier, HashMap::new());
        match contacts.add_identity(tenant_id, identity.clone()).await {
            Ok(()) => contact.identities.push(identity),
            Err(GatewayError::Conflict(_)) => {
                // a concurrent message claimed the identifier first
                if let Some(winner) = contacts
                    .find_by_identity(tenant_id, channel_type, identifier)
                    .await?
                {
                    debug!(contact_id = %winner.id, "identity claimed concurrently, reusing contact");
                    return Ok((winner, false));
                }
            }
            Err(err) => warn!(contact_id = %contact.id, "adding identity: {err}"),
        }

        info!(contact_id = %contact.id, %channel_type, "contact created");
        Ok((contact, true))
    }

    async fn resolve_conversation(
        &self,
        channel: &Channel,
        contact: &Contact,
    ) -> Result<(Conversation, bool)> {
        let conversations = &self.repos.conversations;
        if let Some(open) = conversations.find_open(&contact.id, &channel.id).await? {
            return Ok((open, false));
        }

        let conversation = Conversation::new(&channel.tenant_id, &channel.id, &contact.id);
        match conversations.create(&conversation).await {
            Ok(()) => {}
            Err(GatewayError::Conflict(_)) => {
                if let Some(open) = conversations.find_open(&contact.id, &channel.id).await? {
                    return Ok((open, false));
                }
                return Err(GatewayError::internal("open conversation vanished during create"));
            }
            Err(err) => return Err(err),
        }
        debug!(conversation_id = %conversation.id, "conversation created");
        Ok((conversation, true))
    }

    /// Re-reads the conversation so a resolve that raced this message is
    /// seen, and reopens it. Best-effort.
    async fn reopen_if_closed(&self, conversation: Conversation) -> Conversation {
        let conversations = &self.repos.conversations;
        let mut current = match conversations.find_by_id(&conversation.id).await {
            Ok(Some(current)) => current,
            Ok(None) => return conversation,
            Err(err) => {
                warn!(conversation_id = %conversation.id, "reloading conversation: {err}");
                return conversation;
            }
        };
        if current.reopen() {
            if let Err(err) = conversations.update(&current).await {
                warn!(conversation_id = %current.id, "reopening conversation: {err}");
            } else {
                info!(conversation_id = %current.id, "conversation reopened");
            }
        }
        current
    }
}
