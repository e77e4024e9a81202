use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use channel_plugin::message::{ChannelCapabilities, ChannelType};
use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::{
    BotRepository, ChannelRepository, ContactRepository, ContextRepository, ConversationRepository,
    MessageRepository, UserRepository,
};
use crate::analysis::context::ConversationContext;
use crate::domain::{
    Bot, Channel, ConnectionState, Contact, ContactIdentity, Conversation, ConversationStatus,
    Message, Priority, User,
};
use crate::error::{GatewayError, Result};

type IdentityKey = (String, ChannelType, String);
type PairKey = (String, String);

/// Process-local store implementing every repository. Uniqueness rules
/// (external ids, identities, one open conversation per pair) are enforced
/// with entry locks so concurrent writers cannot both win.
#[derive(Default)]
pub struct InMemoryStore {
    channels: DashMap<String, Channel>,
    contacts: DashMap<String, Contact>,
    identities: DashMap<IdentityKey, String>,
    conversations: DashMap<String, Conversation>,
    open_pairs: DashMap<PairKey, String>,
    messages: DashMap<String, (u64, Message)>,
    external_ids: DashMap<PairKey, String>,
    bots: DashMap<String, Bot>,
    users: DashMap<String, User>,
    contexts: DashMap<String, ConversationContext>,
    seq: AtomicU64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(channel_id, external_id)` of the message. Provider ids are only
    /// unique within a channel.
    fn external_key(&self, message: &Message) -> Option<PairKey> {
        let external_id = message.external_id.as_deref().filter(|e| !e.is_empty())?;
        let channel_id = self
            .conversations
            .get(&message.conversation_id)
            .map(|c| c.channel_id.clone())
            .unwrap_or_default();
        Some((channel_id, external_id.to_string()))
    }

    fn is_open(&self, conversation_id: &str) -> bool {
        self.conversations
            .get(conversation_id)
            .is_some_and(|c| c.is_open())
    }
}

#[async_trait]
impl ChannelRepository for InMemoryStore {
    async fn find_by_id(&self, id: &str) -> Result<Option<Channel>> {
        Ok(self.channels.get(id).map(|c| c.clone()))
    }

    async fn list(&self) -> Result<Vec<Channel>> {
        let mut channels: Vec<_> = self.channels.iter().map(|c| c.clone()).collect();
        channels.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(channels)
    }

    async fn save(&self, channel: Channel) -> Result<()> {
        self.channels.insert(channel.id.clone(), channel);
        Ok(())
    }

    async fn update_connection(
        &self,
        id: &str,
        state: ConnectionState,
        capabilities: Option<ChannelCapabilities>,
    ) -> Result<()> {
        let mut channel = self
            .channels
            .get_mut(id)
            .ok_or_else(|| GatewayError::not_found("channel not found"))?;
        channel.mark(state);
        if capabilities.is_some() {
            channel.capabilities = capabilities;
        }
        Ok(())
    }
}

#[async_trait]
impl ContactRepository for InMemoryStore {
    async fn find_by_id(&self, id: &str) -> Result<Option<Contact>> {
        Ok(self.contacts.get(id).map(|c| c.clone()))
    }

    async fn find_by_identity(
        &self,
        tenant_id: &str,
        channel_type: ChannelType,
        identifier: &str,
    ) -> Result<Option<Contact>> {
        let key = (tenant_id.to_string(), channel_type, identifier.to_string());
        let Some(contact_id) = self.identities.get(&key).map(|id| id.clone()) else {
            return Ok(None);
        };
        Ok(self.contacts.get(&contact_id).map(|c| c.clone()))
    }

    async fn find_by_phone(&self, tenant_id: &str, phone: &str) -> Result<Option<Contact>> {
        Ok(self
            .contacts
            .iter()
            .filter(|c| c.tenant_id == tenant_id && c.phone.as_deref() == Some(phone))
            .min_by_key(|c| c.created_at)
            .map(|c| c.clone()))
    }

    async fn create(&self, contact: &Contact) -> Result<()> {
        match self.contacts.entry(contact.id.clone()) {
            Entry::Occupied(_) => Err(GatewayError::conflict("contact already exists")),
            Entry::Vacant(slot) => {
                slot.insert(contact.clone());
                Ok(())
            }
        }
    }

    async fn add_identity(&self, tenant_id: &str, identity: ContactIdentity) -> Result<()> {
        if !self.contacts.contains_key(&identity.contact_id) {
            return Err(GatewayError::not_found("contact not found"));
        }
        let key = (
            tenant_id.to_string(),
            identity.channel_type,
            identity.identifier.clone(),
        );
        match self.identities.entry(key) {
            Entry::Occupied(owner) if owner.get() != &identity.contact_id => {
                return Err(GatewayError::conflict("identity belongs to another contact"));
            }
            Entry::Occupied(_) => return Ok(()),
            Entry::Vacant(slot) => {
                slot.insert(identity.contact_id.clone());
            }
        }
        if let Some(mut contact) = self.contacts.get_mut(&identity.contact_id) {
            contact.identities.push(identity);
            contact.updated_at = Utc::now();
        }
        Ok(())
    }
}

#[async_trait]
impl ConversationRepository for InMemoryStore {
    async fn find_by_id(&self, id: &str) -> Result<Option<Conversation>> {
        Ok(self.conversations.get(id).map(|c| c.clone()))
    }

    async fn find_open(&self, contact_id: &str, channel_id: &str) -> Result<Option<Conversation>> {
        let key = (contact_id.to_string(), channel_id.to_string());
        let Some(id) = self.open_pairs.get(&key).map(|id| id.clone()) else {
            return Ok(None);
        };
        Ok(self
            .conversations
            .get(&id)
            .filter(|c| c.is_open())
            .map(|c| c.clone()))
    }

    async fn create(&self, conversation: &Conversation) -> Result<()> {
        if !conversation.is_open() {
            self.conversations
                .insert(conversation.id.clone(), conversation.clone());
            return Ok(());
        }
        let key = (conversation.contact_id.clone(), conversation.channel_id.clone());
        match self.open_pairs.entry(key) {
            Entry::Occupied(slot) if self.is_open(slot.get()) => {
                Err(GatewayError::conflict("an open conversation already exists"))
            }
            entry => {
                // stored before the index entry is released
                self.conversations
                    .insert(conversation.id.clone(), conversation.clone());
                entry.insert(conversation.id.clone());
                Ok(())
            }
        }
    }

    async fn update(&self, conversation: &Conversation) -> Result<()> {
        if !self.conversations.contains_key(&conversation.id) {
            return Err(GatewayError::not_found("conversation not found"));
        }
        let key = (conversation.contact_id.clone(), conversation.channel_id.clone());
        if conversation.is_open() {
            match self.open_pairs.entry(key) {
                Entry::Occupied(slot) if slot.get() != &conversation.id && self.is_open(slot.get()) => {
                    return Err(GatewayError::conflict("an open conversation already exists"));
                }
                entry => {
                    entry.insert(conversation.id.clone());
                }
            }
        } else {
            self.open_pairs
                .remove_if(&key, |_, id| id == &conversation.id);
        }
        let mut stored = conversation.clone();
        stored.updated_at = Utc::now();
        self.conversations.insert(conversation.id.clone(), stored);
        Ok(())
    }

    async fn increment_unread(&self, id: &str) -> Result<()> {
        let mut conversation = self
            .conversations
            .get_mut(id)
            .ok_or_else(|| GatewayError::not_found("conversation not found"))?;
        conversation.unread_count += 1;
        conversation.last_message_at = Some(Utc::now());
        Ok(())
    }

    async fn count_waiting(&self, tenant_id: &str, min_priority: Priority, exclude_id: &str) -> Result<u64> {
        Ok(self
            .conversations
            .iter()
            .filter(|c| {
                c.tenant_id == tenant_id
                    && c.id != exclude_id
                    && c.status == ConversationStatus::Pending
                    && c.assigned_user_id.is_none()
                    && c.priority >= min_priority
            })
            .count() as u64)
    }

    async fn count_active_by_user(&self, user_id: &str) -> Result<u64> {
        Ok(self
            .conversations
            .iter()
            .filter(|c| c.assigned_user_id.as_deref() == Some(user_id) && c.is_open())
            .count() as u64)
    }
}

#[async_trait]
impl MessageRepository for InMemoryStore {
    async fn find_by_id(&self, id: &str) -> Result<Option<Message>> {
        Ok(self.messages.get(id).map(|m| m.1.clone()))
    }

    async fn find_by_external_id(&self, channel_id: &str, external_id: &str) -> Result<Option<Message>> {
        let key = (channel_id.to_string(), external_id.to_string());
        let Some(id) = self.external_ids.get(&key).map(|id| id.clone()) else {
            return Ok(None);
        };
        Ok(self.messages.get(&id).map(|m| m.1.clone()))
    }

    async fn create(&self, message: &Message) -> Result<()> {
        if let Some(key) = self.external_key(message) {
            match self.external_ids.entry(key) {
                Entry::Occupied(_) => return Err(GatewayError::conflict("message already exists")),
                Entry::Vacant(slot) => {
                    slot.insert(message.id.clone());
                }
            }
        }
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.messages.insert(message.id.clone(), (seq, message.clone()));
        Ok(())
    }

    async fn update(&self, message: &Message) -> Result<()> {
        let key = self.external_key(message);
        let mut stored = self
            .messages
            .get_mut(&message.id)
            .ok_or_else(|| GatewayError::not_found("message not found"))?;
        if let Some(key) = key {
            self.external_ids
                .entry(key)
                .or_insert_with(|| message.id.clone());
        }
        stored.1 = message.clone();
        Ok(())
    }

    async fn recent(&self, conversation_id: &str, limit: usize) -> Result<Vec<Message>> {
        let mut found: Vec<(u64, Message)> = self
            .messages
            .iter()
            .filter(|m| m.1.conversation_id == conversation_id)
            .map(|m| m.value().clone())
            .collect();
        found.sort_by(|a, b| a.1.created_at.cmp(&b.1.created_at).then(a.0.cmp(&b.0)));
        let skip = found.len().saturating_sub(limit);
        Ok(found.into_iter().skip(skip).map(|(_, m)| m).collect())
    }
}

#[async_trait]
impl BotRepository for InMemoryStore {
    async fn find_by_id(&self, id: &str) -> Result<Option<Bot>> {
        Ok(self.bots.get(id).map(|b| b.clone()))
    }

    async fn find_by_channel(&self, channel_id: &str) -> Result<Option<Bot>> {
        Ok(self
            .bots
            .iter()
            .filter(|b| b.channels.iter().any(|c| c == channel_id))
            .min_by(|a, b| a.id.cmp(&b.id))
            .map(|b| b.clone()))
    }

    async fn save(&self, bot: Bot) -> Result<()> {
        self.bots.insert(bot.id.clone(), bot);
        Ok(())
    }
}

#[async_trait]
impl UserRepository for InMemoryStore {
    async fn find_by_id(&self, id: &str) -> Result<Option<User>> {
        Ok(self.users.get(id).map(|u| u.clone()))
    }

    async fn find_available_agents(&self, tenant_id: &str, channel_id: &str) -> Result<Vec<User>> {
        let mut agents: Vec<User> = self
            .users
            .iter()
            .filter(|u| u.can_take(tenant_id, channel_id))
            .map(|u| u.clone())
            .collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(agents)
    }

    async fn save(&self, user: User) -> Result<()> {
        self.users.insert(user.id.clone(), user);
        Ok(())
    }
}

#[async_trait]
impl ContextRepository for InMemoryStore {
    async fn find_by_conversation(&self, conversation_id: &str) -> Result<Option<ConversationContext>> {
        Ok(self.contexts.get(conversation_id).map(|c| c.clone()))
    }

    async fn save(&self, context: &ConversationContext) -> Result<()> {
        self.contexts
            .insert(context.conversation_id.clone(), context.clone());
        Ok(())
    }
}
