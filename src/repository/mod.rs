//! Persistence boundary. Use cases only see these traits; the gateway ships
//! an in-memory implementation.

use std::sync::Arc;

use async_trait::async_trait;
use channel_plugin::message::{ChannelCapabilities, ChannelType};

use crate::analysis::context::ConversationContext;
use crate::domain::{
    Bot, Channel, ConnectionState, Contact, ContactIdentity, Conversation, Message, Priority, User,
};
use crate::error::Result;

pub mod memory;

pub use memory::InMemoryStore;

/// Every repository a use case may need, as shared trait objects.
#[derive(Clone)]
pub struct Repositories {
    pub channels: Arc<dyn ChannelRepository>,
    pub contacts: Arc<dyn ContactRepository>,
    pub conversations: Arc<dyn ConversationRepository>,
    pub messages: Arc<dyn MessageRepository>,
    pub bots: Arc<dyn BotRepository>,
    pub users: Arc<dyn UserRepository>,
    pub contexts: Arc<dyn ContextRepository>,
}

impl Repositories {
    pub fn in_memory(store: Arc<InMemoryStore>) -> Self {
        Self {
            channels: store.clone(),
            contacts: store.clone(),
            conversations: store.clone(),
            messages: store.clone(),
            bots: store.clone(),
            users: store.clone(),
            contexts: store,
        }
    }
}

#[async_trait]
pub trait ChannelRepository: Send + Sync {
    async fn find_by_id(&self, id: &str) -> Result<Option<Channel>>;

    async fn list(&self) -> Result<Vec<Channel>>;

    async fn save(&self, channel: Channel) -> Result<()>;

    async fn update_connection(
        &self,
        id: &str,
        state: ConnectionState,
        capabilities: Option<ChannelCapabilities>,
    ) -> Result<()>;
}

#[async_trait]
pub trait ContactRepository: Send + Sync {
    async fn find_by_id(&self, id: &str) -> Result<Option<Contact>>;

    async fn find_by_identity(
        &self,
        tenant_id: &str,
        channel_type: ChannelType,
        identifier: &str,
    ) -> Result<Option<Contact>>;

    async fn find_by_phone(&self, tenant_id: &str, phone: &str) -> Result<Option<Contact>>;

    async fn create(&self, contact: &Contact) -> Result<()>;

    /// Fails with a conflict when the identifier already belongs to another
    /// contact of the tenant.
    async fn add_identity(&self, tenant_id: &str, identity: ContactIdentity) -> Result<()>;
}

#[async_trait]
pub trait ConversationRepository: Send + Sync {
    async fn find_by_id(&self, id: &str) -> Result<Option<Conversation>>;

    /// The open or pending conversation for the pair, if any.
    async fn find_open(&self, contact_id: &str, channel_id: &str) -> Result<Option<Conversation>>;

    /// Fails with a conflict when the pair already has an open conversation.
    async fn create(&self, conversation: &Conversation) -> Result<()>;

    async fn update(&self, conversation: &Conversation) -> Result<()>;

    async fn increment_unread(&self, id: &str) -> Result<()>;

    /// Unassigned pending conversations of the tenant with at least
    /// `min_priority`, not counting `exclude_id`.
    async fn count_waiting(&self, tenant_id: &str, min_priority: Priority, exclude_id: &str) -> Result<u64>;

    /// Open or pending conversations assigned to the user.
    async fn count_active_by_user(&self, user_id: &str) -> Result<u64>;
}

#[async_trait]
pub trait MessageRepository: Send + Sync {
    async fn find_by_id(&self, id: &str) -> Result<Option<Message>>;

    /// Provider-assigned ids are unique per channel, not globally.
    async fn find_by_external_id(&self, channel_id: &str, external_id: &str) -> Result<Option<Message>>;

    /// Persists the message with its attachments. A non-empty external id
    /// already stored for the same channel is a conflict.
    async fn create(&self, message: &Message) -> Result<()>;

    async fn update(&self, message: &Message) -> Result<()>;

    /// The latest `limit` messages of the conversation, oldest first.
    async fn recent(&self, conversation_id: &str, limit: usize) -> Result<Vec<Message>>;
}

#[async_trait]
pub trait BotRepository: Send + Sync {
    async fn find_by_id(&self, id: &str) -> Result<Option<Bot>>;

    async fn find_by_channel(&self, channel_id: &str) -> Result<Option<Bot>>;

    async fn save(&self, bot: Bot) -> Result<()>;
}

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn find_by_id(&self, id: &str) -> Result<Option<User>>;

    /// Agents who can take conversations on the channel, ordered by id.
    async fn find_available_agents(&self, tenant_id: &str, channel_id: &str) -> Result<Vec<User>>;

    async fn save(&self, user: User) -> Result<()>;
}

#[async_trait]
pub trait ContextRepository: Send + Sync {
    async fn find_by_conversation(&self, conversation_id: &str) -> Result<Option<ConversationContext>>;

    async fn save(&self, context: &ConversationContext) -> Result<()>;
}
