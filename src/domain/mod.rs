pub mod bot;
pub mod channel;
pub mod contact;
pub mod conversation;
pub mod message;
pub mod user;

pub use bot::{Bot, BotConfig, BotStatus, EscalationCondition, EscalationRule};
pub use channel::{Channel, ConnectionState};
pub use contact::{Contact, ContactIdentity};
pub use conversation::{Conversation, ConversationStatus, Priority};
pub use message::{Message, SenderType};
pub use user::{User, UserRole, UserStatus};

pub(crate) fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
