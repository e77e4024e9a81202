use std::collections::HashMap;
use std::sync::Arc;

use channel_plugin::message::{Attachment, ContentType, OutboundMessage};
use chrono::Utc;
use tracing::{debug, error, warn};

use super::interactive::{self, META_INTERACTIVE, META_INTERACTIVE_TYPE, QuickReply};
use crate::analysis::ContextService;
use crate::delivery::{Delivery, OutboundQueue};
use crate::domain::{Message, SenderType};
use crate::error::{GatewayError, Result};
use crate::repository::Repositories;

#[derive(Debug, Clone)]
pub struct SendMessageInput {
    pub tenant_id: String,
    pub conversation_id: String,
    pub sender_type: SenderType,
    pub sender_id: Option<String>,
    pub content_type: ContentType,
    pub content: String,
    pub attachments: Vec<Attachment>,
    pub metadata: HashMap<String, String>,
    pub quick_replies: Vec<QuickReply>,
}

impl SendMessageInput {
    pub fn text(
        tenant_id: impl Into<String>,
        conversation_id: impl Into<String>,
        sender_type: SenderType,
        content: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            conversation_id: conversation_id.into(),
            sender_type,
            sender_id: None,
            content_type: ContentType::Text,
            content: content.into(),
            attachments: Vec::new(),
            metadata: HashMap::new(),
            quick_replies: Vec::new(),
        }
    }
}

/// Persists an outbound message and queues it for delivery. The returned
/// message is still `pending`; the delivery worker moves it on.
pub struct SendMessage {
    repos: Repositories,
    queue: Arc<dyn OutboundQueue>,
    contexts: ContextService,
}

impl SendMessage {
    pub fn new(repos: Repositories, queue: Arc<dyn OutboundQueue>, contexts: ContextService) -> Self {
        Self {
            repos,
            queue,
            contexts,
        }
    }

    pub async fn execute(&self, input: SendMessageInput) -> Result<Message> {
        if input.conversation_id.trim().is_empty() {
            return Err(GatewayError::validation("conversation_id is required"));
        }
        if input.content.is_empty() && input.attachments.is_empty() {
            return Err(GatewayError::validation("content or attachments required"));
        }

        let mut conversation = self
            .repos
            .conversations
            .find_by_id(&input.conversation_id)
            .await?
            .ok_or_else(|| GatewayError::not_found("conversation not found"))?;
        if conversation.tenant_id != input.tenant_id {
            return Err(GatewayError::forbidden("conversation does not belong to tenant"));
        }
        let channel = self
            .repos
            .channels
            .find_by_id(&conversation.channel_id)
            .await?
            .ok_or_else(|| GatewayError::not_found("channel not found"))?;
        if !channel.is_active() {
            return Err(GatewayError::channel_disconnected("channel is not active"));
        }
        let contact = self
            .repos
            .contacts
            .find_by_id(&conversation.contact_id)
            .await?
            .ok_or_else(|| GatewayError::not_found("contact not found"))?;
        let recipient = contact.recipient_for(channel.channel_type);

        let mut message = Message::new(
            &conversation.id,
            input.sender_type,
            input.content_type,
            input.content,
        );
        message.sender_id = input.sender_id;
        message.metadata = input.metadata;
        message.attachments = input.attachments;

        if !input.quick_replies.is_empty() {
            if channel.supports_interactive() {
                let (payload, kind) = interactive::build_payload(&message.content, &input.quick_replies);
                message.content_type = ContentType::Interactive;
                message
                    .metadata
                    .insert(META_INTERACTIVE.into(), serde_json::to_string(&payload)?);
                message.metadata.insert(META_INTERACTIVE_TYPE.into(), kind.into());
            } else {
                message.content = interactive::numbered_list(&message.content, &input.quick_replies);
            }
        }

        self.repos.messages.create(&message).await?;

        let delivery = Delivery {
            tenant_id: conversation.tenant_id.clone(),
            channel_id: channel.id.clone(),
            message: OutboundMessage {
                id: message.id.clone(),
                conversation_id: conversation.id.clone(),
                recipient_id: recipient,
                content_type: message.content_type,
                content: message.content.clone(),
                metadata: message.metadata.clone(),
                attachments: message.attachments.clone(),
            },
        };
        if let Err(err) = self.queue.enqueue(delivery).await {
            error!(message_id = %message.id, "queueing message failed: {err}");
            message.advance(channel_plugin::message::MessageStatus::Failed, Some(err.to_string()));
            if let Err(e) = self.repos.messages.update(&message).await {
                warn!(message_id = %message.id, "marking message failed: {e}");
            }
            return Err(GatewayError::wrap("failed to publish message", err));
        }

        let now = Utc::now();
        if message.sender_type == SenderType::User && conversation.first_reply_at.is_none() {
            conversation.first_reply_at = Some(now);
        }
        conversation.last_message_at = Some(now);
        conversation.updated_at = now;
        if let Err(err) = self.repos.conversations.update(&conversation).await {
            warn!(conversation_id = %conversation.id, "updating conversation timestamps: {err}");
        }

        if message.sender_type == SenderType::Bot {
            if let Err(err) = self
                .contexts
                .add_assistant_message(&conversation.id, &message.content, Some(message.id.clone()))
                .await
            {
                warn!(conversation_id = %conversation.id, "recording bot reply in context: {err}");
            }
        }

        debug!(message_id = %message.id, channel_id = %channel.id, "message queued");
        Ok(message)
    }
}
