use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{AsRefStr, Display, EnumString};
use tracing::debug;

use crate::analysis::{ContextService, IntentService};
use crate::domain::conversation::{META_ESCALATED_FROM_BOT, META_ESCALATION_REASON};
use crate::domain::{Message, Priority, SenderType};
use crate::error::{GatewayError, Result};
use crate::repository::Repositories;

/// Messages included in the hand-off view.
pub const RECENT_MESSAGES: usize = 20;

const SUMMARY_PROMPT: &str = "Summarize this customer service conversation in 2-3 sentences \
for the human agent taking over. Focus on the customer's issue and what has been tried so far.";

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EscalationReason {
    LowConfidence,
    NegativeSentiment,
    KeywordTrigger,
    UserRequest,
    FlowAction,
    BotFailure,
    ComplexQuery,
    Manual,
}

impl EscalationReason {
    /// Buckets a free-text reason. The first matching marker wins.
    pub fn from_text(reason: &str) -> Self {
        let reason = reason.to_lowercase();
        let has = |words: &[&str]| words.iter().any(|w| reason.contains(w));
        if has(&["confidence"]) {
            EscalationReason::LowConfidence
        } else if has(&["sentiment", "negative"]) {
            EscalationReason::NegativeSentiment
        } else if has(&["keyword"]) {
            EscalationReason::KeywordTrigger
        } else if has(&["user", "human"]) {
            EscalationReason::UserRequest
        } else if has(&["flow"]) {
            EscalationReason::FlowAction
        } else if has(&["fail", "error"]) {
            EscalationReason::BotFailure
        } else if has(&["complex"]) {
            EscalationReason::ComplexQuery
        } else {
            EscalationReason::Manual
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub id: String,
    pub sender_type: SenderType,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub is_bot: bool,
}

impl From<&Message> for TranscriptEntry {
    fn from(message: &Message) -> Self {
        Self {
            id: message.id.clone(),
            sender_type: message.sender_type,
            content: message.content.clone(),
            timestamp: message.created_at,
            is_bot: message.sender_type == SenderType::Bot,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CustomerInfo {
    pub id: String,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub custom_fields: HashMap<String, String>,
}

/// Everything an agent needs when picking up an escalated conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationContext {
    pub conversation_id: String,
    pub reason: EscalationReason,
    pub reason_text: Option<String>,
    pub priority: Priority,
    pub customer: CustomerInfo,
    pub channel_type: Option<String>,
    pub channel_name: Option<String>,
    pub recent_messages: Vec<TranscriptEntry>,
    pub message_count: usize,
    pub bot_attempts: usize,
    pub intent: Option<String>,
    pub intent_confidence: Option<f64>,
    pub sentiment: Option<String>,
    pub sentiment_score: Option<f64>,
    pub entities: HashMap<String, String>,
    pub active_flow_id: Option<String>,
    pub current_node_id: Option<String>,
    pub collected_data: HashMap<String, Value>,
    pub bot_id: Option<String>,
    pub bot_name: Option<String>,
    pub tags: Vec<String>,
    pub escalated_at: Option<DateTime<Utc>>,
    pub wait_time_seconds: Option<i64>,
    pub summary: Option<String>,
}

pub struct GetEscalationContext {
    repos: Repositories,
    contexts: ContextService,
    intents: Arc<IntentService>,
}

impl GetEscalationContext {
    pub fn new(repos: Repositories, contexts: ContextService, intents: Arc<IntentService>) -> Self {
        Self {
            repos,
            contexts,
            intents,
        }
    }

    pub async fn execute(
        &self,
        tenant_id: &str,
        conversation_id: &str,
        with_summary: bool,
    ) -> Result<EscalationContext> {
        let conversation = self
            .repos
            .conversations
            .find_by_id(conversation_id)
            .await?
            .ok_or_else(|| GatewayError::not_found("conversation not found"))?;
        if conversation.tenant_id != tenant_id {
            return Err(GatewayError::forbidden("conversation does not belong to tenant"));
        }

        let messages = self.repos.messages.recent(conversation_id, RECENT_MESSAGES).await?;
        let recent_messages: Vec<TranscriptEntry> = messages.iter().map(TranscriptEntry::from).collect();
        let bot_attempts = recent_messages.iter().filter(|m| m.is_bot).count();

        let customer = match self.repos.contacts.find_by_id(&conversation.contact_id).await? {
            Some(contact) => CustomerInfo {
                id: contact.id,
                name: contact.name,
                email: contact.email,
                phone: contact.phone,
                custom_fields: contact.custom_fields,
            },
            None => CustomerInfo {
                id: conversation.contact_id.clone(),
                ..CustomerInfo::default()
            },
        };
        let channel = self.repos.channels.find_by_id(&conversation.channel_id).await?;

        let reason_text = conversation.meta_str(META_ESCALATION_REASON).map(str::to_string);
        let escalated_at = conversation.escalated_at();
        let mut view = EscalationContext {
            conversation_id: conversation.id.clone(),
            reason: reason_text
                .as_deref()
                .map(EscalationReason::from_text)
                .unwrap_or(EscalationReason::Manual),
            reason_text,
            priority: conversation.priority,
            customer,
            channel_type: channel.as_ref().map(|c| c.channel_type.to_string()),
            channel_name: channel.map(|c| c.name),
            message_count: recent_messages.len(),
            recent_messages,
            bot_attempts,
            intent: None,
            intent_confidence: None,
            sentiment: None,
            sentiment_score: None,
            entities: HashMap::new(),
            active_flow_id: None,
            current_node_id: None,
            collected_data: HashMap::new(),
            bot_id: conversation.meta_str(META_ESCALATED_FROM_BOT).map(str::to_string),
            bot_name: None,
            tags: conversation.tags.clone(),
            escalated_at,
            wait_time_seconds: escalated_at.map(|at| (Utc::now() - at).num_seconds().max(0)),
            summary: None,
        };

        if let Some(context) = self.contexts.get(conversation_id).await? {
            if let Some(intent) = &context.intent {
                view.intent = Some(intent.name.clone());
                view.intent_confidence = Some(intent.confidence);
            }
            if let Some(sentiment) = &context.sentiment {
                view.sentiment = Some(sentiment.label.to_string());
                view.sentiment_score = Some(sentiment.score);
            }
            view.active_flow_id = context.active_flow_id();
            view.current_node_id = context.current_node_id();
            view.collected_data = context.collected_data();
            view.entities = context.entities;
            if context.bot_id.is_some() {
                view.bot_id = context.bot_id;
            }
        }

        let bot = match &view.bot_id {
            Some(bot_id) => self.repos.bots.find_by_id(bot_id).await?,
            None => None,
        };
        view.bot_name = bot.as_ref().map(|b| b.name.clone());

        if with_summary && !messages.is_empty() {
            let provider = bot.as_ref().and_then(|b| b.config.provider.as_deref());
            let prompt = format!("{SUMMARY_PROMPT}\n\n{}", transcript(&messages));
            view.summary = match self.intents.summarize(provider, &prompt).await {
                Ok(summary) if !summary.is_empty() => Some(summary),
                Ok(_) => None,
                Err(err) => {
                    debug!(conversation_id, "no hand-off summary: {err}");
                    None
                }
            };
        }
        Ok(view)
    }
}

fn transcript(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|m| {
            let speaker = match m.sender_type {
                SenderType::Contact => "Customer",
                SenderType::Bot => "Bot",
                SenderType::User => "Agent",
                SenderType::System => "System",
            };
            format!("{speaker}: {}", m.content)
        })
        .collect::<Vec<_>>()
        .join("\n")
}
