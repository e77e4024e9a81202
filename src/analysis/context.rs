use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{AsRefStr, Display, EnumString};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{Intent, Sentiment};
use crate::domain::new_id;
use crate::error::Result;
use crate::repository::ContextRepository;

/// Window size that triggers trimming, and the size it is trimmed to.
pub const MAX_WINDOW: usize = 20;
pub const TRIMMED_WINDOW: usize = 10;

pub const STATE_ACTIVE_FLOW: &str = "active_flow_id";
pub const STATE_CURRENT_NODE: &str = "current_node_id";
pub const STATE_COLLECTED_DATA: &str = "collected_data";

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ContextRole {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextMessage {
    pub role: ContextRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

/// Rolling bot-side memory of one conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationContext {
    pub id: String,
    pub conversation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bot_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<Intent>,
    #[serde(default)]
    pub entities: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sentiment: Option<Sentiment>,
    #[serde(default)]
    pub context_window: Vec<ContextMessage>,
    /// Flow engine state: active flow, current node, collected data.
    #[serde(default)]
    pub state: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_analysis_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationContext {
    pub fn new(conversation_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            conversation_id: conversation_id.into(),
            bot_id: None,
            intent: None,
            entities: HashMap::new(),
            sentiment: None,
            context_window: Vec::new(),
            state: HashMap::new(),
            last_analysis_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn push(&mut self, role: ContextRole, content: impl Into<String>, message_id: Option<String>) {
        self.context_window.push(ContextMessage {
            role,
            content: content.into(),
            timestamp: Utc::now(),
            message_id,
        });
        if self.context_window.len() > MAX_WINDOW {
            let drop = self.context_window.len() - TRIMMED_WINDOW;
            self.context_window.drain(..drop);
        }
    }

    fn state_str(&self, key: &str) -> Option<String> {
        self.state.get(key).and_then(Value::as_str).map(str::to_string)
    }

    pub fn active_flow_id(&self) -> Option<String> {
        self.state_str(STATE_ACTIVE_FLOW)
    }

    pub fn current_node_id(&self) -> Option<String> {
        self.state_str(STATE_CURRENT_NODE)
    }

    pub fn collected_data(&self) -> HashMap<String, Value> {
        match self.state.get(STATE_COLLECTED_DATA) {
            Some(Value::Object(map)) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            _ => HashMap::new(),
        }
    }
}

type Slot = Arc<Mutex<ConversationContext>>;

/// Cached access to conversation contexts. Every mutation is written
/// through to the repository while the context's lock is held.
#[derive(Clone)]
pub struct ContextService {
    repo: Arc<dyn ContextRepository>,
    cache: Cache<String, Slot>,
}

impl ContextService {
    pub fn new(repo: Arc<dyn ContextRepository>, idle: Duration) -> Self {
        let cache = Cache::builder()
            .time_to_idle(idle)
            .eviction_listener(|key: Arc<String>, _value: Slot, cause| {
                debug!("context evicted: conversation={}, cause={:?}", key, cause);
            })
            .build();
        Self { repo, cache }
    }

    async fn slot(&self, conversation_id: &str) -> Result<Slot> {
        if let Some(slot) = self.cache.get(conversation_id).await {
            return Ok(slot);
        }
        let context = match self.repo.find_by_conversation(conversation_id).await? {
            Some(context) => context,
            None => {
                let context = ConversationContext::new(conversation_id);
                self.repo.save(&context).await?;
                context
            }
        };
        Ok(self
            .cache
            .get_with(conversation_id.to_string(), async move { Arc::new(Mutex::new(context)) })
            .await)
    }

    pub async fn get_or_create(&self, conversation_id: &str) -> Result<ConversationContext> {
        let slot = self.slot(conversation_id).await?;
        let context = slot.lock().await.clone();
        Ok(context)
    }

    /// Cached or stored context, without creating one.
    pub async fn get(&self, conversation_id: &str) -> Result<Option<ConversationContext>> {
        if let Some(slot) = self.cache.get(conversation_id).await {
            return Ok(Some(slot.lock().await.clone()));
        }
        self.repo.find_by_conversation(conversation_id).await
    }

    async fn update<F>(&self, conversation_id: &str, change: F) -> Result<ConversationContext>
    where
        F: FnOnce(&mut ConversationContext) + Send,
    {
        let slot = self.slot(conversation_id).await?;
        let mut context = slot.lock().await;
        let before = context.clone();
        change(&mut *context);
        context.updated_at = Utc::now();
        if let Err(err) = self.repo.save(&*context).await {
            warn!(conversation_id, "context save failed: {err}");
            *context = before;
            return Err(err);
        }
        Ok(context.clone())
    }

    pub async fn add_user_message(
        &self,
        conversation_id: &str,
        content: &str,
        message_id: Option<String>,
    ) -> Result<ConversationContext> {
        self.update(conversation_id, |c| c.push(ContextRole::User, content, message_id))
            .await
    }

    pub async fn add_assistant_message(
        &self,
        conversation_id: &str,
        content: &str,
        message_id: Option<String>,
    ) -> Result<ConversationContext> {
        self.update(conversation_id, |c| c.push(ContextRole::Assistant, content, message_id))
            .await
    }

    pub async fn add_system_message(&self, conversation_id: &str, content: &str) -> Result<ConversationContext> {
        self.update(conversation_id, |c| c.push(ContextRole::System, content, None))
            .await
    }

    pub async fn set_bot(&self, conversation_id: &str, bot_id: &str) -> Result<ConversationContext> {
        self.update(conversation_id, |c| c.bot_id = Some(bot_id.to_string()))
            .await
    }

    pub async fn clear_bot(&self, conversation_id: &str) -> Result<ConversationContext> {
        self.update(conversation_id, |c| c.bot_id = None).await
    }

    pub async fn update_intent(&self, conversation_id: &str, intent: Intent) -> Result<ConversationContext> {
        self.update(conversation_id, |c| {
            for (key, value) in &intent.entities {
                c.entities.insert(key.clone(), value.clone());
            }
            c.intent = Some(intent);
            c.last_analysis_at = Some(Utc::now());
        })
        .await
    }

    pub async fn update_sentiment(
        &self,
        conversation_id: &str,
        sentiment: Sentiment,
    ) -> Result<ConversationContext> {
        self.update(conversation_id, |c| {
            c.sentiment = Some(sentiment);
            c.last_analysis_at = Some(Utc::now());
        })
        .await
    }

    pub async fn set_entity(&self, conversation_id: &str, key: &str, value: &str) -> Result<ConversationContext> {
        self.update(conversation_id, |c| {
            c.entities.insert(key.to_string(), value.to_string());
        })
        .await
    }

    pub async fn set_state(&self, conversation_id: &str, key: &str, value: Value) -> Result<ConversationContext> {
        self.update(conversation_id, |c| {
            c.state.insert(key.to_string(), value);
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::SentimentLabel;
    use crate::repository::InMemoryStore;
    use serde_json::json;

    fn service() -> (ContextService, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        (ContextService::new(store.clone(), Duration::from_secs(60)), store)
    }

    #[test]
    fn window_trims_to_latest_ten_past_twenty() {
        let mut context = ConversationContext::new("conv");
        for i in 0..20 {
            context.push(ContextRole::User, format!("m{i}"), None);
        }
        assert_eq!(context.context_window.len(), 20);

        context.push(ContextRole::Assistant, "m20", None);
        assert_eq!(context.context_window.len(), 10);
        assert_eq!(context.context_window[0].content, "m11");
        assert_eq!(context.context_window[9].content, "m20");
    }

    #[test]
    fn flow_state_accessors() {
        let mut context = ConversationContext::new("conv");
        assert!(context.active_flow_id().is_none());
        context.state.insert(STATE_ACTIVE_FLOW.into(), json!("checkout"));
        context.state.insert(STATE_CURRENT_NODE.into(), json!("ask_address"));
        context
            .state
            .insert(STATE_COLLECTED_DATA.into(), json!({"zip": "01000"}));
        assert_eq!(context.active_flow_id().as_deref(), Some("checkout"));
        assert_eq!(context.current_node_id().as_deref(), Some("ask_address"));
        assert_eq!(context.collected_data()["zip"], json!("01000"));
    }

    #[tokio::test]
    async fn mutations_are_written_through() {
        let (contexts, store) = service();
        assert!(contexts.get("conv").await.unwrap().is_none());

        contexts.set_bot("conv", "bot-1").await.unwrap();
        contexts
            .add_user_message("conv", "hello", Some("m1".into()))
            .await
            .unwrap();
        let mut intent = Intent::new("purchase", 0.9);
        intent.entities.insert("product".into(), "shoes".into());
        contexts.update_intent("conv", intent).await.unwrap();
        contexts
            .update_sentiment(
                "conv",
                Sentiment {
                    label: SentimentLabel::Positive,
                    score: 0.5,
                    confidence: 0.6,
                },
            )
            .await
            .unwrap();

        let stored = store.find_by_conversation("conv").await.unwrap().unwrap();
        assert_eq!(stored.bot_id.as_deref(), Some("bot-1"));
        assert_eq!(stored.context_window.len(), 1);
        assert_eq!(stored.entities["product"], "shoes");
        assert_eq!(stored.intent.unwrap().name, "purchase");
        assert!(stored.last_analysis_at.is_some());

        let cleared = contexts.clear_bot("conv").await.unwrap();
        assert!(cleared.bot_id.is_none());
        assert_eq!(contexts.get_or_create("conv").await.unwrap().id, stored.id);
    }

    #[tokio::test]
    async fn stored_contexts_are_loaded() {
        let (contexts, store) = service();
        let mut context = ConversationContext::new("conv");
        context.bot_id = Some("bot-9".into());
        ContextRepository::save(store.as_ref(), &context).await.unwrap();

        let loaded = contexts.get_or_create("conv").await.unwrap();
        assert_eq!(loaded.id, context.id);
        assert_eq!(loaded.bot_id.as_deref(), Some("bot-9"));
    }
}
