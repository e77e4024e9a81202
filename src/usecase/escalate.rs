use std::sync::Arc;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{AsRefStr, Display, EnumString};
use tracing::{info, warn};

use crate::analysis::ContextService;
use crate::domain::conversation::{
    META_ESCALATED_AT, META_ESCALATED_BY, META_ESCALATED_FROM_BOT, META_ESCALATION_REASON,
};
use crate::domain::{Conversation, ConversationStatus, Priority};
use crate::error::{GatewayError, Result};
use crate::events::{Event, EventSink, EventType};
use crate::logger::Metrics;
use crate::repository::Repositories;

/// Seconds of expected wait per conversation ahead in the queue.
pub const SECONDS_PER_QUEUED: u64 = 120;

pub const USER_REQUEST_REASON: &str = "User requested human assistance";

/// Words in a bot's escalation reason that raise the priority to high.
pub const URGENT_MARKERS: &[&str] = &[
    "urgent",
    "urgente",
    "emergency",
    "emergência",
    "complaint",
    "reclamação",
    "angry",
    "raiva",
    "critical",
    "crítico",
];

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RequestedBy {
    Bot,
    User,
    Agent,
    System,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EscalationStatus {
    Assigned,
    Queued,
    AlreadyAssigned,
}

#[derive(Debug, Clone)]
pub struct EscalateInput {
    pub tenant_id: String,
    pub conversation_id: String,
    pub reason: String,
    pub priority: Priority,
    pub requested_by: RequestedBy,
    pub bot_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalateOutput {
    pub conversation_id: String,
    pub status: EscalationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_wait_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escalated_at: Option<DateTime<Utc>>,
}

/// Hands a conversation to a human: assigns the least loaded available
/// agent, or queues it by priority when nobody can take it.
pub struct EscalateConversation {
    repos: Repositories,
    contexts: ContextService,
    events: Arc<dyn EventSink>,
    metrics: Metrics,
}

impl EscalateConversation {
    pub fn new(
        repos: Repositories,
        contexts: ContextService,
        events: Arc<dyn EventSink>,
        metrics: Metrics,
    ) -> Self {
        Self {
            repos,
            contexts,
            events,
            metrics,
        }
    }

    pub async fn execute(&self, input: EscalateInput) -> Result<EscalateOutput> {
        let mut conversation = self
            .repos
            .conversations
            .find_by_id(&input.conversation_id)
            .await?
            .ok_or_else(|| GatewayError::not_found("conversation not found"))?;
        if conversation.tenant_id != input.tenant_id {
            return Err(GatewayError::forbidden("conversation does not belong to tenant"));
        }

        if let Some(assigned) = &conversation.assigned_user_id {
            return Ok(EscalateOutput {
                conversation_id: conversation.id.clone(),
                status: EscalationStatus::AlreadyAssigned,
                assigned_user_id: Some(assigned.clone()),
                queue_position: None,
                estimated_wait_seconds: None,
                escalated_at: conversation.escalated_at(),
            });
        }

        let escalated_at = Utc::now();
        conversation.status = ConversationStatus::Pending;
        conversation.priority = input.priority;
        let metadata = &mut conversation.metadata;
        metadata.insert(META_ESCALATION_REASON.into(), Value::from(input.reason.as_str()));
        metadata.insert(META_ESCALATED_BY.into(), Value::from(input.requested_by.as_ref()));
        metadata.insert(META_ESCALATED_AT.into(), Value::from(escalated_at.to_rfc3339()));
        if let Some(bot_id) = &input.bot_id {
            metadata.insert(META_ESCALATED_FROM_BOT.into(), Value::from(bot_id.as_str()));
        }

        let mut output = EscalateOutput {
            conversation_id: conversation.id.clone(),
            status: EscalationStatus::Queued,
            assigned_user_id: None,
            queue_position: None,
            estimated_wait_seconds: None,
            escalated_at: Some(escalated_at),
        };
        match self.pick_agent(&conversation).await {
            Some(agent_id) => {
                conversation.assigned_user_id = Some(agent_id.clone());
                conversation.status = ConversationStatus::Open;
                output.status = EscalationStatus::Assigned;
                output.assigned_user_id = Some(agent_id);
            }
            None => {
                let ahead = self
                    .repos
                    .conversations
                    .count_waiting(&conversation.tenant_id, conversation.priority, &conversation.id)
                    .await?;
                let position = ahead + 1;
                output.queue_position = Some(position);
                output.estimated_wait_seconds = Some(position * SECONDS_PER_QUEUED);
            }
        }
        conversation.updated_at = escalated_at;
        self.repos.conversations.update(&conversation).await?;

        if let Err(err) = self
            .contexts
            .add_system_message(&conversation.id, &format!("Conversation escalated: {}", input.reason))
            .await
        {
            warn!(conversation_id = %conversation.id, "recording escalation in context: {err}");
        }

        self.metrics
            .escalations
            .add(1, &[KeyValue::new("status", output.status.to_string())]);
        info!(
            conversation_id = %conversation.id,
            status = %output.status,
            priority = %conversation.priority,
            "conversation escalated"
        );
        self.events.emit(
            Event::new(EventType::ConversationEscalated, &conversation.tenant_id)
                .with("conversation_id", conversation.id.as_str())
                .with("channel_id", conversation.channel_id.as_str())
                .with("contact_id", conversation.contact_id.as_str())
                .with("reason", input.reason.as_str())
                .with("priority", conversation.priority.as_ref())
                .with("requested_by", input.requested_by.as_ref())
                .with("status", output.status.as_ref())
                .with_opt("bot_id", input.bot_id.clone())
                .with_opt("assigned_user_id", output.assigned_user_id.clone()),
        );
        Ok(output)
    }

    /// Least loaded available agent, ties going to the lowest agent id.
    async fn pick_agent(&self, conversation: &Conversation) -> Option<String> {
        let agents = match self
            .repos
            .users
            .find_available_agents(&conversation.tenant_id, &conversation.channel_id)
            .await
        {
            Ok(agents) => agents,
            Err(err) => {
                warn!(conversation_id = %conversation.id, "listing agents failed, queueing: {err}");
                return None;
            }
        };

        let mut best: Option<(u64, String)> = None;
        for agent in agents {
            let load = match self.repos.conversations.count_active_by_user(&agent.id).await {
                Ok(load) => load,
                Err(err) => {
                    warn!(agent_id = %agent.id, "counting agent load: {err}");
                    continue;
                }
            };
            let better = match &best {
                None => true,
                Some((best_load, best_id)) => (load, &agent.id) < (*best_load, best_id),
            };
            if better {
                best = Some((load, agent.id));
            }
        }
        best.map(|(_, id)| id)
    }

    /// Escalation requested by a bot. Urgent wording in the reason raises
    /// the priority to high.
    pub async fn escalate_from_bot(
        &self,
        tenant_id: &str,
        conversation_id: &str,
        bot_id: &str,
        reason: &str,
    ) -> Result<EscalateOutput> {
        self.execute(EscalateInput {
            tenant_id: tenant_id.to_string(),
            conversation_id: conversation_id.to_string(),
            reason: reason.to_string(),
            priority: bot_priority(reason),
            requested_by: RequestedBy::Bot,
            bot_id: Some(bot_id.to_string()),
        })
        .await
    }

    pub async fn escalate_from_user(&self, tenant_id: &str, conversation_id: &str) -> Result<EscalateOutput> {
        self.execute(EscalateInput {
            tenant_id: tenant_id.to_string(),
            conversation_id: conversation_id.to_string(),
            reason: USER_REQUEST_REASON.to_string(),
            priority: Priority::Normal,
            requested_by: RequestedBy::User,
            bot_id: None,
        })
        .await
    }
}

pub fn bot_priority(reason: &str) -> Priority {
    let reason = reason.to_lowercase();
    if URGENT_MARKERS.iter().any(|m| reason.contains(m)) {
        Priority::High
    } else {
        Priority::Normal
    }
}

#[cfg(test)]
mod tests {
    use channel_plugin::message::ChannelType;

    use super::*;
    use crate::domain::{Contact, User, UserRole, UserStatus};
    use crate::error::ErrorCode;
    use crate::events::testing::RecordingSink;
    use crate::repository::{ContactRepository, ConversationRepository, UserRepository};
    use crate::usecase::fixtures::{self, Fixture};

    fn escalator(fx: &Fixture) -> (EscalateConversation, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let usecase =
            EscalateConversation::new(fx.repos.clone(), fx.contexts.clone(), sink.clone(), Metrics::new());
        (usecase, sink)
    }

    fn agent(id: &str) -> User {
        User {
            id: id.into(),
            tenant_id: "t1".into(),
            name: id.into(),
            email: format!("{id}@example.com"),
            role: UserRole::Agent,
            status: UserStatus::Active,
            channels: Vec::new(),
        }
    }

    async fn another_conversation(fx: &Fixture, name: &str) -> Conversation {
        let contact = Contact::new("t1", name);
        ContactRepository::create(fx.store.as_ref(), &contact).await.unwrap();
        let conversation = Conversation::new("t1", &fx.channel.id, &contact.id);
        ConversationRepository::create(fx.store.as_ref(), &conversation)
            .await
            .unwrap();
        conversation
    }

    fn input(conversation_id: &str, priority: Priority) -> EscalateInput {
        EscalateInput {
            tenant_id: "t1".into(),
            conversation_id: conversation_id.into(),
            reason: "needs a human".into(),
            priority,
            requested_by: RequestedBy::Agent,
            bot_id: None,
        }
    }

    #[tokio::test]
    async fn queues_behind_waiting_conversations() {
        let fx = fixtures::seeded(ChannelType::Whatsapp).await;
        let (usecase, sink) = escalator(&fx);

        let first = another_conversation(&fx, "A").await;
        let second = another_conversation(&fx, "B").await;
        usecase.execute(input(&first.id, Priority::Normal)).await.unwrap();
        usecase.execute(input(&second.id, Priority::Normal)).await.unwrap();

        let out = usecase
            .execute(input(&fx.conversation.id, Priority::Normal))
            .await
            .unwrap();
        assert_eq!(out.status, EscalationStatus::Queued);
        assert_eq!(out.queue_position, Some(3));
        assert_eq!(out.estimated_wait_seconds, Some(360));

        let stored = ConversationRepository::find_by_id(fx.store.as_ref(), &fx.conversation.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, ConversationStatus::Pending);
        assert_eq!(stored.meta_str(META_ESCALATION_REASON), Some("needs a human"));
        assert_eq!(stored.meta_str(META_ESCALATED_BY), Some("agent"));
        assert!(stored.escalated_at().is_some());
        assert_eq!(sink.of(EventType::ConversationEscalated).len(), 3);
    }

    #[tokio::test]
    async fn higher_priority_jumps_the_queue() {
        let fx = fixtures::seeded(ChannelType::Whatsapp).await;
        let (usecase, _) = escalator(&fx);

        let low = another_conversation(&fx, "A").await;
        usecase.execute(input(&low.id, Priority::Low)).await.unwrap();
        let normal = another_conversation(&fx, "B").await;
        let out = usecase.execute(input(&normal.id, Priority::Normal)).await.unwrap();
        assert_eq!(out.queue_position, Some(1));

        let urgent = usecase
            .execute(input(&fx.conversation.id, Priority::Urgent))
            .await
            .unwrap();
        assert_eq!(urgent.queue_position, Some(1));
    }

    #[tokio::test]
    async fn positions_count_only_equal_or_higher_priority() {
        let fx = fixtures::seeded(ChannelType::Whatsapp).await;
        let (usecase, _) = escalator(&fx);

        let mut positions = Vec::new();
        for (name, priority) in [("A", Priority::Urgent), ("B", Priority::High), ("C", Priority::Normal)] {
            let conversation = another_conversation(&fx, name).await;
            let out = usecase.execute(input(&conversation.id, priority)).await.unwrap();
            positions.push(out.queue_position);
        }
        assert_eq!(positions, vec![Some(1), Some(2), Some(3)]);

        // the normal waiter is not ahead of a later high
        let late = usecase
            .execute(input(&fx.conversation.id, Priority::High))
            .await
            .unwrap();
        assert_eq!(late.queue_position, Some(3));
        assert_eq!(late.estimated_wait_seconds, Some(3 * SECONDS_PER_QUEUED));
    }

    #[tokio::test]
    async fn assigns_least_loaded_agent() {
        let fx = fixtures::seeded(ChannelType::Whatsapp).await;
        for id in ["agent-b", "agent-a", "agent-c"] {
            UserRepository::save(fx.store.as_ref(), agent(id)).await.unwrap();
        }
        let (usecase, sink) = escalator(&fx);

        // agent-a and agent-b get one each by id order, then agent-c
        let first = another_conversation(&fx, "A").await;
        let second = another_conversation(&fx, "B").await;
        let a = usecase.execute(input(&first.id, Priority::Normal)).await.unwrap();
        let b = usecase.execute(input(&second.id, Priority::Normal)).await.unwrap();
        let c = usecase
            .execute(input(&fx.conversation.id, Priority::Normal))
            .await
            .unwrap();
        assert_eq!(a.assigned_user_id.as_deref(), Some("agent-a"));
        assert_eq!(b.assigned_user_id.as_deref(), Some("agent-b"));
        assert_eq!(c.assigned_user_id.as_deref(), Some("agent-c"));
        assert_eq!(c.status, EscalationStatus::Assigned);
        assert!(c.queue_position.is_none());

        let stored = ConversationRepository::find_by_id(fx.store.as_ref(), &fx.conversation.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, ConversationStatus::Open);
        let event = &sink.of(EventType::ConversationEscalated)[2];
        assert_eq!(event.payload["assigned_user_id"], "agent-c");
    }

    #[tokio::test]
    async fn escalating_twice_does_not_reassign() {
        let fx = fixtures::seeded(ChannelType::Whatsapp).await;
        UserRepository::save(fx.store.as_ref(), agent("agent-a")).await.unwrap();
        let (usecase, sink) = escalator(&fx);

        let first = usecase
            .execute(input(&fx.conversation.id, Priority::Normal))
            .await
            .unwrap();
        UserRepository::save(fx.store.as_ref(), agent("agent-0")).await.unwrap();
        let second = usecase
            .execute(input(&fx.conversation.id, Priority::Urgent))
            .await
            .unwrap();

        assert_eq!(second.status, EscalationStatus::AlreadyAssigned);
        assert_eq!(second.assigned_user_id, first.assigned_user_id);
        assert_eq!(sink.of(EventType::ConversationEscalated).len(), 1);
        let stored = ConversationRepository::find_by_id(fx.store.as_ref(), &fx.conversation.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.priority, Priority::Normal);
    }

    #[tokio::test]
    async fn tenant_and_existence_are_checked() {
        let fx = fixtures::seeded(ChannelType::Whatsapp).await;
        let (usecase, _) = escalator(&fx);

        let err = usecase.execute(input("missing", Priority::Normal)).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);

        let mut foreign = input(&fx.conversation.id, Priority::Normal);
        foreign.tenant_id = "t2".into();
        let err = usecase.execute(foreign).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Forbidden);
    }

    #[tokio::test]
    async fn bot_and_user_entry_points() {
        let fx = fixtures::seeded(ChannelType::Whatsapp).await;
        let (usecase, sink) = escalator(&fx);

        usecase
            .escalate_from_bot("t1", &fx.conversation.id, "bot-1", "Cliente com RECLAMAÇÃO")
            .await
            .unwrap();
        let stored = ConversationRepository::find_by_id(fx.store.as_ref(), &fx.conversation.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.priority, Priority::High);
        assert_eq!(stored.meta_str(META_ESCALATED_FROM_BOT), Some("bot-1"));
        let event = &sink.of(EventType::ConversationEscalated)[0];
        assert_eq!(event.payload["requested_by"], "bot");
        assert_eq!(event.payload["bot_id"], "bot-1");

        let other = another_conversation(&fx, "B").await;
        usecase.escalate_from_user("t1", &other.id).await.unwrap();
        let stored = ConversationRepository::find_by_id(fx.store.as_ref(), &other.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.priority, Priority::Normal);
        assert_eq!(stored.meta_str(META_ESCALATION_REASON), Some(USER_REQUEST_REASON));
    }

    #[test]
    fn urgent_wording_raises_priority() {
        assert_eq!(bot_priority("customer is ANGRY"), Priority::High);
        assert_eq!(bot_priority("Problema crítico no pedido"), Priority::High);
        assert_eq!(bot_priority("low confidence"), Priority::Normal);
    }
}
