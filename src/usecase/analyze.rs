use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::analysis::intent::{ESCALATE_INTENT, contains_phrase, extract_keywords, tokenize};
use crate::analysis::{ContextService, Intent, IntentService, MessageAnalysis, Sentiment};
use crate::domain::{Bot, EscalationCondition};
use crate::error::Result;
use crate::events::{Event, EventSink, EventType};
use crate::repository::Repositories;

pub const ESCALATE_INTENT_REASON: &str = "User requested to talk to a human";

#[derive(Debug, Clone)]
pub struct AnalyzeMessageInput {
    pub tenant_id: String,
    pub conversation_id: String,
    pub channel_id: String,
    pub message_id: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AnalyzeMessageOutput {
    pub bot_id: Option<String>,
    pub intent: Option<Intent>,
    pub sentiment: Sentiment,
    pub keywords: Vec<String>,
    pub should_escalate: bool,
    pub escalate_reason: Option<String>,
}

/// Runs the channel's bot over an inbound message: records it in the
/// conversation context, classifies it and decides whether a human should
/// take over.
pub struct AnalyzeMessage {
    repos: Repositories,
    intents: Arc<IntentService>,
    contexts: ContextService,
    events: Arc<dyn EventSink>,
}

impl AnalyzeMessage {
    pub fn new(
        repos: Repositories,
        intents: Arc<IntentService>,
        contexts: ContextService,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            repos,
            intents,
            contexts,
            events,
        }
    }

    pub async fn execute(&self, input: AnalyzeMessageInput) -> Result<AnalyzeMessageOutput> {
        let mut output = AnalyzeMessageOutput::default();
        let Some(bot) = self.repos.bots.find_by_channel(&input.channel_id).await? else {
            return Ok(output);
        };
        if !bot.is_active() {
            debug!(bot_id = %bot.id, "bot inactive, skipping analysis");
            return Ok(output);
        }
        output.bot_id = Some(bot.id.clone());

        self.record_in_context(&bot, &input).await;

        let analysis = match self
            .intents
            .analyze_message(
                &input.content,
                bot.config.provider.as_deref(),
                &bot.config.enabled_intents,
            )
            .await
        {
            Ok(analysis) => Some(analysis),
            Err(err) => {
                warn!(message_id = %input.message_id, "analysis failed: {err}");
                None
            }
        };
        if let Some(analysis) = &analysis {
            self.store_analysis(&input.conversation_id, analysis).await;
            output.intent = analysis.intent.clone();
            output.sentiment = analysis.sentiment.clone();
        }
        output.keywords = extract_keywords(&input.content);

        output.escalate_reason = self.escalation_reason(&bot, analysis.as_ref(), &input.content);
        output.should_escalate = output.escalate_reason.is_some();

        self.events.emit(
            Event::new(EventType::MessageAnalyzed, &input.tenant_id)
                .with("message_id", input.message_id.as_str())
                .with("conversation_id", input.conversation_id.as_str())
                .with("sentiment", output.sentiment.label.as_ref())
                .with("should_escalate", output.should_escalate)
                .with_opt("intent", output.intent.as_ref().map(|i| i.name.clone()))
                .with_opt("confidence", output.intent.as_ref().map(|i| i.confidence))
                .with_opt("bot_id", output.bot_id.clone())
                .with_opt("escalate_reason", output.escalate_reason.clone()),
        );
        Ok(output)
    }

    async fn record_in_context(&self, bot: &Bot, input: &AnalyzeMessageInput) {
        let conversation_id = input.conversation_id.as_str();
        match self.contexts.get_or_create(conversation_id).await {
            Ok(context) if context.bot_id.is_none() => {
                if let Err(err) = self.contexts.set_bot(conversation_id, &bot.id).await {
                    warn!(conversation_id, "binding bot to context: {err}");
                }
            }
            Ok(_) => {}
            Err(err) => warn!(conversation_id, "loading context: {err}"),
        }
        if let Err(err) = self
            .contexts
            .add_user_message(conversation_id, &input.content, Some(input.message_id.clone()))
            .await
        {
            warn!(conversation_id, "adding message to context: {err}");
        }
    }

    async fn store_analysis(&self, conversation_id: &str, analysis: &MessageAnalysis) {
        if let Some(intent) = &analysis.intent {
            if let Err(err) = self.contexts.update_intent(conversation_id, intent.clone()).await {
                warn!(conversation_id, "storing intent: {err}");
            }
        }
        if let Err(err) = self
            .contexts
            .update_sentiment(conversation_id, analysis.sentiment.clone())
            .await
        {
            warn!(conversation_id, "storing sentiment: {err}");
        }
    }

    /// Rule matches on the analysis come first, then keyword rules against
    /// the words of the text, then an explicit escalate intent.
    fn escalation_reason(
        &self,
        bot: &Bot,
        analysis: Option<&MessageAnalysis>,
        content: &str,
    ) -> Option<String> {
        let rules = &bot.config.escalation_rules;
        if let Some(rule) = analysis.and_then(|a| self.intents.should_escalate(a, rules)) {
            return Some(rule.reason());
        }

        let tokens = tokenize(content);
        let keyword_rule = rules
            .iter()
            .filter(|r| r.condition == EscalationCondition::Keyword)
            .find(|r| contains_phrase(&tokens, &r.value));
        if let Some(rule) = keyword_rule {
            return Some(rule.reason());
        }

        analysis
            .and_then(|a| a.intent.as_ref())
            .filter(|i| i.name == ESCALATE_INTENT)
            .map(|_| ESCALATE_INTENT_REASON.to_string())
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use channel_plugin::message::ChannelType;
    use chrono::Utc;

    use super::*;
    use crate::analysis::{AiProvider, SentimentLabel};
    use crate::domain::{BotConfig, BotStatus, EscalationRule};
    use crate::error::GatewayError;
    use crate::events::testing::RecordingSink;
    use crate::repository::BotRepository;
    use crate::usecase::fixtures::{self, Fixture};

    fn bot(rules: Vec<EscalationRule>, provider: Option<&str>) -> Bot {
        Bot {
            id: "bot-1".into(),
            tenant_id: "t1".into(),
            name: "Helper".into(),
            status: BotStatus::Active,
            channels: vec!["ch-1".into()],
            config: BotConfig {
                provider: provider.map(str::to_string),
                enabled_intents: Vec::new(),
                escalation_rules: rules,
            },
            created_at: Utc::now(),
        }
    }

    fn analyzer(fx: &Fixture, intents: IntentService) -> (AnalyzeMessage, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let usecase = AnalyzeMessage::new(fx.repos.clone(), Arc::new(intents), fx.contexts.clone(), sink.clone());
        (usecase, sink)
    }

    fn input(fx: &Fixture, content: &str) -> AnalyzeMessageInput {
        AnalyzeMessageInput {
            tenant_id: "t1".into(),
            conversation_id: fx.conversation.id.clone(),
            channel_id: fx.channel.id.clone(),
            message_id: "m1".into(),
            content: content.into(),
        }
    }

    struct Unsure;

    #[async_trait]
    impl AiProvider for Unsure {
        fn name(&self) -> &str {
            "unsure"
        }
        async fn classify_intent(&self, _text: &str, _intents: &[String]) -> Result<Intent> {
            Ok(Intent::new("question", 0.3))
        }
        async fn analyze_sentiment(&self, _text: &str) -> Result<Sentiment> {
            Ok(Sentiment {
                label: SentimentLabel::Negative,
                score: -0.7,
                confidence: 0.9,
            })
        }
        async fn complete(&self, _prompt: &str) -> Result<String> {
            Err(GatewayError::internal("not used"))
        }
    }

    #[tokio::test]
    async fn no_bot_means_nothing_to_do() {
        let fx = fixtures::seeded(ChannelType::Whatsapp).await;
        let (usecase, sink) = analyzer(&fx, IntentService::new());
        let out = usecase.execute(input(&fx, "hello")).await.unwrap();
        assert_eq!(out, AnalyzeMessageOutput::default());
        assert!(sink.events().is_empty());

        let mut inactive = bot(Vec::new(), None);
        inactive.status = BotStatus::Inactive;
        BotRepository::save(fx.store.as_ref(), inactive).await.unwrap();
        let out = usecase.execute(input(&fx, "hello")).await.unwrap();
        assert!(out.bot_id.is_none());
    }

    #[tokio::test]
    async fn low_confidence_rule_escalates() {
        let fx = fixtures::seeded(ChannelType::Whatsapp).await;
        let rules = vec![EscalationRule::new(EscalationCondition::LowConfidence, "0.5")];
        BotRepository::save(fx.store.as_ref(), bot(rules, Some("unsure"))).await.unwrap();
        let (usecase, sink) = analyzer(&fx, IntentService::new().with_provider(Arc::new(Unsure)));

        let out = usecase.execute(input(&fx, "what about the thing")).await.unwrap();
        assert!(out.should_escalate);
        assert_eq!(out.escalate_reason.as_deref(), Some("Low confidence in AI response"));
        assert_eq!(out.sentiment.label, SentimentLabel::Negative);

        let analyzed = &sink.of(EventType::MessageAnalyzed)[0];
        assert_eq!(analyzed.payload["should_escalate"], true);
        assert_eq!(analyzed.payload["intent"], "question");

        let context = fx.contexts.get(&fx.conversation.id).await.unwrap().unwrap();
        assert_eq!(context.bot_id.as_deref(), Some("bot-1"));
        assert_eq!(context.context_window.len(), 1);
        assert_eq!(context.intent.unwrap().name, "question");
    }

    #[tokio::test]
    async fn keyword_rule_matches_text() {
        let fx = fixtures::seeded(ChannelType::Whatsapp).await;
        let rules = vec![EscalationRule::new(EscalationCondition::Keyword, "Refund")];
        BotRepository::save(fx.store.as_ref(), bot(rules, None)).await.unwrap();
        let (usecase, _) = analyzer(&fx, IntentService::new());

        let out = usecase
            .execute(input(&fx, "I want a REFUND for my order"))
            .await
            .unwrap();
        assert!(out.should_escalate);
        assert_eq!(out.escalate_reason.as_deref(), Some("Escalation keyword detected: Refund"));
    }

    struct Down;

    #[async_trait]
    impl AiProvider for Down {
        fn name(&self) -> &str {
            "down"
        }
        async fn classify_intent(&self, _text: &str, _intents: &[String]) -> Result<Intent> {
            Err(GatewayError::internal("provider down"))
        }
        async fn analyze_sentiment(&self, _text: &str) -> Result<Sentiment> {
            Err(GatewayError::internal("provider down"))
        }
        async fn complete(&self, _prompt: &str) -> Result<String> {
            Err(GatewayError::internal("provider down"))
        }
    }

    #[tokio::test]
    async fn keyword_rule_escalates_when_analysis_fails() {
        let fx = fixtures::seeded(ChannelType::Whatsapp).await;
        let rules = vec![
            EscalationRule::new(EscalationCondition::Sentiment, "negative"),
            EscalationRule::new(EscalationCondition::Keyword, "refund"),
        ];
        BotRepository::save(fx.store.as_ref(), bot(rules, Some("down"))).await.unwrap();
        let intents = IntentService::new()
            .with_provider(Arc::new(Down))
            .without_keyword_fallback();
        let (usecase, sink) = analyzer(&fx, intents);

        let out = usecase.execute(input(&fx, "I hate this, refund me")).await.unwrap();
        assert!(out.intent.is_none());
        assert_eq!(out.sentiment.label, SentimentLabel::Neutral);
        assert!(out.should_escalate);
        assert_eq!(out.escalate_reason.as_deref(), Some("Escalation keyword detected: refund"));

        let analyzed = &sink.of(EventType::MessageAnalyzed)[0];
        assert_eq!(analyzed.payload["should_escalate"], true);
        assert!(analyzed.payload.get("intent").is_none());

        let context = fx.contexts.get(&fx.conversation.id).await.unwrap().unwrap();
        assert!(context.intent.is_none());
        assert_eq!(context.context_window.len(), 1);
    }

    #[tokio::test]
    async fn keyword_rule_needs_the_whole_word() {
        let fx = fixtures::seeded(ChannelType::Whatsapp).await;
        let rules = vec![EscalationRule::new(EscalationCondition::Keyword, "law")];
        BotRepository::save(fx.store.as_ref(), bot(rules, None)).await.unwrap();
        let (usecase, _) = analyzer(&fx, IntentService::new());

        let out = usecase.execute(input(&fx, "my lawn mower arrived")).await.unwrap();
        assert!(!out.should_escalate);
        let out = usecase.execute(input(&fx, "I will call the law on you")).await.unwrap();
        assert_eq!(out.escalate_reason.as_deref(), Some("Escalation keyword detected: law"));
    }

    #[tokio::test]
    async fn escalate_intent_without_rules() {
        let fx = fixtures::seeded(ChannelType::Whatsapp).await;
        BotRepository::save(fx.store.as_ref(), bot(Vec::new(), None)).await.unwrap();
        let (usecase, _) = analyzer(&fx, IntentService::new());

        let out = usecase
            .execute(input(&fx, "please let me talk to a human agent"))
            .await
            .unwrap();
        assert_eq!(out.intent.as_ref().map(|i| i.name.as_str()), Some(ESCALATE_INTENT));
        assert!(out.should_escalate);
        assert_eq!(out.escalate_reason.as_deref(), Some(ESCALATE_INTENT_REASON));
        assert!(out.keywords.contains(&"agent".to_string()));
    }

    #[tokio::test]
    async fn empty_content_still_reports() {
        let fx = fixtures::seeded(ChannelType::Whatsapp).await;
        BotRepository::save(fx.store.as_ref(), bot(Vec::new(), None)).await.unwrap();
        let (usecase, sink) = analyzer(&fx, IntentService::new());

        let out = usecase.execute(input(&fx, "   ")).await.unwrap();
        assert!(out.intent.is_none());
        assert!(!out.should_escalate);
        assert_eq!(out.sentiment.label, SentimentLabel::Neutral);
        assert_eq!(sink.of(EventType::MessageAnalyzed).len(), 1);
    }
}
