use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use super::{AiProvider, Intent, MessageAnalysis, Sentiment, SentimentLabel};
use crate::domain::{EscalationCondition, EscalationRule};
use crate::error::{GatewayError, Result};

pub const CONFIDENCE_THRESHOLD: f64 = 0.6;
pub const ESCALATE_INTENT: &str = "escalate";
pub const UNKNOWN_INTENT: &str = "unknown";

pub const COMMON_INTENTS: &[&str] = &[
    "greeting", "goodbye", "thanks", "help", "complaint", "inquiry", "purchase", "refund",
    "support", "feedback", "escalate", "unknown",
];

const KEYWORD_CONFIDENCE: f64 = 0.7;
const UNKNOWN_CONFIDENCE: f64 = 0.3;

const ESCALATE_WORDS: &[&str] = &[
    "human", "agent", "atendente", "pessoa", "humano", "falar com alguém", "talk to someone",
];
const COMPLAINT_WORDS: &[&str] = &["complaint", "reclamação", "problema", "issue", "bug", "error", "erro"];
const HELP_WORDS: &[&str] = &["help", "ajuda", "socorro", "support", "suporte", "assist"];
const THANKS_WORDS: &[&str] = &["thank", "thanks", "obrigado", "obrigada", "valeu", "agradeço"];
const GOODBYE_WORDS: &[&str] = &["bye", "goodbye", "see you", "tchau", "adeus", "até"];
const GREETING_WORDS: &[&str] = &[
    "hi", "hello", "hey", "good morning", "good afternoon", "good evening", "ola", "oi",
];

/// Checked in this order; the first category with a hit wins.
const KEYWORD_INTENTS: &[(&str, &[&str])] = &[
    (ESCALATE_INTENT, ESCALATE_WORDS),
    ("complaint", COMPLAINT_WORDS),
    ("help", HELP_WORDS),
    ("thanks", THANKS_WORDS),
    ("goodbye", GOODBYE_WORDS),
    ("greeting", GREETING_WORDS),
];

const POSITIVE_WORDS: &[&str] = &[
    "great", "awesome", "excellent", "good", "love", "happy", "thanks", "perfect", "amazing",
    "wonderful", "ótimo", "excelente", "maravilhoso", "feliz",
];
const NEGATIVE_WORDS: &[&str] = &[
    "bad", "terrible", "awful", "hate", "angry", "frustrated", "disappointed", "horrible", "worst",
    "ruim", "péssimo", "horrível", "frustrado", "decepcionado", "raiva",
];

/// Classifies intent and sentiment through the configured providers, with
/// keyword matching when none is configured or the call fails.
#[derive(Clone)]
pub struct IntentService {
    providers: HashMap<String, Arc<dyn AiProvider>>,
    default_provider: Option<String>,
    threshold: f64,
    keyword_fallback: bool,
}

impl Default for IntentService {
    fn default() -> Self {
        Self::new()
    }
}

impl IntentService {
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
            default_provider: None,
            threshold: CONFIDENCE_THRESHOLD,
            keyword_fallback: true,
        }
    }

    /// Registers a provider; the first one becomes the default.
    pub fn with_provider(mut self, provider: Arc<dyn AiProvider>) -> Self {
        let name = provider.name().to_string();
        self.default_provider.get_or_insert_with(|| name.clone());
        self.providers.insert(name, provider);
        self
    }

    /// Provider failures surface as errors instead of falling back to keywords.
    pub fn without_keyword_fallback(mut self) -> Self {
        self.keyword_fallback = false;
        self
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn provider(&self, name: Option<&str>) -> Option<Arc<dyn AiProvider>> {
        let name = name.filter(|n| !n.is_empty()).or(self.default_provider.as_deref())?;
        self.providers.get(name).cloned()
    }

    pub async fn analyze_message(
        &self,
        content: &str,
        provider: Option<&str>,
        enabled_intents: &[String],
    ) -> Result<MessageAnalysis> {
        if content.trim().is_empty() {
            return Err(GatewayError::validation("nothing to analyze"));
        }
        let intents: Vec<String> = if enabled_intents.is_empty() {
            COMMON_INTENTS.iter().map(|s| s.to_string()).collect()
        } else {
            enabled_intents.to_vec()
        };

        let Some(ai) = self.provider(provider) else {
            return Ok(MessageAnalysis {
                intent: Some(classify_by_keywords(content, &intents)),
                sentiment: sentiment_by_keywords(content),
                source: "keywords".into(),
            });
        };

        let (intent, source) = match ai.classify_intent(content, &intents).await {
            Ok(intent) => (intent, ai.name().to_string()),
            Err(err) if !self.keyword_fallback => return Err(err),
            Err(err) => {
                warn!(provider = ai.name(), "intent classification failed, using keywords: {err}");
                (classify_by_keywords(content, &intents), "keywords".to_string())
            }
        };
        let sentiment = match ai.analyze_sentiment(content).await {
            Ok(sentiment) => sentiment,
            Err(err) if !self.keyword_fallback => return Err(err),
            Err(err) => {
                warn!(provider = ai.name(), "sentiment analysis failed, using keywords: {err}");
                sentiment_by_keywords(content)
            }
        };
        debug!(intent = %intent.name, confidence = intent.confidence, %source, "message analyzed");
        Ok(MessageAnalysis {
            intent: Some(intent),
            sentiment,
            source,
        })
    }

    /// First rule the analysis satisfies, highest rule priority first.
    /// Keyword rules are matched separately against message text.
    pub fn should_escalate<'a>(
        &self,
        analysis: &MessageAnalysis,
        rules: &'a [EscalationRule],
    ) -> Option<&'a EscalationRule> {
        let mut ordered: Vec<&EscalationRule> = rules.iter().collect();
        ordered.sort_by(|a, b| b.priority.cmp(&a.priority));
        ordered.into_iter().find(|rule| self.rule_matches(analysis, rule))
    }

    fn rule_matches(&self, analysis: &MessageAnalysis, rule: &EscalationRule) -> bool {
        let intent = analysis.intent.as_ref();
        match rule.condition {
            EscalationCondition::LowConfidence => {
                let threshold = rule.value.trim().parse().unwrap_or(self.threshold);
                intent.is_some_and(|i| i.confidence < threshold)
            }
            EscalationCondition::Sentiment => analysis
                .sentiment
                .label
                .as_ref()
                .eq_ignore_ascii_case(rule.value.trim()),
            EscalationCondition::Intent => intent.is_some_and(|i| i.name == rule.value),
            EscalationCondition::UserRequest => intent.is_some_and(|i| i.name == ESCALATE_INTENT),
            EscalationCondition::Keyword => false,
        }
    }

    /// Short hand-off summary from the provider.
    pub async fn summarize(&self, provider: Option<&str>, prompt: &str) -> Result<String> {
        let ai = self
            .provider(provider)
            .ok_or_else(|| GatewayError::not_found("no ai provider configured"))?;
        Ok(ai.complete(prompt).await?.trim().to_string())
    }
}

/// Lowercased words of `text`; punctuation and whitespace separate them.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Whole-word match. Multi-word phrases must appear as consecutive tokens.
pub fn contains_phrase(tokens: &[String], phrase: &str) -> bool {
    let wanted = tokenize(phrase);
    !wanted.is_empty() && tokens.windows(wanted.len()).any(|window| window == wanted.as_slice())
}

fn contains_any<'a>(tokens: &[String], words: &[&'a str]) -> Vec<&'a str> {
    words.iter().copied().filter(|w| contains_phrase(tokens, w)).collect()
}

/// Keyword classification restricted to `allowed` intents.
pub fn classify_by_keywords(content: &str, allowed: &[String]) -> Intent {
    let tokens = tokenize(content);
    KEYWORD_INTENTS
        .iter()
        .filter(|(name, _)| allowed.iter().any(|a| a.as_str() == *name))
        .find(|(_, words)| !contains_any(&tokens, words).is_empty())
        .map(|(name, _)| Intent::new(*name, KEYWORD_CONFIDENCE))
        .unwrap_or_else(|| Intent::new(UNKNOWN_INTENT, UNKNOWN_CONFIDENCE))
}

pub fn sentiment_by_keywords(content: &str) -> Sentiment {
    let tokens = tokenize(content);
    let positive = contains_any(&tokens, POSITIVE_WORDS).len() as f64;
    let negative = contains_any(&tokens, NEGATIVE_WORDS).len() as f64;
    let total = positive + negative + 1.0;
    if positive > negative {
        Sentiment {
            label: SentimentLabel::Positive,
            score: positive / total,
            confidence: 0.6,
        }
    } else if negative > positive {
        Sentiment {
            label: SentimentLabel::Negative,
            score: -negative / total,
            confidence: 0.6,
        }
    } else {
        Sentiment {
            label: SentimentLabel::Neutral,
            score: 0.0,
            confidence: 0.5,
        }
    }
}

/// Escalation-relevant words present in `content`.
pub fn extract_keywords(content: &str) -> Vec<String> {
    let tokens = tokenize(content);
    let mut found: Vec<String> = Vec::new();
    for words in [ESCALATE_WORDS, COMPLAINT_WORDS, NEGATIVE_WORDS, HELP_WORDS] {
        for word in contains_any(&tokens, words) {
            if !found.iter().any(|f| f == word) {
                found.push(word.to_string());
            }
        }
    }
    found
}
