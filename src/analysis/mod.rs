//! Intent and sentiment analysis. Model calls go through [`AiProvider`];
//! everything here degrades to keyword matching when no provider answers.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

use crate::error::Result;

pub mod context;
pub mod intent;

pub use context::{ContextMessage, ContextService, ConversationContext};
pub use intent::IntentService;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Intent {
    pub name: String,
    pub confidence: f64,
    #[serde(default)]
    pub entities: HashMap<String, String>,
}

impl Intent {
    pub fn new(name: impl Into<String>, confidence: f64) -> Self {
        Self {
            name: name.into(),
            confidence,
            entities: HashMap::new(),
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SentimentLabel {
    Positive,
    #[default]
    Neutral,
    Negative,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Sentiment {
    pub label: SentimentLabel,
    /// -1.0 (negative) to 1.0 (positive).
    pub score: f64,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MessageAnalysis {
    pub intent: Option<Intent>,
    pub sentiment: Sentiment,
    /// Name of the provider that produced the intent, `keywords` for the
    /// fallback.
    pub source: String,
}

/// A language model collaborator. Implementations wrap provider HTTP APIs.
#[async_trait]
pub trait AiProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn classify_intent(&self, text: &str, intents: &[String]) -> Result<Intent>;

    async fn analyze_sentiment(&self, text: &str) -> Result<Sentiment>;

    /// Free-form completion, used for agent hand-off summaries.
    async fn complete(&self, prompt: &str) -> Result<String>;
}
