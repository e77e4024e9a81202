use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BotStatus {
    #[default]
    Active,
    Inactive,
    Training,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EscalationCondition {
    LowConfidence,
    Keyword,
    Sentiment,
    Intent,
    UserRequest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct EscalationRule {
    pub condition: EscalationCondition,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub priority: i32,
}

impl EscalationRule {
    pub fn new(condition: EscalationCondition, value: impl Into<String>) -> Self {
        Self {
            condition,
            value: value.into(),
            action: "escalate".into(),
            priority: 0,
        }
    }

    /// Human readable reason attached to the escalation.
    pub fn reason(&self) -> String {
        match self.condition {
            EscalationCondition::LowConfidence => "Low confidence in AI response".into(),
            EscalationCondition::Sentiment => "Negative sentiment detected".into(),
            EscalationCondition::Keyword => format!("Escalation keyword detected: {}", self.value),
            EscalationCondition::Intent => format!("Escalation intent detected: {}", self.value),
            EscalationCondition::UserRequest => "User requested human assistance".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct BotConfig {
    /// Name of the AI provider used for intent classification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default)]
    pub enabled_intents: Vec<String>,
    #[serde(default)]
    pub escalation_rules: Vec<EscalationRule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bot {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub status: BotStatus,
    /// Channel ids this bot answers on.
    pub channels: Vec<String>,
    pub config: BotConfig,
    pub created_at: DateTime<Utc>,
}

impl Bot {
    pub fn is_active(&self) -> bool {
        self.status == BotStatus::Active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_reasons() {
        assert_eq!(
            EscalationRule::new(EscalationCondition::Keyword, "refund").reason(),
            "Escalation keyword detected: refund"
        );
        assert_eq!(
            EscalationRule::new(EscalationCondition::LowConfidence, "").reason(),
            "Low confidence in AI response"
        );
    }

    #[test]
    fn rules_parse_from_snake_case() {
        let rule: EscalationRule =
            serde_json::from_str(r#"{"condition":"low_confidence","value":""}"#).unwrap();
        assert_eq!(rule.condition, EscalationCondition::LowConfidence);
        assert_eq!(rule.priority, 0);
    }
}
