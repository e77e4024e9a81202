use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum UserRole {
    Admin,
    #[default]
    Agent,
    Viewer,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum UserStatus {
    #[default]
    Active,
    Inactive,
    Suspended,
}

/// A human operator who can take over conversations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct User {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub role: UserRole,
    #[serde(default)]
    pub status: UserStatus,
    /// Channels the user works. Empty means every channel of the tenant.
    #[serde(default)]
    pub channels: Vec<String>,
}

impl User {
    pub fn can_take(&self, tenant_id: &str, channel_id: &str) -> bool {
        self.tenant_id == tenant_id
            && self.status == UserStatus::Active
            && matches!(self.role, UserRole::Agent | UserRole::Admin)
            && (self.channels.is_empty() || self.channels.iter().any(|c| c == channel_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent() -> User {
        User {
            id: "u1".into(),
            tenant_id: "t".into(),
            name: "Bea".into(),
            email: String::new(),
            role: UserRole::Agent,
            status: UserStatus::Active,
            channels: vec![],
        }
    }

    #[test]
    fn availability() {
        let mut user = agent();
        assert!(user.can_take("t", "any"));
        assert!(!user.can_take("other", "any"));

        user.channels = vec!["wa".into()];
        assert!(user.can_take("t", "wa"));
        assert!(!user.can_take("t", "sms"));

        user.status = UserStatus::Suspended;
        assert!(!user.can_take("t", "wa"));

        let mut viewer = agent();
        viewer.role = UserRole::Viewer;
        assert!(!viewer.can_take("t", "any"));
    }
}
