use channel_plugin::AdapterError;
use strum_macros::{AsRefStr, Display, EnumIter};
use thiserror::Error;

/// Stable error codes surfaced to callers and written to logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr, EnumIter)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Internal,
    Validation,
    NotFound,
    Forbidden,
    Conflict,
    ChannelDisconnected,
    RateLimited,
    Timeout,
    Plugin,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Forbidden(String),

    /// Duplicate external id and similar uniqueness violations.
    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    ChannelDisconnected(String),

    #[error("{0}")]
    RateLimited(String),

    #[error("{0}")]
    Timeout(String),

    #[error(transparent)]
    Plugin(#[from] AdapterError),

    #[error("{message}")]
    Internal {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl GatewayError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    pub fn channel_disconnected(message: impl Into<String>) -> Self {
        Self::ChannelDisconnected(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            source: None,
        }
    }

    pub fn wrap(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Internal {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            GatewayError::Validation(_) => ErrorCode::Validation,
            GatewayError::NotFound(_) => ErrorCode::NotFound,
            GatewayError::Forbidden(_) => ErrorCode::Forbidden,
            GatewayError::Conflict(_) => ErrorCode::Conflict,
            GatewayError::ChannelDisconnected(_) => ErrorCode::ChannelDisconnected,
            GatewayError::RateLimited(_) => ErrorCode::RateLimited,
            GatewayError::Timeout(_) => ErrorCode::Timeout,
            GatewayError::Plugin(AdapterError::Timeout(_)) => ErrorCode::Timeout,
            GatewayError::Plugin(_) => ErrorCode::Plugin,
            GatewayError::Internal { .. } => ErrorCode::Internal,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, GatewayError::NotFound(_))
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::wrap("json encoding failed", err)
    }
}

pub type Result<T, E = GatewayError> = std::result::Result<T, E>;
