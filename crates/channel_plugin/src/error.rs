use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::message::ChannelType;

/// Errors raised by channel adapters, the registry and the plugin bridge.
///
/// Ordinary delivery failures are *not* errors: `send_message` reports them
/// in-band through [`crate::message::SendResult`].
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("adapter not connected")]
    NotConnected,

    #[error("no message handler configured")]
    NoHandler,

    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("{operation} is not supported by this adapter")]
    Unsupported { operation: &'static str },

    #[error("adapter for channel type {channel_type} already registered")]
    AlreadyRegistered { channel_type: ChannelType },

    #[error("no adapter registered for channel type {channel_type}")]
    NotRegistered { channel_type: ChannelType },

    #[error("channel {channel_id} is not configured")]
    ChannelNotConfigured { channel_id: String },

    #[error("plugin not found: {}", path.display())]
    PluginNotFound { path: PathBuf },

    #[error("plugin handshake failed: {message}")]
    Handshake { message: String },

    #[error("plugin rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("plugin transport closed: {message}")]
    Transport { message: String },

    #[error("plugin call timed out after {0:?}")]
    Timeout(Duration),

    #[error("{context}: {source}")]
    External {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl AdapterError {
    #[must_use]
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn handshake(message: impl Into<String>) -> Self {
        Self::Handshake {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn external(
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::External {
            context: context.into(),
            source: Box::new(source),
        }
    }
}

pub type Result<T> = std::result::Result<T, AdapterError>;
