use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::message::{
    ChannelCapabilities, ChannelInfo, ChannelType, ConnectionStatus, InboundMessage, Media,
    MediaUpload, OutboundMessage, ReadReceipt, SendResult, StatusCallback, TypingIndicator,
};

/// The contract every channel implementation satisfies, whether it runs
/// in-process or behind the plugin bridge.
///
/// Adapters are shared as `Arc<dyn ChannelAdapter>`, so every method takes
/// `&self` and implementations keep their state behind interior mutability.
/// Callers bound any call with `tokio::time::timeout`; dropping the future
/// cancels it.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    async fn initialize(&self, config: HashMap<String, String>) -> Result<()>;

    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    async fn is_connected(&self) -> bool;

    async fn connection_status(&self) -> ConnectionStatus {
        if self.is_connected().await {
            ConnectionStatus {
                connected: true,
                status: "connected".into(),
                ..Default::default()
            }
        } else {
            ConnectionStatus {
                connected: false,
                status: "disconnected".into(),
                ..Default::default()
            }
        }
    }

    /// Delivers one message. `Err` is reserved for contract violations;
    /// provider and network failures come back as a failed [`SendResult`].
    async fn send_message(&self, message: OutboundMessage) -> Result<SendResult>;

    async fn send_typing_indicator(&self, _indicator: TypingIndicator) -> Result<()> {
        Ok(())
    }

    async fn send_read_receipt(&self, _receipt: ReadReceipt) -> Result<()> {
        Ok(())
    }

    async fn upload_media(&self, _media: Media) -> Result<MediaUpload> {
        Ok(MediaUpload::not_implemented())
    }

    async fn download_media(&self, _media_id: &str) -> Result<Option<Media>> {
        Ok(None)
    }

    fn channel_info(&self) -> ChannelInfo;

    fn channel_type(&self) -> ChannelType {
        self.channel_info().channel_type
    }

    fn capabilities(&self) -> ChannelCapabilities {
        self.channel_info().capabilities
    }

    fn inbound(&self) -> Option<&dyn InboundAdapter> {
        None
    }

    fn webhook(&self) -> Option<&dyn WebhookAdapter> {
        None
    }

    fn polling(&self) -> Option<&dyn PollingAdapter> {
        None
    }

    fn websocket(&self) -> Option<&dyn WebSocketAdapter> {
        None
    }
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle_message(&self, message: InboundMessage) -> Result<()>;
}

#[async_trait]
pub trait StatusHandler: Send + Sync {
    async fn handle_status(&self, status: StatusCallback) -> Result<()>;
}

/// Adapters that push inbound traffic to the host.
pub trait InboundAdapter: Send + Sync {
    fn set_message_handler(&self, handler: Arc<dyn MessageHandler>);

    fn set_status_handler(&self, handler: Arc<dyn StatusHandler>);
}

/// Adapters fed by provider webhooks.
pub trait WebhookAdapter: InboundAdapter {
    fn webhook_path(&self) -> String;

    fn validate_webhook(&self, headers: &HashMap<String, String>, body: &[u8]) -> bool;
}

/// Adapters that pull from the provider on an interval.
#[async_trait]
pub trait PollingAdapter: Send + Sync {
    async fn start_polling(&self, handler: Arc<dyn MessageHandler>) -> Result<()>;

    async fn stop_polling(&self) -> Result<()>;

    fn polling_interval(&self) -> Duration;
}

/// Adapters holding persistent client connections.
#[async_trait]
pub trait WebSocketAdapter: InboundAdapter {
    async fn start_websocket(&self) -> Result<()>;

    async fn stop_websocket(&self) -> Result<()>;
}
