use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use channel_plugin::message::{
    ChannelCapabilities, ChannelInfo, ChannelType, ConnectionStatus, ContentType, InboundMessage,
    MessageStatus, OutboundMessage, ReadReceipt, SendResult, StatusCallback, TypingIndicator,
};
use channel_plugin::{
    AdapterError, BaseAdapter, ChannelAdapter, InboundAdapter, MessageHandler, Result,
    StatusHandler, WebSocketAdapter,
};
use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::client::ClientEvents;
use crate::envelope::{Envelope, FrameType, Payload, now_rfc3339};
use crate::hub::{ClientInfo, Hub, SendOutcome};
use crate::server::{Route, WebchatRoutes};

pub const DEFAULT_WIDGET_TITLE: &str = "Chat with us";
pub const DEFAULT_WIDGET_COLOR: &str = "#007bff";
pub const DEFAULT_WELCOME_MESSAGE: &str = "Hello! How can we help you today?";
pub const DEFAULT_OFFLINE_MESSAGE: &str =
    "We're currently offline. Leave a message and we'll get back to you.";

/// Widget presentation configured per channel.
#[derive(Debug, Clone, PartialEq)]
pub struct WidgetSettings {
    pub widget_title: String,
    pub widget_color: String,
    pub welcome_message: String,
    pub offline_message: String,
    pub avatar_url: Option<String>,
    pub allow_attachments: bool,
    pub require_email: bool,
    pub require_name: bool,
}

impl Default for WidgetSettings {
    fn default() -> Self {
        Self {
            widget_title: DEFAULT_WIDGET_TITLE.into(),
            widget_color: DEFAULT_WIDGET_COLOR.into(),
            welcome_message: DEFAULT_WELCOME_MESSAGE.into(),
            offline_message: DEFAULT_OFFLINE_MESSAGE.into(),
            avatar_url: None,
            allow_attachments: false,
            require_email: false,
            require_name: false,
        }
    }
}

impl WidgetSettings {
    fn from_config(base: &BaseAdapter) -> Self {
        Self {
            widget_title: base.config_or("widget_title", DEFAULT_WIDGET_TITLE),
            widget_color: base.config_or("widget_color", DEFAULT_WIDGET_COLOR),
            welcome_message: base.config_or("welcome_message", DEFAULT_WELCOME_MESSAGE),
            offline_message: base.config_or("offline_message", DEFAULT_OFFLINE_MESSAGE),
            avatar_url: base.config_value("avatar_url").filter(|v| !v.is_empty()),
            allow_attachments: base.config_flag("allow_attachments"),
            require_email: base.config_flag("require_email"),
            require_name: base.config_flag("require_name"),
        }
    }
}

pub fn webchat_info() -> ChannelInfo {
    ChannelInfo {
        channel_type: ChannelType::Webchat,
        name: "Web Chat".into(),
        description: "Real-time web chat widget for websites".into(),
        version: "1.0.0".into(),
        author: "omnigate".into(),
        capabilities: ChannelCapabilities {
            supported_content_types: vec![ContentType::Text, ContentType::Image, ContentType::Document],
            supports_media: true,
            supports_location: false,
            supports_templates: false,
            supports_interactive: true,
            supports_read_receipts: true,
            supports_typing_indicator: true,
            supports_reactions: false,
            supports_replies: true,
            supports_forwarding: false,
            max_message_length: 4096,
            max_media_size: 10 * 1024 * 1024,
            max_attachments: 5,
            supported_media_types: [
                "image/jpeg",
                "image/png",
                "image/gif",
                "image/webp",
                "application/pdf",
                "application/msword",
                "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        },
    }
}

/// State shared between the adapter and the connections it serves.
struct WebchatState {
    settings: RwLock<Arc<WidgetSettings>>,
    hub: RwLock<Option<Hub>>,
    message_handler: RwLock<Option<Arc<dyn MessageHandler>>>,
    status_handler: RwLock<Option<Arc<dyn StatusHandler>>>,
}

impl WebchatState {
    fn hub(&self) -> Option<Hub> {
        self.hub.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn settings(&self) -> Arc<WidgetSettings> {
        Arc::clone(&self.settings.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn message_handler(&self) -> Option<Arc<dyn MessageHandler>> {
        self.message_handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl ClientEvents for WebchatState {
    async fn on_connect(&self, client: &ClientInfo) {
        let settings = self.settings();
        if settings.welcome_message.is_empty() {
            return;
        }
        if let Some(hub) = self.hub() {
            let welcome = Envelope::new(
                FrameType::Message,
                Payload {
                    id: Some(Uuid::new_v4().to_string()),
                    content_type: Some(ContentType::Text.to_string()),
                    content: Some(settings.welcome_message.clone()),
                    sender_type: Some("system".into()),
                    timestamp: Some(now_rfc3339()),
                    ..Default::default()
                },
            );
            hub.push_to_session(&client.session_id, welcome);
        }
    }

    async fn on_message(&self, client: &ClientInfo, payload: Payload) -> Result<()> {
        let handler = self.message_handler().ok_or(AdapterError::NoHandler)?;
        handler.handle_message(inbound_from(client, payload)).await
    }

    async fn on_read(&self, client: &ClientInfo, message_id: String) {
        let handler = self.status_handler.read().unwrap_or_else(PoisonError::into_inner).clone();
        let Some(handler) = handler else {
            return;
        };
        let status = StatusCallback {
            message_id: String::new(),
            external_id: message_id,
            status: MessageStatus::Read,
            error: None,
            timestamp: Utc::now(),
        };
        if let Err(err) = handler.handle_status(status).await {
            warn!(session_id = %client.session_id, "read status not recorded: {err}");
        }
    }

    async fn on_disconnect(&self, client: &ClientInfo) {
        debug!(session_id = %client.session_id, "webchat session closed");
    }
}

fn inbound_from(client: &ClientInfo, payload: Payload) -> InboundMessage {
    let mut metadata: HashMap<String, String> = client.metadata.clone();
    metadata.insert("session_id".into(), client.session_id.clone());
    if let Some(conversation_id) = &client.conversation_id {
        metadata.insert("conversation_id".into(), conversation_id.clone());
    }
    let content_type = payload
        .content_type
        .as_deref()
        .and_then(|ct| ct.parse().ok())
        .unwrap_or_default();

    InboundMessage {
        id: Uuid::new_v4().to_string(),
        external_id: payload.id.unwrap_or_default(),
        sender_id: client.session_id.clone(),
        sender_name: payload.sender_name.or_else(|| client.metadata.get("name").cloned()),
        content_type,
        content: payload.content.unwrap_or_default(),
        metadata,
        attachments: payload.attachments,
        timestamp: Utc::now(),
    }
}

fn outbound_frame(message: &OutboundMessage) -> Envelope {
    Envelope::new(
        FrameType::Message,
        Payload {
            id: Some(message.id.clone()),
            content_type: Some(message.content_type.to_string()),
            content: Some(message.content.clone()),
            sender_type: Some("user".into()),
            sender_id: message.metadata.get("sender_id").cloned(),
            sender_name: message.metadata.get("sender_name").cloned(),
            attachments: message.attachments.clone(),
            timestamp: Some(now_rfc3339()),
            ..Default::default()
        },
    )
}

/// Browser widget channel. Connections arrive through the shared
/// [`crate::server::serve`] endpoint; this adapter owns the hub they
/// register with.
pub struct WebchatAdapter {
    base: BaseAdapter,
    state: Arc<WebchatState>,
    routes: WebchatRoutes,
}

impl WebchatAdapter {
    pub fn new(routes: WebchatRoutes) -> Self {
        Self {
            base: BaseAdapter::new(webchat_info()),
            state: Arc::new(WebchatState {
                settings: RwLock::new(Arc::new(WidgetSettings::default())),
                hub: RwLock::new(None),
                message_handler: RwLock::new(None),
                status_handler: RwLock::new(None),
            }),
            routes,
        }
    }

    pub fn hub(&self) -> Option<Hub> {
        self.state.hub()
    }

    pub fn settings(&self) -> Arc<WidgetSettings> {
        self.state.settings()
    }

    fn channel_id(&self) -> Result<String> {
        self.base
            .config_value("channel_id")
            .ok_or_else(|| AdapterError::invalid_config("missing required keys: channel_id"))
    }

    async fn signal(&self, recipient_id: &str, envelope: Envelope) -> Result<()> {
        let hub = self.hub().ok_or(AdapterError::NotConnected)?;
        match hub.send_to_session(recipient_id, envelope).await {
            Ok(SendOutcome::NotConnected) => Err(AdapterError::transport("client not connected")),
            Ok(_) => Ok(()),
            Err(_) => Err(AdapterError::NotConnected),
        }
    }
}

#[async_trait]
impl ChannelAdapter for WebchatAdapter {
    async fn initialize(&self, config: HashMap<String, String>) -> Result<()> {
        self.base.initialize(config);
        self.base.require(&["channel_id"])?;
        let settings = WidgetSettings::from_config(&self.base);
        *self.state.settings.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(settings);
        Ok(())
    }

    async fn connect(&self) -> Result<()> {
        {
            let mut hub = self.state.hub.write().unwrap_or_else(PoisonError::into_inner);
            if hub.is_none() {
                *hub = Some(Hub::start());
            }
        }
        self.base.set_connected(true);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if let Ok(channel_id) = self.channel_id() {
            self.routes.remove(&channel_id);
        }
        let hub = self.state.hub.write().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(hub) = hub {
            hub.stop().await;
        }
        self.base.set_connected(false);
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.base.is_connected()
    }

    async fn connection_status(&self) -> ConnectionStatus {
        let mut status = self.base.connection_status();
        if let Some(hub) = self.hub() {
            if let Ok(stats) = hub.stats().await {
                status.metadata.insert("clients".into(), stats.clients.to_string());
                status.metadata.insert("conversations".into(), stats.conversations.to_string());
            }
        }
        status
    }

    async fn send_message(&self, message: OutboundMessage) -> Result<SendResult> {
        let Some(hub) = self.hub() else {
            return Ok(SendResult::failed("adapter not connected"));
        };
        if !message.conversation_id.is_empty() {
            let _ = hub.bind_conversation(&message.recipient_id, &message.conversation_id, None);
        }
        let frame = outbound_frame(&message);

        let outcome = match hub.send_to_session(&message.recipient_id, frame.clone()).await {
            Ok(outcome) => outcome,
            Err(_) => return Ok(SendResult::failed("adapter not connected")),
        };
        let result = match outcome {
            SendOutcome::Delivered => SendResult::delivered(&message.id),
            SendOutcome::BufferFull => SendResult::failed("client buffer full"),
            SendOutcome::NotConnected if !message.conversation_id.is_empty() => {
                match hub.broadcast_counted(&message.conversation_id, frame).await {
                    Ok(n) if n > 0 => SendResult::delivered(&message.id),
                    _ => SendResult::failed("client not connected"),
                }
            }
            SendOutcome::NotConnected => SendResult::failed("client not connected"),
        };
        if !result.success {
            debug!(recipient = %message.recipient_id, error = ?result.error, "webchat send failed");
        }
        Ok(result)
    }

    async fn send_typing_indicator(&self, indicator: TypingIndicator) -> Result<()> {
        self.signal(&indicator.recipient_id, Envelope::typing(indicator.is_typing)).await
    }

    async fn send_read_receipt(&self, receipt: ReadReceipt) -> Result<()> {
        self.signal(&receipt.recipient_id, Envelope::read(receipt.message_id)).await
    }

    fn channel_info(&self) -> ChannelInfo {
        self.base.info().clone()
    }

    fn inbound(&self) -> Option<&dyn InboundAdapter> {
        Some(self)
    }

    fn websocket(&self) -> Option<&dyn WebSocketAdapter> {
        Some(self)
    }
}

impl InboundAdapter for WebchatAdapter {
    fn set_message_handler(&self, handler: Arc<dyn MessageHandler>) {
        *self.state.message_handler.write().unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    fn set_status_handler(&self, handler: Arc<dyn StatusHandler>) {
        *self.state.status_handler.write().unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }
}

#[async_trait]
impl WebSocketAdapter for WebchatAdapter {
    /// Publish this channel on the shared endpoint.
    async fn start_websocket(&self) -> Result<()> {
        let channel_id = self.channel_id()?;
        let hub = self.hub().ok_or(AdapterError::NotConnected)?;
        let route = Route {
            hub,
            settings: self.settings(),
            events: self.state.clone(),
            tenant_id: self.base.config_value("tenant_id").unwrap_or_default(),
        };
        self.routes.insert(channel_id.clone(), route);
        info!(%channel_id, "webchat channel published");
        Ok(())
    }

    async fn stop_websocket(&self) -> Result<()> {
        let channel_id = self.channel_id()?;
        if !self.routes.remove(&channel_id) {
            warn!(%channel_id, "webchat channel was not published");
        }
        Ok(())
    }
}
