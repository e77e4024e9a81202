//! The running gateway: channel lifecycle on top of the plugin registry and
//! the inbound pipeline that every adapter feeds.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use channel_plugin::loader::{PluginLoader, PluginTemplate};
use channel_plugin::message::{ChannelType, InboundMessage, StatusCallback};
use channel_plugin::{AdapterError, AdapterTemplate, ChannelInboundHandler, InProcessTemplate, PluginRegistry};
use channel_webchat::{ChannelDirectory, ChannelListing, WebchatAdapter, WebchatRoutes};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::analysis::{ContextService, IntentService};
use crate::config::{ChannelSpec, GatewayFile};
use crate::delivery::{DeliveryConfig, DeliveryQueue, OutboundQueue};
use crate::domain::{Channel, ConnectionState, Message};
use crate::error::{GatewayError, Result};
use crate::events::EventSink;
use crate::logger::Metrics;
use crate::repository::Repositories;
use crate::usecase::{
    AnalyzeMessage, AnalyzeMessageInput, AnalyzeMessageOutput, EscalateConversation, EscalateInput,
    EscalateOutput, EscalationContext, GetEscalationContext, ReceiveMessage, ReceiveMessageInput,
    SendMessage, SendMessageInput,
};

/// Owner recorded for the webchat template compiled into the gateway.
pub const BUILTIN_OWNER: &str = "builtin";
const META_SESSION_ID: &str = "session_id";

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// How long an untouched conversation context stays cached.
    pub context_idle: Duration,
    pub delivery: DeliveryConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            context_idle: Duration::from_secs(30 * 60),
            delivery: DeliveryConfig::default(),
        }
    }
}

/// What became of one inbound message.
#[derive(Debug, Clone)]
pub struct InboundOutcome {
    pub message: Message,
    pub conversation_id: String,
    pub analysis: Option<AnalyzeMessageOutput>,
    pub escalation: Option<EscalateOutput>,
}

/// Every channel the gateway knows about, for the webchat upgrade check.
#[derive(Default)]
struct Directory(DashMap<String, ChannelListing>);

impl Directory {
    fn publish(&self, channel: &Channel) {
        self.0.insert(
            channel.id.clone(),
            ChannelListing {
                channel_type: channel.channel_type,
                active: channel.is_active(),
            },
        );
    }
}

impl ChannelDirectory for Directory {
    fn lookup(&self, channel_id: &str) -> Option<ChannelListing> {
        self.0.get(channel_id).map(|l| *l.value())
    }
}

pub struct Gateway {
    repos: Repositories,
    registry: Arc<PluginRegistry>,
    loader: Option<Arc<PluginLoader>>,
    routes: WebchatRoutes,
    directory: Arc<Directory>,
    /// Which plugin (or the builtin) serves each registered channel type.
    template_owners: Mutex<HashMap<ChannelType, String>>,
    delivery: Arc<DeliveryQueue>,
    receive: ReceiveMessage,
    send: SendMessage,
    analyze: AnalyzeMessage,
    escalate: EscalateConversation,
    escalation_context: GetEscalationContext,
    metrics: Metrics,
}

impl Gateway {
    pub async fn new(
        repos: Repositories,
        intents: IntentService,
        events: Arc<dyn EventSink>,
        loader: Option<Arc<PluginLoader>>,
        config: GatewayConfig,
    ) -> Arc<Self> {
        let registry = Arc::new(PluginRegistry::new());
        let metrics = Metrics::new();
        let intents = Arc::new(intents);
        let contexts = ContextService::new(repos.contexts.clone(), config.context_idle);
        let delivery = Arc::new(DeliveryQueue::new(
            Arc::clone(&registry),
            repos.messages.clone(),
            Arc::clone(&events),
            metrics.clone(),
            config.delivery,
        ));
        let queue: Arc<dyn OutboundQueue> = delivery.clone();

        let gateway = Arc::new(Self {
            receive: ReceiveMessage::new(repos.clone(), Arc::clone(&events), metrics.clone()),
            send: SendMessage::new(repos.clone(), queue, contexts.clone()),
            analyze: AnalyzeMessage::new(repos.clone(), Arc::clone(&intents), contexts.clone(), Arc::clone(&events)),
            escalate: EscalateConversation::new(repos.clone(), contexts.clone(), events, metrics.clone()),
            escalation_context: GetEscalationContext::new(repos.clone(), contexts, intents),
            repos,
            registry,
            loader,
            routes: WebchatRoutes::new(),
            directory: Arc::new(Directory::default()),
            template_owners: Mutex::new(HashMap::new()),
            delivery,
            metrics,
        });
        gateway
            .registry
            .set_inbound_handler(Arc::new(InboundBridge(Arc::downgrade(&gateway))))
            .await;
        gateway
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    pub fn routes(&self) -> WebchatRoutes {
        self.routes.clone()
    }

    pub fn directory(&self) -> Arc<dyn ChannelDirectory> {
        self.directory.clone()
    }

    /// Seeds bots and agents, then configures every declared channel. A
    /// channel that fails to come up is left in the error state and does
    /// not stop the others. Returns how many channels connected.
    pub async fn start(&self, file: &GatewayFile) -> Result<usize> {
        file.seed(&self.repos).await?;
        let mut connected = 0;
        for spec in &file.channels {
            match self.configure_channel(spec).await {
                Ok(channel) if channel.is_active() => connected += 1,
                Ok(_) => {}
                Err(err) => error!(channel_id = %spec.id, code = %err.code(), "channel failed to start: {err}"),
            }
        }
        info!(connected, declared = file.channels.len(), "channels configured");
        Ok(connected)
    }

    /// Binds a template for `channel_type` under `owner`. Hosts embedding the
    /// gateway use this for adapters compiled into them.
    pub async fn register_template(
        &self,
        channel_type: ChannelType,
        owner: &str,
        template: Arc<dyn AdapterTemplate>,
    ) -> Result<()> {
        let mut owners = self.template_owners.lock().await;
        self.bind_template(&mut owners, channel_type, owner, template).await
    }

    async fn bind_template(
        &self,
        owners: &mut HashMap<ChannelType, String>,
        channel_type: ChannelType,
        owner: &str,
        template: Arc<dyn AdapterTemplate>,
    ) -> Result<()> {
        if let Some(current) = owners.get(&channel_type) {
            if current == owner {
                return Ok(());
            }
            return Err(GatewayError::conflict(format!(
                "channel type {channel_type} is already served by `{current}`"
            )));
        }
        self.registry.register_adapter(channel_type, template).await?;
        owners.insert(channel_type, owner.to_string());
        Ok(())
    }

    async fn ensure_template(&self, spec: &ChannelSpec) -> Result<()> {
        let owner = spec.plugin.as_deref().unwrap_or(BUILTIN_OWNER);
        let mut owners = self.template_owners.lock().await;
        match owners.get(&spec.channel_type) {
            Some(current) if current == owner => return Ok(()),
            Some(current) => {
                return Err(GatewayError::conflict(format!(
                    "channel type {} is already served by `{current}`",
                    spec.channel_type
                )));
            }
            None => {}
        }

        let template: Arc<dyn AdapterTemplate> = if spec.is_builtin() {
            let routes = self.routes.clone();
            Arc::new(InProcessTemplate::new(move || WebchatAdapter::new(routes.clone())))
        } else {
            let name = spec
                .plugin
                .as_deref()
                .ok_or_else(|| GatewayError::validation(format!("channel `{}` needs a plugin", spec.id)))?;
            let loader = self
                .loader
                .as_ref()
                .ok_or_else(|| GatewayError::validation("plugin loading is not enabled"))?;
            Arc::new(PluginTemplate::load(Arc::clone(loader), name).await?)
        };
        self.bind_template(&mut owners, spec.channel_type, owner, template).await
    }

    /// Saves the channel and brings its adapter up. The stored connection
    /// state reflects the outcome either way.
    pub async fn configure_channel(&self, spec: &ChannelSpec) -> Result<Channel> {
        let channel = spec.to_channel();
        self.repos.channels.save(channel.clone()).await?;
        if !spec.enabled {
            info!(channel_id = %spec.id, "channel disabled, not connecting");
            self.directory.publish(&channel);
            return Ok(channel);
        }

        let outcome = self.connect_adapter(spec).await;
        let (state, capabilities) = match &outcome {
            Ok(capabilities) => (ConnectionState::Connected, Some(capabilities.clone())),
            Err(_) => (ConnectionState::Error, None),
        };
        self.repos.channels.update_connection(&spec.id, state, capabilities).await?;
        let stored = self
            .repos
            .channels
            .find_by_id(&spec.id)
            .await?
            .ok_or_else(|| GatewayError::not_found("channel not found"))?;
        self.directory.publish(&stored);

        outcome.map(|_| stored)
    }

    async fn connect_adapter(&self, spec: &ChannelSpec) -> Result<channel_plugin::message::ChannelCapabilities> {
        self.ensure_template(spec).await?;
        let mut config = spec.config.clone();
        config.insert("channel_id".into(), spec.id.clone());
        config.insert("tenant_id".into(), spec.tenant_id.clone());
        let adapter = self
            .registry
            .configure_channel(&spec.id, spec.channel_type, config)
            .await?;
        Ok(adapter.capabilities())
    }

    /// Tears the adapter down and marks the channel disconnected. The
    /// binding is gone even when the adapter's disconnect fails.
    pub async fn disconnect_channel(&self, channel_id: &str) -> Result<()> {
        let result = self.registry.disconnect_channel(channel_id).await;
        match self
            .repos
            .channels
            .update_connection(channel_id, ConnectionState::Disconnected, None)
            .await
        {
            Ok(()) => {
                if let Some(channel) = self.repos.channels.find_by_id(channel_id).await? {
                    self.directory.publish(&channel);
                }
            }
            Err(err) if err.is_not_found() => debug!(%channel_id, "disconnecting unknown channel"),
            Err(err) => return Err(err),
        }
        result.map_err(GatewayError::from)
    }

    /// Receive, then let the channel's bot look at it unless a human already
    /// owns the conversation. Returns `None` for a redelivered message.
    pub async fn handle_inbound(&self, channel_id: &str, message: InboundMessage) -> Result<Option<InboundOutcome>> {
        let session_id = message.metadata.get(META_SESSION_ID).cloned();
        let received = match self
            .receive
            .execute(ReceiveMessageInput::from_inbound(channel_id, message))
            .await
        {
            Ok(received) => received,
            Err(GatewayError::Conflict(reason)) => {
                debug!(%channel_id, "dropping redelivered message: {reason}");
                return Ok(None);
            }
            Err(err) => return Err(err),
        };
        let conversation = &received.conversation;

        if let Some(session_id) = session_id {
            if let Err(err) = self.routes.bind_conversation(
                channel_id,
                &session_id,
                &conversation.id,
                Some(received.contact.id.clone()),
            ) {
                warn!(%channel_id, %session_id, "binding webchat session: {err}");
            }
        }

        let mut outcome = InboundOutcome {
            message: received.message.clone(),
            conversation_id: conversation.id.clone(),
            analysis: None,
            escalation: None,
        };
        if conversation.assigned_user_id.is_some() {
            debug!(conversation_id = %conversation.id, "conversation is with an agent, skipping bot");
            return Ok(Some(outcome));
        }

        let analysis = match self
            .analyze
            .execute(AnalyzeMessageInput {
                tenant_id: conversation.tenant_id.clone(),
                conversation_id: conversation.id.clone(),
                channel_id: channel_id.to_string(),
                message_id: received.message.id.clone(),
                content: received.message.content.clone(),
            })
            .await
        {
            Ok(analysis) => analysis,
            Err(err) => {
                warn!(conversation_id = %conversation.id, "analysis failed: {err}");
                return Ok(Some(outcome));
            }
        };

        if let (true, Some(bot_id), Some(reason)) = (
            analysis.should_escalate,
            analysis.bot_id.as_deref(),
            analysis.escalate_reason.as_deref(),
        ) {
            match self
                .escalate
                .escalate_from_bot(&conversation.tenant_id, &conversation.id, bot_id, reason)
                .await
            {
                Ok(escalation) => outcome.escalation = Some(escalation),
                Err(err) => warn!(conversation_id = %conversation.id, "escalation failed: {err}"),
            }
        }
        outcome.analysis = Some(analysis);
        Ok(Some(outcome))
    }

    /// Applies a provider status report for a message sent on `channel_id`.
    pub async fn handle_status(&self, channel_id: &str, status: StatusCallback) -> Result<bool> {
        let Some(channel) = self.repos.channels.find_by_id(channel_id).await? else {
            warn!(%channel_id, "status report for unknown channel");
            return Ok(false);
        };
        self.delivery.apply_status(&channel.tenant_id, &channel.id, status).await
    }

    pub async fn send_message(&self, input: SendMessageInput) -> Result<Message> {
        self.metrics
            .instrument_request("send_message", || self.send.execute(input))
            .await
    }

    pub async fn escalate(&self, input: EscalateInput) -> Result<EscalateOutput> {
        self.escalate.execute(input).await
    }

    pub async fn escalate_from_user(&self, tenant_id: &str, conversation_id: &str) -> Result<EscalateOutput> {
        self.escalate.escalate_from_user(tenant_id, conversation_id).await
    }

    pub async fn escalation_context(
        &self,
        tenant_id: &str,
        conversation_id: &str,
        with_summary: bool,
    ) -> Result<EscalationContext> {
        self.escalation_context
            .execute(tenant_id, conversation_id, with_summary)
            .await
    }

    /// Stops delivery, then every adapter, then the plugin processes.
    pub async fn shutdown(&self) {
        self.delivery.close().await;
        if let Err(err) = self.registry.close().await {
            error!("closing channels: {err}");
        }
        if let Some(loader) = &self.loader {
            if let Err(err) = loader.close().await {
                error!("stopping plugins: {err}");
            }
        }
        info!("gateway stopped");
    }
}

/// Registry-facing side of the gateway. Holds it weakly so the registry
/// does not keep the gateway alive.
struct InboundBridge(Weak<Gateway>);

impl InboundBridge {
    fn gateway(&self) -> channel_plugin::Result<Arc<Gateway>> {
        self.0.upgrade().ok_or(AdapterError::NoHandler)
    }
}

#[async_trait]
impl ChannelInboundHandler for InboundBridge {
    async fn on_message(&self, channel_id: &str, message: InboundMessage) -> channel_plugin::Result<()> {
        let gateway = self.gateway()?;
        gateway
            .metrics
            .instrument_request("inbound_message", || gateway.handle_inbound(channel_id, message))
            .await
            .map(|_| ())
            .map_err(|err| AdapterError::external("processing inbound message", err))
    }

    async fn on_status(&self, channel_id: &str, status: StatusCallback) -> channel_plugin::Result<()> {
        let gateway = self.gateway()?;
        gateway
            .handle_status(channel_id, status)
            .await
            .map(|_| ())
            .map_err(|err| AdapterError::external("applying status report", err))
    }
}
