use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::adapter::{ChannelAdapter, MessageHandler, StatusHandler};
use crate::error::{AdapterError, Result};
use crate::message::{ChannelInfo, ChannelType, InboundMessage, StatusCallback};

/// Produces adapter instances for one channel type. Each configured channel
/// gets its own instance.
#[async_trait]
pub trait AdapterTemplate: Send + Sync {
    fn channel_info(&self) -> ChannelInfo;

    async fn instantiate(&self) -> Result<Arc<dyn ChannelAdapter>>;
}

/// Template for adapters compiled into the host.
pub struct InProcessTemplate<F> {
    info: ChannelInfo,
    make: F,
}

impl<F, A> InProcessTemplate<F>
where
    F: Fn() -> A + Send + Sync,
    A: ChannelAdapter + 'static,
{
    pub fn new(make: F) -> Self {
        let info = make().channel_info();
        Self { info, make }
    }
}

#[async_trait]
impl<F, A> AdapterTemplate for InProcessTemplate<F>
where
    F: Fn() -> A + Send + Sync,
    A: ChannelAdapter + 'static,
{
    fn channel_info(&self) -> ChannelInfo {
        self.info.clone()
    }

    async fn instantiate(&self) -> Result<Arc<dyn ChannelAdapter>> {
        Ok(Arc::new((self.make)()))
    }
}

/// Receives inbound traffic from every configured channel, tagged with the
/// channel id it arrived on.
#[async_trait]
pub trait ChannelInboundHandler: Send + Sync {
    async fn on_message(&self, channel_id: &str, message: InboundMessage) -> Result<()>;

    async fn on_status(&self, channel_id: &str, status: StatusCallback) -> Result<()>;
}

struct ScopedHandler {
    channel_id: String,
    inner: Arc<dyn ChannelInboundHandler>,
}

#[async_trait]
impl MessageHandler for ScopedHandler {
    async fn handle_message(&self, message: InboundMessage) -> Result<()> {
        self.inner.on_message(&self.channel_id, message).await
    }
}

#[async_trait]
impl StatusHandler for ScopedHandler {
    async fn handle_status(&self, status: StatusCallback) -> Result<()> {
        self.inner.on_status(&self.channel_id, status).await
    }
}

#[derive(Clone)]
pub struct ConfiguredChannel {
    pub channel_id: String,
    pub channel_type: ChannelType,
    pub adapter: Arc<dyn ChannelAdapter>,
}

/// Binds channel types to adapter templates, and channel ids to live,
/// connected adapter instances.
///
/// Locks are never held across adapter calls.
#[derive(Default)]
pub struct PluginRegistry {
    templates: RwLock<HashMap<ChannelType, Arc<dyn AdapterTemplate>>>,
    channels: RwLock<HashMap<String, ConfiguredChannel>>,
    inbound: RwLock<Option<Arc<dyn ChannelInboundHandler>>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register_adapter(
        &self,
        channel_type: ChannelType,
        template: Arc<dyn AdapterTemplate>,
    ) -> Result<()> {
        let mut templates = self.templates.write().await;
        if templates.contains_key(&channel_type) {
            return Err(AdapterError::AlreadyRegistered { channel_type });
        }
        templates.insert(channel_type, template);
        info!(%channel_type, "adapter registered");
        Ok(())
    }

    pub async fn unregister_adapter(&self, channel_type: ChannelType) -> bool {
        self.templates.write().await.remove(&channel_type).is_some()
    }

    pub async fn get_adapter(&self, channel_type: ChannelType) -> Option<Arc<dyn AdapterTemplate>> {
        self.templates.read().await.get(&channel_type).cloned()
    }

    pub async fn get_adapter_info(&self, channel_type: ChannelType) -> Option<ChannelInfo> {
        self.get_adapter(channel_type).await.map(|t| t.channel_info())
    }

    pub async fn list_adapters(&self) -> Vec<ChannelType> {
        let mut types: Vec<_> = self.templates.read().await.keys().copied().collect();
        types.sort();
        types
    }

    pub async fn get_adapter_by_channel_id(&self, channel_id: &str) -> Option<Arc<dyn ChannelAdapter>> {
        self.channels
            .read()
            .await
            .get(channel_id)
            .map(|c| Arc::clone(&c.adapter))
    }

    pub async fn list_configured_channels(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.channels.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Handler that adapters configured from now on push inbound traffic to.
    pub async fn set_inbound_handler(&self, handler: Arc<dyn ChannelInboundHandler>) {
        *self.inbound.write().await = Some(handler);
    }

    /// Instantiate, initialize and connect an adapter for `channel_id`.
    /// A channel that was already configured is replaced and its previous
    /// instance torn down.
    pub async fn configure_channel(
        &self,
        channel_id: &str,
        channel_type: ChannelType,
        config: HashMap<String, String>,
    ) -> Result<Arc<dyn ChannelAdapter>> {
        let template = self
            .get_adapter(channel_type)
            .await
            .ok_or(AdapterError::NotRegistered { channel_type })?;
        let adapter = template.instantiate().await?;

        let scoped = self.inbound.read().await.clone().map(|inner| {
            Arc::new(ScopedHandler {
                channel_id: channel_id.to_string(),
                inner,
            })
        });
        if let (Some(inbound), Some(handler)) = (adapter.inbound(), scoped.as_ref()) {
            inbound.set_message_handler(handler.clone());
            inbound.set_status_handler(handler.clone());
        }

        adapter.initialize(config).await?;
        adapter.connect().await?;

        if let Err(err) = start_receivers(adapter.as_ref(), scoped).await {
            error!(%channel_id, "starting receivers failed: {err}");
            if let Err(e) = adapter.disconnect().await {
                warn!(%channel_id, "disconnect after failed start: {e}");
            }
            return Err(err);
        }

        let previous = self.channels.write().await.insert(
            channel_id.to_string(),
            ConfiguredChannel {
                channel_id: channel_id.to_string(),
                channel_type,
                adapter: Arc::clone(&adapter),
            },
        );
        if let Some(previous) = previous {
            warn!(%channel_id, "channel reconfigured, tearing down previous adapter");
            if let Err(err) = teardown(previous.adapter.as_ref()).await {
                warn!(%channel_id, "previous adapter teardown failed: {err}");
            }
        }
        info!(%channel_id, %channel_type, "channel configured");
        Ok(adapter)
    }

    /// Remove the binding and disconnect its adapter. Unknown ids are a no-op.
    pub async fn disconnect_channel(&self, channel_id: &str) -> Result<()> {
        let Some(channel) = self.channels.write().await.remove(channel_id) else {
            return Ok(());
        };
        teardown(channel.adapter.as_ref()).await?;
        info!(%channel_id, "channel disconnected");
        Ok(())
    }

    /// Tear down every configured channel. Keeps going on failure and
    /// returns the last error.
    pub async fn close(&self) -> Result<()> {
        let channels: Vec<_> = self.channels.write().await.drain().collect();
        let mut last_err = None;
        for (channel_id, channel) in channels {
            if let Err(err) = teardown(channel.adapter.as_ref()).await {
                error!(%channel_id, "disconnect during close failed: {err}");
                last_err = Some(err);
            }
        }
        self.templates.write().await.clear();
        match last_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

async fn start_receivers(
    adapter: &dyn ChannelAdapter,
    scoped: Option<Arc<ScopedHandler>>,
) -> Result<()> {
    if let Some(ws) = adapter.websocket() {
        ws.start_websocket().await?;
    }
    if let (Some(polling), Some(handler)) = (adapter.polling(), scoped) {
        polling.start_polling(handler).await?;
    }
    Ok(())
}

async fn teardown(adapter: &dyn ChannelAdapter) -> Result<()> {
    if let Some(ws) = adapter.websocket() {
        ws.stop_websocket().await?;
    }
    if let Some(polling) = adapter.polling() {
        polling.stop_polling().await?;
    }
    adapter.disconnect().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ChannelCapabilities, OutboundMessage, SendResult};
    use crate::{BaseAdapter, InboundAdapter};
    use chrono::Utc;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Log = Arc<Mutex<Vec<String>>>;
    type Handlers = Arc<Mutex<Vec<Arc<dyn MessageHandler>>>>;

    fn sms_info() -> ChannelInfo {
        ChannelInfo {
            channel_type: ChannelType::Sms,
            name: "SMS".into(),
            description: "test adapter".into(),
            version: "0.0.1".into(),
            author: "tests".into(),
            capabilities: ChannelCapabilities::default(),
        }
    }

    struct RecordingAdapter {
        id: usize,
        base: BaseAdapter,
        log: Log,
        fail_disconnect: bool,
        handlers: Handlers,
    }

    impl RecordingAdapter {
        fn record(&self, what: &str) {
            self.log.lock().unwrap().push(format!("{}:{what}", self.id));
        }
    }

    #[async_trait]
    impl ChannelAdapter for RecordingAdapter {
        async fn initialize(&self, config: HashMap<String, String>) -> Result<()> {
            self.record("initialize");
            self.base.initialize(config);
            self.base.require(&["token"])
        }
        async fn connect(&self) -> Result<()> {
            self.record("connect");
            self.base.set_connected(true);
            Ok(())
        }
        async fn disconnect(&self) -> Result<()> {
            self.record("disconnect");
            self.base.set_connected(false);
            if self.fail_disconnect {
                return Err(AdapterError::NotConnected);
            }
            Ok(())
        }
        async fn is_connected(&self) -> bool {
            self.base.is_connected()
        }
        async fn send_message(&self, message: OutboundMessage) -> Result<SendResult> {
            Ok(SendResult::sent(message.id))
        }
        fn channel_info(&self) -> ChannelInfo {
            self.base.info().clone()
        }
        fn inbound(&self) -> Option<&dyn InboundAdapter> {
            Some(self)
        }
    }

    impl InboundAdapter for RecordingAdapter {
        fn set_message_handler(&self, handler: Arc<dyn MessageHandler>) {
            self.handlers.lock().unwrap().push(handler);
        }
        fn set_status_handler(&self, _handler: Arc<dyn StatusHandler>) {}
    }

    struct Factory {
        log: Log,
        counter: AtomicUsize,
        fail_disconnect: bool,
        handlers: Handlers,
    }

    #[async_trait]
    impl AdapterTemplate for Factory {
        fn channel_info(&self) -> ChannelInfo {
            sms_info()
        }
        async fn instantiate(&self) -> Result<Arc<dyn ChannelAdapter>> {
            Ok(Arc::new(RecordingAdapter {
                id: self.counter.fetch_add(1, Ordering::SeqCst),
                base: BaseAdapter::new(sms_info()),
                log: self.log.clone(),
                fail_disconnect: self.fail_disconnect,
                handlers: self.handlers.clone(),
            }))
        }
    }

    fn factory(log: &Log, fail_disconnect: bool) -> Arc<Factory> {
        Arc::new(Factory {
            log: log.clone(),
            counter: AtomicUsize::new(0),
            fail_disconnect,
            handlers: Handlers::default(),
        })
    }

    fn config() -> HashMap<String, String> {
        HashMap::from([("token".to_string(), "t".to_string())])
    }

    #[derive(Default)]
    struct Inbox(Mutex<Vec<(String, String)>>);

    #[async_trait]
    impl ChannelInboundHandler for Inbox {
        async fn on_message(&self, channel_id: &str, message: InboundMessage) -> Result<()> {
            self.0.lock().unwrap().push((channel_id.to_string(), message.content));
            Ok(())
        }
        async fn on_status(&self, _channel_id: &str, _status: StatusCallback) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn registering_twice_is_rejected() {
        let log = Log::default();
        let registry = PluginRegistry::new();
        registry.register_adapter(ChannelType::Sms, factory(&log, false)).await.unwrap();
        let err = registry
            .register_adapter(ChannelType::Sms, factory(&log, false))
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::AlreadyRegistered { channel_type: ChannelType::Sms }));
        assert_eq!(registry.list_adapters().await, vec![ChannelType::Sms]);
        assert_eq!(registry.get_adapter_info(ChannelType::Sms).await.unwrap().name, "SMS");

        assert!(registry.unregister_adapter(ChannelType::Sms).await);
        assert!(registry.list_adapters().await.is_empty());
    }

    #[tokio::test]
    async fn configure_initializes_then_connects_one_instance_per_channel() {
        let log = Log::default();
        let registry = PluginRegistry::new();
        registry.register_adapter(ChannelType::Sms, factory(&log, false)).await.unwrap();

        let a = registry.configure_channel("ch-a", ChannelType::Sms, config()).await.unwrap();
        let b = registry.configure_channel("ch-b", ChannelType::Sms, config()).await.unwrap();

        assert!(!Arc::ptr_eq(&a, &b));
        assert!(a.is_connected().await);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["0:initialize", "0:connect", "1:initialize", "1:connect"]
        );
        assert_eq!(registry.list_configured_channels().await, vec!["ch-a", "ch-b"]);
        let found = registry.get_adapter_by_channel_id("ch-b").await.unwrap();
        assert!(Arc::ptr_eq(&found, &b));
    }

    #[tokio::test]
    async fn failed_initialize_leaves_no_binding() {
        let log = Log::default();
        let registry = PluginRegistry::new();
        registry.register_adapter(ChannelType::Sms, factory(&log, false)).await.unwrap();

        let err = registry
            .configure_channel("ch-a", ChannelType::Sms, HashMap::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, AdapterError::InvalidConfig { .. }));
        assert!(registry.get_adapter_by_channel_id("ch-a").await.is_none());
        assert_eq!(*log.lock().unwrap(), vec!["0:initialize"]);
    }

    #[tokio::test]
    async fn unknown_type_cannot_be_configured() {
        let registry = PluginRegistry::new();
        let err = registry
            .configure_channel("ch-a", ChannelType::Telegram, config())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, AdapterError::NotRegistered { .. }));
    }

    #[tokio::test]
    async fn reconfigure_replaces_and_disconnects_previous() {
        let log = Log::default();
        let registry = PluginRegistry::new();
        registry.register_adapter(ChannelType::Sms, factory(&log, false)).await.unwrap();

        let first = registry.configure_channel("ch-a", ChannelType::Sms, config()).await.unwrap();
        registry.configure_channel("ch-a", ChannelType::Sms, config()).await.unwrap();

        assert!(!first.is_connected().await);
        assert!(log.lock().unwrap().contains(&"0:disconnect".to_string()));
        assert_eq!(registry.list_configured_channels().await, vec!["ch-a"]);
    }

    #[tokio::test]
    async fn disconnect_channel_removes_binding() {
        let log = Log::default();
        let registry = PluginRegistry::new();
        registry.register_adapter(ChannelType::Sms, factory(&log, false)).await.unwrap();
        registry.configure_channel("ch-a", ChannelType::Sms, config()).await.unwrap();

        registry.disconnect_channel("ch-a").await.unwrap();
        assert!(registry.get_adapter_by_channel_id("ch-a").await.is_none());
        registry.disconnect_channel("missing").await.unwrap();
    }

    #[tokio::test]
    async fn close_tears_down_everything_and_reports_last_error() {
        let log = Log::default();
        let registry = PluginRegistry::new();
        registry.register_adapter(ChannelType::Sms, factory(&log, true)).await.unwrap();
        registry.configure_channel("ch-a", ChannelType::Sms, config()).await.unwrap();
        registry.configure_channel("ch-b", ChannelType::Sms, config()).await.unwrap();

        assert!(registry.close().await.is_err());
        let disconnects = log
            .lock()
            .unwrap()
            .iter()
            .filter(|l| l.ends_with("disconnect"))
            .count();
        assert_eq!(disconnects, 2);
        assert!(registry.list_configured_channels().await.is_empty());
        assert!(registry.list_adapters().await.is_empty());

        let empty = PluginRegistry::new();
        assert!(empty.close().await.is_ok());
    }

    #[tokio::test]
    async fn inbound_traffic_is_tagged_with_channel_id() {
        let log = Log::default();
        let templates = factory(&log, false);
        let registry = PluginRegistry::new();
        let inbox = Arc::new(Inbox::default());
        registry.set_inbound_handler(inbox.clone()).await;
        registry.register_adapter(ChannelType::Sms, templates.clone()).await.unwrap();
        registry.configure_channel("ch-a", ChannelType::Sms, config()).await.unwrap();

        let handler = templates.handlers.lock().unwrap()[0].clone();
        let msg = InboundMessage {
            id: "m".into(),
            external_id: "x".into(),
            sender_id: "+1555".into(),
            sender_name: None,
            content_type: Default::default(),
            content: "hello".into(),
            metadata: HashMap::new(),
            attachments: vec![],
            timestamp: Utc::now(),
        };
        handler.handle_message(msg).await.unwrap();
        assert_eq!(*inbox.0.lock().unwrap(), vec![("ch-a".to_string(), "hello".to_string())]);
    }
}
