use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::io::{self, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::Mutex;
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::level_filters::LevelFilter;
use tracing::{debug, info, warn};
use tracing_appender::rolling::daily;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{Registry, fmt};

use crate::adapter::{ChannelAdapter, MessageHandler, StatusHandler};
use crate::error::AdapterError;
use crate::handshake::HandshakeConfig;
use crate::jsonrpc::{
    ADAPTER_ERROR, INVALID_PARAMS, INVALID_REQUEST, Id, METHOD_NOT_FOUND, Message, PARSE_ERROR,
    Request, Response, UNKNOWN_INSTANCE,
};
use crate::message::{InboundMessage, StatusCallback};
use crate::protocol::{
    DownloadMediaParams, InboundParams, InitializeParams, InstanceParams, IsConnectedResult,
    Method, ReadReceiptParams, SendMessageParams, StatusParams, TypingParams, UploadMediaParams,
};
use crate::registry::AdapterTemplate;

/// Install a subscriber for a plugin binary. Stdout carries the RPC stream,
/// so logs go to a daily file under `log_dir` or to stderr.
pub fn init_plugin_logging(log_dir: Option<&Path>, level: LevelFilter) {
    let installed = match log_dir {
        Some(dir) => {
            if let Err(err) = std::fs::create_dir_all(dir) {
                eprintln!("cannot create plugin log dir {}: {err}", dir.display());
            }
            Registry::default()
                .with(
                    fmt::layer()
                        .with_ansi(false)
                        .with_target(false)
                        .with_writer(daily(dir, "plugin.log"))
                        .with_filter(level),
                )
                .try_init()
        }
        None => Registry::default()
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(level),
            )
            .try_init(),
    };
    if let Err(err) = installed {
        eprintln!("plugin logging setup failed: {err}");
    }
}

/// Entry point for plugin binaries: verify the host's cookie, then answer
/// JSON-RPC on stdin/stdout until the host closes the pipe.
pub async fn serve<T>(template: T) -> Result<()>
where
    T: AdapterTemplate + 'static,
{
    let handshake = HandshakeConfig::default();
    handshake.check_env()?;
    serve_io(template, &handshake, io::stdin(), io::stdout()).await
}

/// Runs the plugin loop over arbitrary streams until EOF.
pub async fn serve_io<T, R, W>(
    template: T,
    handshake: &HandshakeConfig,
    reader: R,
    writer: W,
) -> Result<()>
where
    T: AdapterTemplate + 'static,
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    // ── 1. writer task: every outgoing line goes through one queue ─────────
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let writer_task = tokio::spawn(async move {
        let mut w = BufWriter::new(writer);
        while let Some(line) = rx.recv().await {
            let written = async {
                w.write_all(line.as_bytes()).await?;
                w.write_all(b"\n").await?;
                w.flush().await
            }
            .await;
            if let Err(e) = written {
                eprintln!("plugin output write error: {e}");
                break;
            }
        }
    });

    // ── 2. handshake goes out before any response ───────────────────────────
    tx.send(serde_json::to_string(&handshake.line())?)?;

    let runtime = Arc::new(Runtime {
        template,
        instances: Mutex::new(HashMap::new()),
        out: tx.clone(),
    });
    info!(channel_type = %runtime.template.channel_info().channel_type, "plugin serving");

    // ── 3. read requests, answer each on its own task ───────────────────────
    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Message>(line) {
            Ok(Message::Request(req)) => {
                let runtime = Arc::clone(&runtime);
                tokio::spawn(async move { runtime.handle(req).await });
            }
            Ok(Message::Response(_)) => debug!("ignoring stray response from host"),
            Err(e) => {
                let err = Response::fail(Id::Null, PARSE_ERROR, "Parse error", Some(json!(e.to_string())));
                enqueue(&tx, &err);
            }
        }
    }

    info!("host closed the connection, shutting down");
    runtime.shutdown().await;
    drop(runtime);
    drop(tx);
    // adapters still holding a notification sink keep the queue open
    let _ = tokio::time::timeout(Duration::from_secs(2), writer_task).await;
    Ok(())
}

fn enqueue(tx: &UnboundedSender<String>, value: &impl serde::Serialize) {
    match serde_json::to_string(value) {
        Ok(line) => {
            let _ = tx.send(line);
        }
        Err(e) => warn!("cannot encode outgoing line: {e}"),
    }
}

struct RpcFailure {
    code: i64,
    message: String,
}

impl From<AdapterError> for RpcFailure {
    fn from(err: AdapterError) -> Self {
        Self {
            code: ADAPTER_ERROR,
            message: err.to_string(),
        }
    }
}

fn params<P: DeserializeOwned>(value: Value) -> Result<P, RpcFailure> {
    serde_json::from_value(value).map_err(|e| RpcFailure {
        code: INVALID_PARAMS,
        message: format!("invalid params: {e}"),
    })
}

fn to_value(value: impl serde::Serialize) -> Result<Value, RpcFailure> {
    serde_json::to_value(value).map_err(|e| AdapterError::from(e).into())
}

struct Runtime<T> {
    template: T,
    instances: Mutex<HashMap<String, Arc<dyn ChannelAdapter>>>,
    out: UnboundedSender<String>,
}

impl<T: AdapterTemplate> Runtime<T> {
    async fn instance(&self, id: &str) -> Result<Arc<dyn ChannelAdapter>, RpcFailure> {
        self.instances
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| RpcFailure {
                code: UNKNOWN_INSTANCE,
                message: format!("unknown instance: {id}"),
            })
    }

    async fn dispense(&self, id: &str) -> Result<Arc<dyn ChannelAdapter>, RpcFailure> {
        let mut instances = self.instances.lock().await;
        if instances.contains_key(id) {
            return Err(RpcFailure {
                code: INVALID_REQUEST,
                message: format!("instance already exists: {id}"),
            });
        }
        let adapter = self.template.instantiate().await?;
        if let Some(inbound) = adapter.inbound() {
            let sink = Arc::new(NotifySink {
                instance: id.to_string(),
                out: self.out.clone(),
            });
            inbound.set_message_handler(sink.clone());
            inbound.set_status_handler(sink);
        }
        debug!(instance = %id, "adapter instance created");
        instances.insert(id.to_string(), Arc::clone(&adapter));
        Ok(adapter)
    }

    /// Forget an instance, disconnecting it first. Unknown ids are a no-op.
    async fn release(&self, id: &str) -> bool {
        let Some(adapter) = self.instances.lock().await.remove(id) else {
            return false;
        };
        if adapter.is_connected().await {
            if let Err(err) = adapter.disconnect().await {
                warn!(instance = %id, "disconnect on release failed: {err}");
            }
        }
        debug!(instance = %id, "adapter instance released");
        true
    }

    async fn handle(&self, req: Request) {
        let params = req.params.unwrap_or(Value::Null);
        let Some(id) = req.id else {
            if let Err(failure) = self.dispatch(&req.method, params).await {
                debug!(method = %req.method, "host notification failed: {}", failure.message);
            }
            return;
        };
        let response = match self.dispatch(&req.method, params).await {
            Ok(result) => Response::success(id, result),
            Err(failure) => Response::fail(id, failure.code, failure.message, None),
        };
        enqueue(&self.out, &response);
    }

    async fn dispatch(&self, method: &str, value: Value) -> Result<Value, RpcFailure> {
        let method: Method = method.parse().map_err(|_| RpcFailure {
            code: METHOD_NOT_FOUND,
            message: format!("Method not found: {method}"),
        })?;

        match method {
            Method::Dispense => {
                let p: InstanceParams = params(value)?;
                to_value(self.dispense(&p.instance).await?.channel_info())
            }
            Method::Release => {
                let p: InstanceParams = params(value)?;
                Ok(Value::Bool(self.release(&p.instance).await))
            }
            Method::GetChannelInfo => {
                let p: InstanceParams = params(value)?;
                let adapter = self.instance(&p.instance).await?;
                to_value(adapter.channel_info())
            }
            Method::Initialize => {
                let p: InitializeParams = params(value)?;
                self.instance(&p.instance).await?.initialize(p.config).await?;
                Ok(Value::Null)
            }
            Method::Connect => {
                let p: InstanceParams = params(value)?;
                self.instance(&p.instance).await?.connect().await?;
                Ok(Value::Null)
            }
            Method::Disconnect => {
                let p: InstanceParams = params(value)?;
                self.instance(&p.instance).await?.disconnect().await?;
                Ok(Value::Null)
            }
            Method::IsConnected => {
                let p: InstanceParams = params(value)?;
                let connected = self.instance(&p.instance).await?.is_connected().await;
                to_value(IsConnectedResult { connected })
            }
            Method::GetConnectionStatus => {
                let p: InstanceParams = params(value)?;
                to_value(self.instance(&p.instance).await?.connection_status().await)
            }
            Method::SendMessage => {
                let p: SendMessageParams = params(value)?;
                to_value(self.instance(&p.instance).await?.send_message(p.message).await?)
            }
            Method::SendTypingIndicator => {
                let p: TypingParams = params(value)?;
                self.instance(&p.instance)
                    .await?
                    .send_typing_indicator(p.indicator)
                    .await?;
                Ok(Value::Null)
            }
            Method::SendReadReceipt => {
                let p: ReadReceiptParams = params(value)?;
                self.instance(&p.instance).await?.send_read_receipt(p.receipt).await?;
                Ok(Value::Null)
            }
            Method::UploadMedia => {
                let p: UploadMediaParams = params(value)?;
                to_value(self.instance(&p.instance).await?.upload_media(p.media).await?)
            }
            Method::DownloadMedia => {
                let p: DownloadMediaParams = params(value)?;
                to_value(self.instance(&p.instance).await?.download_media(&p.media_id).await?)
            }
            Method::InboundMessage | Method::StatusUpdate => Err(RpcFailure {
                code: INVALID_REQUEST,
                message: format!("{method} is sent by plugins, not hosts"),
            }),
        }
    }

    async fn shutdown(&self) {
        let instances: Vec<_> = self.instances.lock().await.drain().collect();
        for (id, adapter) in instances {
            if adapter.is_connected().await {
                if let Err(err) = adapter.disconnect().await {
                    warn!(instance = %id, "disconnect on shutdown failed: {err}");
                }
            }
        }
    }
}

/// Pushes adapter callbacks to the host as notifications.
struct NotifySink {
    instance: String,
    out: UnboundedSender<String>,
}

impl NotifySink {
    fn notify(&self, method: Method, params: Value) -> crate::error::Result<()> {
        let line = serde_json::to_string(&Request::notification(method, Some(params)))?;
        self.out
            .send(line)
            .map_err(|_| AdapterError::transport("host connection closed"))
    }
}

#[async_trait]
impl MessageHandler for NotifySink {
    async fn handle_message(&self, message: InboundMessage) -> crate::error::Result<()> {
        let params = serde_json::to_value(InboundParams {
            instance: self.instance.clone(),
            message,
        })?;
        self.notify(Method::InboundMessage, params)
    }
}

#[async_trait]
impl StatusHandler for NotifySink {
    async fn handle_status(&self, status: StatusCallback) -> crate::error::Result<()> {
        let params = serde_json::to_value(StatusParams {
            instance: self.instance.clone(),
            status,
        })?;
        self.notify(Method::StatusUpdate, params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::InboundAdapter;
    use crate::base::BaseAdapter;
    use crate::error::AdapterError;
    use crate::message::{
        Attachment, ChannelCapabilities, ChannelInfo, ChannelType, ContentType, MessageStatus,
        OutboundMessage, SendResult,
    };
    use crate::plugin_actor::PluginHandle;
    use crate::registry::InProcessTemplate;
    use chrono::Utc;
    use std::sync::Mutex as StdMutex;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, duplex, split};

    type Sent = Arc<StdMutex<Vec<OutboundMessage>>>;

    fn echo_info() -> ChannelInfo {
        ChannelInfo {
            channel_type: ChannelType::Telegram,
            name: "Echo".into(),
            description: "answers every send with an inbound echo".into(),
            version: "1.2.3".into(),
            author: "tests".into(),
            capabilities: ChannelCapabilities {
                supported_content_types: vec![ContentType::Text, ContentType::Image],
                supports_interactive: true,
                max_message_length: 4096,
                ..Default::default()
            },
        }
    }

    struct EchoAdapter {
        base: BaseAdapter,
        sent: Sent,
        handler: StdMutex<Option<Arc<dyn MessageHandler>>>,
    }

    #[async_trait]
    impl ChannelAdapter for EchoAdapter {
        async fn initialize(&self, config: HashMap<String, String>) -> crate::error::Result<()> {
            self.base.initialize(config);
            Ok(())
        }
        async fn connect(&self) -> crate::error::Result<()> {
            self.base.set_connected(true);
            Ok(())
        }
        async fn disconnect(&self) -> crate::error::Result<()> {
            self.base.set_connected(false);
            Ok(())
        }
        async fn is_connected(&self) -> bool {
            self.base.is_connected()
        }
        async fn send_message(&self, message: OutboundMessage) -> crate::error::Result<SendResult> {
            if message.content == "boom" {
                return Err(AdapterError::NotConnected);
            }
            self.sent.lock().unwrap().push(message.clone());
            let handler = self.handler.lock().unwrap().clone();
            if let Some(handler) = handler {
                handler
                    .handle_message(InboundMessage {
                        id: format!("echo-{}", message.id),
                        external_id: format!("ext-{}", message.id),
                        sender_id: message.recipient_id.clone(),
                        sender_name: None,
                        content_type: ContentType::Text,
                        content: format!("echo: {}", message.content),
                        metadata: HashMap::new(),
                        attachments: vec![],
                        timestamp: Utc::now(),
                    })
                    .await?;
            }
            Ok(SendResult::delivered(message.id))
        }
        fn channel_info(&self) -> ChannelInfo {
            self.base.info().clone()
        }
        fn inbound(&self) -> Option<&dyn InboundAdapter> {
            Some(self)
        }
    }

    impl InboundAdapter for EchoAdapter {
        fn set_message_handler(&self, handler: Arc<dyn MessageHandler>) {
            *self.handler.lock().unwrap() = Some(handler);
        }
        fn set_status_handler(&self, _handler: Arc<dyn StatusHandler>) {}
    }

    async fn bridge(sent: &Sent) -> PluginHandle {
        let sent = sent.clone();
        let template = InProcessTemplate::new(move || EchoAdapter {
            base: BaseAdapter::new(echo_info()),
            sent: sent.clone(),
            handler: StdMutex::new(None),
        });
        let (host_io, plugin_io) = duplex(64 * 1024);
        let (plugin_read, plugin_write) = split(plugin_io);
        let (host_read, host_write) = split(host_io);
        tokio::spawn(async move {
            serve_io(template, &HandshakeConfig::default(), plugin_read, plugin_write).await
        });
        PluginHandle::connect_io(
            "echo",
            host_read,
            host_write,
            &HandshakeConfig::default(),
            Duration::from_secs(5),
            Duration::from_secs(5),
        )
        .await
        .unwrap()
    }

    fn outbound(id: &str, content: &str) -> OutboundMessage {
        OutboundMessage {
            id: id.into(),
            conversation_id: "conv-1".into(),
            recipient_id: "user-9".into(),
            content_type: ContentType::Text,
            content: content.into(),
            metadata: HashMap::from([("reply_to".to_string(), "m0".to_string())]),
            attachments: vec![Attachment {
                kind: "image".into(),
                url: "https://cdn.example/cat.png".into(),
                mime_type: Some("image/png".into()),
                size_bytes: Some(2048),
                ..Default::default()
            }],
        }
    }

    struct Collector(mpsc::UnboundedSender<InboundMessage>);

    #[async_trait]
    impl MessageHandler for Collector {
        async fn handle_message(&self, message: InboundMessage) -> crate::error::Result<()> {
            let _ = self.0.send(message);
            Ok(())
        }
    }

    #[tokio::test]
    async fn remote_adapter_speaks_the_full_contract() {
        let sent = Sent::default();
        let handle = bridge(&sent).await;
        let adapter = handle.dispense().await.unwrap();

        assert_eq!(adapter.channel_info(), echo_info());
        assert_eq!(adapter.channel_type(), ChannelType::Telegram);
        assert!(adapter.capabilities().supports_interactive);

        adapter
            .initialize(HashMap::from([("bot_token".to_string(), "abc".to_string())]))
            .await
            .unwrap();
        assert!(!adapter.is_connected().await);
        adapter.connect().await.unwrap();
        assert!(adapter.is_connected().await);
        let status = adapter.connection_status().await;
        assert!(status.connected);
        assert!(status.last_connected_at.is_some());

        let message = outbound("m1", "hi");
        let result = adapter.send_message(message.clone()).await.unwrap();
        assert!(result.success);
        assert_eq!(result.status, MessageStatus::Delivered);
        assert_eq!(result.external_id.as_deref(), Some("m1"));
        assert_eq!(sent.lock().unwrap().as_slice(), &[message]);

        let upload = adapter.upload_media(Default::default()).await.unwrap();
        assert!(!upload.success);
        assert_eq!(upload.error.as_deref(), Some("not implemented"));
        assert!(adapter.download_media("media-1").await.unwrap().is_none());

        adapter.disconnect().await.unwrap();
        assert!(!adapter.is_connected().await);
    }

    #[tokio::test]
    async fn instances_in_one_process_are_isolated() {
        let sent = Sent::default();
        let handle = bridge(&sent).await;
        let first = handle.dispense().await.unwrap();
        let second = handle.dispense().await.unwrap();
        assert_ne!(first.instance(), second.instance());

        first.connect().await.unwrap();
        assert!(first.is_connected().await);
        assert!(!second.is_connected().await);
    }

    #[tokio::test]
    async fn inbound_notifications_reach_the_instance_handler() {
        let sent = Sent::default();
        let handle = bridge(&sent).await;
        let adapter = handle.dispense().await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        adapter.set_message_handler(Arc::new(Collector(tx)));

        adapter.send_message(outbound("m2", "ping")).await.unwrap();
        let echoed = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(echoed.content, "echo: ping");
        assert_eq!(echoed.external_id, "ext-m2");
    }

    #[tokio::test]
    async fn adapter_errors_on_send_come_back_in_band() {
        let sent = Sent::default();
        let handle = bridge(&sent).await;
        let adapter = handle.dispense().await.unwrap();

        let result = adapter.send_message(outbound("m3", "boom")).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.status, MessageStatus::Failed);
        assert!(result.error.unwrap().contains("adapter not connected"));
    }

    #[tokio::test]
    async fn protocol_violations_map_to_rpc_codes() {
        let sent = Sent::default();
        let handle = bridge(&sent).await;

        let err = handle
            .call(Method::Connect, serde_json::json!({"nope": 1}))
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Rpc { code: INVALID_PARAMS, .. }), "{err}");

        let err = handle
            .call(Method::InboundMessage, serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Rpc { code: INVALID_REQUEST, .. }), "{err}");
    }

    #[tokio::test]
    async fn dropped_adapters_are_released_inside_the_plugin() {
        let sent = Sent::default();
        let handle = bridge(&sent).await;
        for _ in 0..5 {
            let adapter = handle.dispense().await.unwrap();
            adapter.connect().await.unwrap();
            adapter.disconnect().await.unwrap();
        }

        // only this test and the template closure keep the log alive
        let mut live = usize::MAX;
        for _ in 0..200 {
            live = Arc::strong_count(&sent);
            if live == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(live, 2);
    }

    #[tokio::test]
    async fn only_dispensed_instances_answer() {
        let sent = Sent::default();
        let handle = bridge(&sent).await;

        let err = handle
            .call(Method::Connect, serde_json::json!({"instance": "ghost"}))
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Rpc { code: UNKNOWN_INSTANCE, .. }), "{err}");
        assert_eq!(Arc::strong_count(&sent), 2);

        handle
            .call(Method::Dispense, serde_json::json!({"instance": "a"}))
            .await
            .unwrap();
        let err = handle
            .call(Method::Dispense, serde_json::json!({"instance": "a"}))
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Rpc { code: INVALID_REQUEST, .. }), "{err}");

        let adapter = handle.dispense().await.unwrap();
        let id = adapter.instance().to_string();
        drop(adapter);
        let mut released = false;
        for _ in 0..200 {
            let answer = handle
                .call(Method::IsConnected, serde_json::json!({ "instance": id }))
                .await;
            if matches!(answer, Err(AdapterError::Rpc { code: UNKNOWN_INSTANCE, .. })) {
                released = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(released);
    }

    #[tokio::test]
    async fn mismatched_plugin_is_refused() {
        let sent = Sent::default();
        let sent_for_plugin = sent.clone();
        let template = InProcessTemplate::new(move || EchoAdapter {
            base: BaseAdapter::new(echo_info()),
            sent: sent_for_plugin.clone(),
            handler: StdMutex::new(None),
        });
        let newer = HandshakeConfig {
            protocol_version: 2,
            ..HandshakeConfig::default()
        };
        let (host_io, plugin_io) = duplex(4096);
        let (plugin_read, plugin_write) = split(plugin_io);
        let (host_read, host_write) = split(host_io);
        tokio::spawn(async move { serve_io(template, &newer, plugin_read, plugin_write).await });

        let err = PluginHandle::connect_io(
            "newer",
            host_read,
            host_write,
            &HandshakeConfig::default(),
            Duration::from_secs(5),
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AdapterError::Handshake { .. }), "{err}");
    }

    #[tokio::test]
    async fn dying_plugin_fails_pending_calls() {
        let (host_io, plugin_io) = duplex(4096);
        let (plugin_read, mut plugin_write) = split(plugin_io);
        let (host_read, host_write) = split(host_io);

        tokio::spawn(async move {
            let line = serde_json::to_string(&HandshakeConfig::default().line()).unwrap();
            plugin_write.write_all(line.as_bytes()).await.unwrap();
            plugin_write.write_all(b"\n").await.unwrap();
            let mut lines = tokio::io::BufReader::new(plugin_read).lines();
            // swallow one request, then die without answering
            let _ = lines.next_line().await;
        });

        let handle = PluginHandle::connect_io(
            "fragile",
            host_read,
            host_write,
            &HandshakeConfig::default(),
            Duration::from_secs(5),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        let err = handle
            .call(Method::Connect, serde_json::json!({"instance": "a"}))
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Transport { .. }), "{err}");
        assert!(!handle.is_alive());

        let err = handle
            .call(Method::Connect, serde_json::json!({"instance": "a"}))
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Transport { .. }), "{err}");
    }
}
