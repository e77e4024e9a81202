//! Outbound delivery. Persisted messages are queued per channel and handed
//! to the channel's adapter by a worker, so callers never wait on a
//! provider.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use channel_plugin::PluginRegistry;
use channel_plugin::message::{MessageStatus, OutboundMessage, SendResult, StatusCallback};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use opentelemetry::KeyValue;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domain::Message;
use crate::error::{GatewayError, Result};
use crate::events::{Event, EventSink, EventType};
use crate::logger::Metrics;
use crate::repository::MessageRepository;

pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// A persisted message and the channel it leaves through.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tenant_id: String,
    pub channel_id: String,
    pub message: OutboundMessage,
}

#[async_trait]
pub trait OutboundQueue: Send + Sync {
    /// Accepts the delivery or fails right away. Never waits for the send.
    async fn enqueue(&self, delivery: Delivery) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Pending deliveries per channel before `enqueue` reports rate limiting.
    pub lane_capacity: usize,
    pub send_timeout: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            lane_capacity: 256,
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }
}

struct Worker {
    registry: Arc<PluginRegistry>,
    messages: Arc<dyn MessageRepository>,
    events: Arc<dyn EventSink>,
    metrics: Metrics,
    send_timeout: Duration,
}

/// One ordered lane per channel. Each message is attempted once; a provider
/// failure marks it failed rather than retrying.
pub struct DeliveryQueue {
    worker: Arc<Worker>,
    lanes: DashMap<String, mpsc::Sender<Delivery>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    closed: CancellationToken,
    lane_capacity: usize,
}

impl DeliveryQueue {
    pub fn new(
        registry: Arc<PluginRegistry>,
        messages: Arc<dyn MessageRepository>,
        events: Arc<dyn EventSink>,
        metrics: Metrics,
        config: DeliveryConfig,
    ) -> Self {
        Self {
            worker: Arc::new(Worker {
                registry,
                messages,
                events,
                metrics,
                send_timeout: config.send_timeout,
            }),
            lanes: DashMap::new(),
            handles: Mutex::new(Vec::new()),
            closed: CancellationToken::new(),
            lane_capacity: config.lane_capacity.max(1),
        }
    }

    /// Applies a provider status report to the stored message. Reports are
    /// matched on our message id first, then the provider id within
    /// `channel_id`. Backwards
    /// moves are ignored. Returns whether the message changed.
    pub async fn apply_status(
        &self,
        tenant_id: &str,
        channel_id: &str,
        status: StatusCallback,
    ) -> Result<bool> {
        let messages = &self.worker.messages;
        let found = if !status.message_id.is_empty() {
            messages.find_by_id(&status.message_id).await?
        } else {
            None
        };
        let found = match found {
            Some(message) => Some(message),
            None if !status.external_id.is_empty() => {
                messages.find_by_external_id(channel_id, &status.external_id).await?
            }
            None => None,
        };
        let Some(mut message) = found else {
            debug!(
                message_id = %status.message_id,
                external_id = %status.external_id,
                "status for unknown message"
            );
            return Ok(false);
        };

        if !message.advance(status.status, status.error.clone()) {
            debug!(message_id = %message.id, from = %message.status, to = %status.status, "stale status ignored");
            return Ok(false);
        }
        if message.external_id.is_none() && !status.external_id.is_empty() {
            message.external_id = Some(status.external_id.clone());
        }
        messages.update(&message).await?;
        if message.status == MessageStatus::Failed {
            self.worker.events.emit(
                Event::new(EventType::MessageFailed, tenant_id)
                    .with("message_id", message.id.as_str())
                    .with("conversation_id", message.conversation_id.as_str())
                    .with_opt("error", message.error.clone()),
            );
        }
        Ok(true)
    }

    /// Stops accepting deliveries and waits until every lane is drained.
    pub async fn close(&self) {
        self.closed.cancel();
        self.lanes.clear();
        let handles: Vec<_> = self.handles.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(err) = handle.await {
                error!("delivery lane panicked: {err}");
            }
        }
        info!("delivery queue closed");
    }
}

#[async_trait]
impl OutboundQueue for DeliveryQueue {
    async fn enqueue(&self, delivery: Delivery) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(GatewayError::internal("delivery queue closed"));
        }
        let (tx, spawned) = match self.lanes.entry(delivery.channel_id.clone()) {
            Entry::Occupied(lane) => (lane.get().clone(), None),
            Entry::Vacant(slot) => {
                let (tx, rx) = mpsc::channel(self.lane_capacity);
                let handle = tokio::spawn(run_lane(
                    Arc::clone(&self.worker),
                    delivery.channel_id.clone(),
                    rx,
                ));
                slot.insert(tx.clone());
                (tx, Some(handle))
            }
        };
        if let Some(handle) = spawned {
            self.handles.lock().await.push(handle);
        }
        tx.try_send(delivery).map_err(|err| match err {
            mpsc::error::TrySendError::Full(d) => GatewayError::RateLimited(format!(
                "delivery queue full for channel {}",
                d.channel_id
            )),
            mpsc::error::TrySendError::Closed(_) => GatewayError::internal("delivery queue closed"),
        })
    }
}

async fn run_lane(worker: Arc<Worker>, channel_id: String, mut rx: mpsc::Receiver<Delivery>) {
    debug!(%channel_id, "delivery lane started");
    while let Some(delivery) = rx.recv().await {
        worker.deliver(delivery).await;
    }
    debug!(%channel_id, "delivery lane drained");
}

impl Worker {
    async fn deliver(&self, delivery: Delivery) {
        let Delivery {
            tenant_id,
            channel_id,
            message,
        } = delivery;
        let message_id = message.id.clone();
        let result = self.send(&channel_id, message).await;
        if let Err(err) = self.record(&tenant_id, &channel_id, &message_id, result).await {
            error!(%message_id, %channel_id, "recording send result failed: {err}");
        }
    }

    async fn send(&self, channel_id: &str, message: OutboundMessage) -> SendResult {
        let Some(adapter) = self.registry.get_adapter_by_channel_id(channel_id).await else {
            return SendResult::failed(format!("channel {channel_id} is not configured"));
        };
        match tokio::time::timeout(self.send_timeout, adapter.send_message(message)).await {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => SendResult::failed(err.to_string()),
            Err(_) => SendResult::failed(format!("send timed out after {:?}", self.send_timeout)),
        }
    }

    async fn record(
        &self,
        tenant_id: &str,
        channel_id: &str,
        message_id: &str,
        result: SendResult,
    ) -> Result<()> {
        let mut message: Message = self
            .messages
            .find_by_id(message_id)
            .await?
            .ok_or_else(|| GatewayError::not_found("message not found"))?;
        let attrs = [KeyValue::new("channel_id", channel_id.to_string())];

        if result.success {
            if let Some(external_id) = result.external_id.filter(|e| !e.is_empty()) {
                message.external_id = Some(external_id);
            }
            let status = match result.status {
                MessageStatus::Pending | MessageStatus::Failed => MessageStatus::Sent,
                status => status,
            };
            message.advance(status, None);
            self.messages.update(&message).await?;
            self.metrics.messages_sent.add(1, &attrs);
            debug!(%message_id, %channel_id, status = %message.status, "message sent");
            self.events.emit(
                Event::new(EventType::MessageSent, tenant_id)
                    .with("message_id", message.id.as_str())
                    .with("conversation_id", message.conversation_id.as_str())
                    .with("channel_id", channel_id)
                    .with("status", message.status.as_ref())
                    .with_opt("external_id", message.external_id.clone()),
            );
        } else {
            let reason = result.error.unwrap_or_else(|| "send failed".to_string());
            warn!(%message_id, %channel_id, "delivery failed: {reason}");
            message.advance(MessageStatus::Failed, Some(reason.clone()));
            self.messages.update(&message).await?;
            self.metrics.messages_failed.add(1, &attrs);
            self.events.emit(
                Event::new(EventType::MessageFailed, tenant_id)
                    .with("message_id", message.id.as_str())
                    .with("conversation_id", message.conversation_id.as_str())
                    .with("channel_id", channel_id)
                    .with("error", reason),
            );
        }
        Ok(())
    }
}
