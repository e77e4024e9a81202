use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum_macros::{AsRefStr, Display, EnumString};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::Result;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
pub enum EventType {
    #[serde(rename = "message.received")]
    #[strum(serialize = "message.received")]
    MessageReceived,
    #[serde(rename = "message.sent")]
    #[strum(serialize = "message.sent")]
    MessageSent,
    #[serde(rename = "message.failed")]
    #[strum(serialize = "message.failed")]
    MessageFailed,
    #[serde(rename = "message.analyzed")]
    #[strum(serialize = "message.analyzed")]
    MessageAnalyzed,
    #[serde(rename = "contact.created")]
    #[strum(serialize = "contact.created")]
    ContactCreated,
    #[serde(rename = "conversation.created")]
    #[strum(serialize = "conversation.created")]
    ConversationCreated,
    #[serde(rename = "conversation.escalated")]
    #[strum(serialize = "conversation.escalated")]
    ConversationEscalated,
}

/// Envelope published to the bus on domain transitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventType,
    pub tenant_id: String,
    pub payload: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(kind: EventType, tenant_id: impl Into<String>) -> Self {
        Self {
            kind,
            tenant_id: tenant_id.into(),
            payload: Map::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.payload.insert(key.to_string(), value.into());
        self
    }

    /// Adds `key` only when `value` is present.
    pub fn with_opt(self, key: &str, value: Option<impl Into<Value>>) -> Self {
        match value {
            Some(value) => self.with(key, value),
            None => self,
        }
    }
}

/// Where use cases drop events. Never blocks and never fails the caller.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

/// The external bus the outbox forwards to.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &Event) -> Result<()>;
}

/// Publishes by writing each event to the `events` log target.
#[derive(Debug, Default, Clone)]
pub struct LogPublisher;

#[async_trait]
impl EventPublisher for LogPublisher {
    async fn publish(&self, event: &Event) -> Result<()> {
        let payload = serde_json::to_string(&event.payload)?;
        info!(
            target: "events",
            kind = %event.kind,
            tenant_id = %event.tenant_id,
            payload = %payload,
            "event published"
        );
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct OutboxConfig {
    pub capacity: usize,
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            max_attempts: 5,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl OutboxConfig {
    /// Exponential delay before retry `attempt` (1-based), capped, plus up
    /// to 50% random jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(1u32 << attempt.saturating_sub(1).min(16));
        let capped = exp.min(self.max_delay);
        let jitter_ms = capped.as_millis() as u64 / 2;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..=jitter_ms)
        };
        capped + Duration::from_millis(jitter)
    }
}

/// Bounded event queue drained by one worker that retries the publisher.
///
/// `emit` only enqueues: a full queue drops the event with a warning.
pub struct Outbox {
    tx: mpsc::Sender<Event>,
    shutdown: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Outbox {
    pub fn start<P>(publisher: P, config: OutboxConfig) -> Self
    where
        P: EventPublisher + 'static,
    {
        let (tx, rx) = mpsc::channel(config.capacity.max(1));
        let shutdown = CancellationToken::new();
        let worker = tokio::spawn(drain(publisher, rx, config, shutdown.clone()));
        Self {
            tx,
            shutdown,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Stop accepting work, publish whatever is queued and wait for the
    /// worker. Safe to call more than once.
    pub async fn close(&self) {
        self.shutdown.cancel();
        if let Some(worker) = self.worker.lock().await.take() {
            if let Err(err) = worker.await {
                error!("outbox worker panicked: {err}");
            }
        }
    }
}

impl EventSink for Outbox {
    fn emit(&self, event: Event) {
        if self.shutdown.is_cancelled() {
            warn!(kind = %event.kind, "outbox closed, dropping event");
            return;
        }
        if let Err(err) = self.tx.try_send(event) {
            let kind = match &err {
                mpsc::error::TrySendError::Full(e) | mpsc::error::TrySendError::Closed(e) => e.kind,
            };
            warn!(%kind, "outbox full, dropping event");
        }
    }
}

async fn drain<P: EventPublisher>(
    publisher: P,
    mut rx: mpsc::Receiver<Event>,
    config: OutboxConfig,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            event = rx.recv() => match event {
                Some(event) => deliver(&publisher, &event, &config, &shutdown).await,
                None => break,
            },
            _ = shutdown.cancelled() => break,
        }
    }
    rx.close();
    while let Ok(event) = rx.try_recv() {
        deliver(&publisher, &event, &config, &shutdown).await;
    }
    debug!("outbox drained");
}

async fn deliver<P: EventPublisher>(
    publisher: &P,
    event: &Event,
    config: &OutboxConfig,
    shutdown: &CancellationToken,
) {
    let mut attempt = 1;
    loop {
        match publisher.publish(event).await {
            Ok(()) => return,
            Err(err) if attempt >= config.max_attempts => {
                error!(kind = %event.kind, attempts = attempt, "giving up on event: {err}");
                return;
            }
            Err(err) => {
                let delay = config.backoff(attempt);
                warn!(kind = %event.kind, attempt, ?delay, "publish failed: {err}");
                // once shutting down, retry without waiting
                if !shutdown.is_cancelled() {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.cancelled() => {}
                    }
                }
                attempt += 1;
            }
        }
    }
}
