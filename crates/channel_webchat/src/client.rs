use std::time::Duration;

use async_trait::async_trait;
use channel_plugin::AdapterError;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::{Instant, interval_at, timeout, timeout_at};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message as WsMsg;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::envelope::{Envelope, FrameType, Payload};
use crate::hub::{CLIENT_BUFFER, ClientInfo};
use crate::server::Route;

/// Connection timings. The ping period must stay below the pong wait.
#[derive(Debug, Clone, Copy)]
pub struct Timings {
    pub write_wait: Duration,
    pub pong_wait: Duration,
    pub ping_period: Duration,
    pub max_message_size: usize,
}

impl Timings {
    pub fn with_pong_wait(pong_wait: Duration) -> Self {
        Self {
            pong_wait,
            ping_period: pong_wait * 9 / 10,
            ..Self::default()
        }
    }
}

impl Default for Timings {
    fn default() -> Self {
        let pong_wait = Duration::from_secs(60);
        Self {
            write_wait: Duration::from_secs(10),
            pong_wait,
            ping_period: pong_wait * 9 / 10,
            max_message_size: 512 * 1024,
        }
    }
}

/// Lifecycle callbacks for widget connections.
#[async_trait]
pub trait ClientEvents: Send + Sync {
    async fn on_connect(&self, client: &ClientInfo);

    /// A chat message from the widget. `Ok` is acknowledged to the client,
    /// `Err` is reported back as an error frame.
    async fn on_message(&self, client: &ClientInfo, payload: Payload) -> Result<(), AdapterError>;

    /// The widget displayed one of our messages.
    async fn on_read(&self, _client: &ClientInfo, _message_id: String) {}

    async fn on_disconnect(&self, client: &ClientInfo);
}

/// Drive one upgraded connection until either side goes away.
///
/// The writer task owns the socket's sink and is the only place frames are
/// written; everything else reaches the client through the hub.
pub async fn run_client<S>(ws: WebSocketStream<S>, info: ClientInfo, route: Route, timings: Timings)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(CLIENT_BUFFER);
    let client_id = match route.hub.register(info.clone(), tx).await {
        Ok(id) => id,
        Err(err) => {
            warn!(session_id = %info.session_id, "rejecting client: {err}");
            let (mut sink, _) = ws.split();
            let _ = timeout(timings.write_wait, sink.send(WsMsg::Close(None))).await;
            return;
        }
    };

    let (sink, mut stream) = ws.split();
    let cancel = CancellationToken::new();
    let writer = tokio::spawn(write_loop(sink, rx, timings, cancel.clone()));

    route.hub.push_to_session(
        &info.session_id,
        Envelope::connect(&info.session_id, &route.settings.widget_title, &route.settings.widget_color),
    );
    info!(session_id = %info.session_id, channel_id = %info.channel_id, "webchat client connected");
    route.events.on_connect(&info).await;

    let mut deadline = Instant::now() + timings.pong_wait;
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = timeout_at(deadline, stream.next()) => next,
        };
        let frame = match next {
            Err(_) => {
                debug!(session_id = %info.session_id, "pong wait elapsed");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(err))) => {
                debug!(session_id = %info.session_id, "read error: {err}");
                break;
            }
            Ok(Some(Ok(frame))) => frame,
        };
        match frame {
            WsMsg::Text(text) => handle_text(text.as_str(), &info, &route).await,
            WsMsg::Pong(_) => deadline = Instant::now() + timings.pong_wait,
            WsMsg::Close(_) => break,
            _ => {}
        }
    }

    cancel.cancel();
    route.hub.unregister(&info.session_id, client_id);
    let _ = writer.await;
    info!(session_id = %info.session_id, "webchat client disconnected");
    route.events.on_disconnect(&info).await;
}

async fn handle_text(text: &str, info: &ClientInfo, route: &Route) {
    let envelope: Envelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(err) => {
            debug!(session_id = %info.session_id, "unparseable frame: {err}");
            route.hub.push_to_session(&info.session_id, Envelope::error("invalid message format"));
            return;
        }
    };

    match envelope.kind {
        FrameType::Message => {
            let id = envelope.payload.id.clone();
            let reply = match route.events.on_message(info, envelope.payload).await {
                Ok(()) => Envelope::ack(id),
                Err(err) => Envelope::error(err.to_string()),
            };
            route.hub.push_to_session(&info.session_id, reply);
        }
        FrameType::Read => match envelope.payload.id {
            Some(message_id) => route.events.on_read(info, message_id).await,
            None => debug!(session_id = %info.session_id, "read frame without id"),
        },
        FrameType::Typing => debug!(session_id = %info.session_id, "client typing"),
        other => debug!(session_id = %info.session_id, kind = ?other, "ignoring frame"),
    }
}

async fn write_loop<S>(
    mut sink: SplitSink<WebSocketStream<S>, WsMsg>,
    mut rx: mpsc::Receiver<Envelope>,
    timings: Timings,
    cancel: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut ping = interval_at(Instant::now() + timings.ping_period, timings.ping_period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = rx.recv() => {
                let Some(envelope) = frame else {
                    // hub closed the buffer
                    let _ = timeout(timings.write_wait, sink.send(WsMsg::Close(None))).await;
                    break;
                };
                let text = match serde_json::to_string(&envelope) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!("dropping unserializable frame: {err}");
                        continue;
                    }
                };
                if !write(&mut sink, WsMsg::text(text), timings.write_wait).await {
                    break;
                }
            }
            _ = ping.tick() => {
                if !write(&mut sink, WsMsg::Ping(Default::default()), timings.write_wait).await {
                    break;
                }
            }
        }
    }
    cancel.cancel();
}

async fn write<S>(sink: &mut SplitSink<WebSocketStream<S>, WsMsg>, frame: WsMsg, wait: Duration) -> bool
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    match timeout(wait, sink.send(frame)).await {
        Ok(Ok(())) => true,
        Ok(Err(err)) => {
            debug!("write failed: {err}");
            false
        }
        Err(_) => {
            debug!("write deadline exceeded");
            false
        }
    }
}
