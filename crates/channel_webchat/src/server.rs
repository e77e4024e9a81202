use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use channel_plugin::message::ChannelType;
use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_hdr_async_with_config;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::form_urlencoded;
use uuid::Uuid;

use crate::adapter::WidgetSettings;
use crate::client::{ClientEvents, Timings, run_client};
use crate::hub::{ClientInfo, Hub, HubError};

/// Channel metadata the upgrade endpoint needs to accept a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelListing {
    pub channel_type: ChannelType,
    pub active: bool,
}

/// Source of truth for which channels exist. Looked up synchronously inside
/// the HTTP upgrade callback.
pub trait ChannelDirectory: Send + Sync {
    fn lookup(&self, channel_id: &str) -> Option<ChannelListing>;
}

/// Everything a connection on one webchat channel needs.
#[derive(Clone)]
pub struct Route {
    pub hub: Hub,
    pub settings: Arc<WidgetSettings>,
    pub events: Arc<dyn ClientEvents>,
    pub tenant_id: String,
}

/// Live webchat channels keyed by channel id, shared by the adapters that
/// publish them and the server that accepts connections for them.
#[derive(Clone, Default)]
pub struct WebchatRoutes {
    routes: Arc<DashMap<String, Route>>,
}

impl WebchatRoutes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, channel_id: impl Into<String>, route: Route) {
        self.routes.insert(channel_id.into(), route);
    }

    pub fn remove(&self, channel_id: &str) -> bool {
        self.routes.remove(channel_id).is_some()
    }

    pub fn get(&self, channel_id: &str) -> Option<Route> {
        self.routes.get(channel_id).map(|r| r.value().clone())
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Index a connected session under its conversation so agent replies
    /// can fan out to every tab of the visitor. Unknown channels are ignored.
    pub fn bind_conversation(
        &self,
        channel_id: &str,
        session_id: &str,
        conversation_id: &str,
        contact_id: Option<String>,
    ) -> Result<(), HubError> {
        match self.get(channel_id) {
            Some(route) => route.hub.bind_conversation(session_id, conversation_id, contact_id),
            None => Ok(()),
        }
    }
}

impl ChannelDirectory for WebchatRoutes {
    fn lookup(&self, channel_id: &str) -> Option<ChannelListing> {
        self.routes.contains_key(channel_id).then_some(ChannelListing {
            channel_type: ChannelType::Webchat,
            active: true,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub status: StatusCode,
    pub message: &'static str,
}

impl Rejection {
    fn new(status: StatusCode, message: &'static str) -> Self {
        Self { status, message }
    }

    fn into_response(self) -> ErrorResponse {
        let mut response = ErrorResponse::new(Some(self.message.to_string()));
        *response.status_mut() = self.status;
        response
    }
}

pub struct Accepted {
    pub info: ClientInfo,
    pub route: Route,
}

/// Check the upgrade query against the directory and build the client's
/// identity. `session_id` is reused when supplied, otherwise minted.
pub fn validate(
    query: &str,
    directory: &dyn ChannelDirectory,
    routes: &WebchatRoutes,
) -> Result<Accepted, Rejection> {
    let params: HashMap<String, String> = form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect();
    let param = |key: &str| params.get(key).filter(|v| !v.is_empty()).cloned();

    let channel_id = param("channel_id")
        .ok_or_else(|| Rejection::new(StatusCode::BAD_REQUEST, "channel_id is required"))?;
    let listing = directory
        .lookup(&channel_id)
        .ok_or_else(|| Rejection::new(StatusCode::NOT_FOUND, "channel not found"))?;
    if listing.channel_type != ChannelType::Webchat {
        return Err(Rejection::new(StatusCode::BAD_REQUEST, "invalid channel type"));
    }
    let route = routes
        .get(&channel_id)
        .filter(|_| listing.active)
        .ok_or_else(|| Rejection::new(StatusCode::SERVICE_UNAVAILABLE, "channel not active"))?;

    let metadata = ["name", "email", "phone"]
        .into_iter()
        .filter_map(|key| param(key).map(|v| (key.to_string(), v)))
        .collect();
    let info = ClientInfo {
        session_id: param("session_id").unwrap_or_else(|| Uuid::new_v4().to_string()),
        conversation_id: param("conversation_id"),
        tenant_id: route.tenant_id.clone(),
        channel_id,
        contact_id: None,
        metadata,
    };
    Ok(Accepted { info, route })
}

/// Accept widget connections until `shutdown` fires.
pub async fn serve(
    listener: TcpListener,
    routes: WebchatRoutes,
    directory: Arc<dyn ChannelDirectory>,
    timings: Timings,
    shutdown: CancellationToken,
) {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "webchat server listening");
    }
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(handle_connection(
                        stream,
                        peer,
                        routes.clone(),
                        Arc::clone(&directory),
                        timings,
                    ));
                }
                Err(err) => warn!("accept failed: {err}"),
            }
        }
    }
    info!("webchat server stopped");
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    routes: WebchatRoutes,
    directory: Arc<dyn ChannelDirectory>,
    timings: Timings,
) {
    let mut accepted = None;
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let query = request.uri().query().unwrap_or_default();
        match validate(query, directory.as_ref(), &routes) {
            Ok(ok) => {
                accepted = Some(ok);
                Ok(response)
            }
            Err(rejection) => {
                debug!(%peer, status = %rejection.status, "upgrade rejected: {}", rejection.message);
                Err(rejection.into_response())
            }
        }
    };
    let config = WebSocketConfig::default()
        .max_message_size(Some(timings.max_message_size))
        .max_frame_size(Some(timings.max_message_size));

    let ws = match accept_hdr_async_with_config(stream, callback, Some(config)).await {
        Ok(ws) => ws,
        Err(err) => {
            debug!(%peer, "websocket handshake failed: {err}");
            return;
        }
    };
    let Some(Accepted { info, route }) = accepted else {
        return;
    };
    run_client(ws, info, route, timings).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Envelope, FrameType, Payload};
    use async_trait::async_trait;
    use channel_plugin::AdapterError;
    use futures_util::{SinkExt, StreamExt};
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::Message as WsMsg;

    struct Directory(HashMap<String, ChannelListing>);

    impl ChannelDirectory for Directory {
        fn lookup(&self, channel_id: &str) -> Option<ChannelListing> {
            self.0.get(channel_id).copied()
        }
    }

    struct Recorder(mpsc::UnboundedSender<(String, Payload)>);

    #[async_trait]
    impl ClientEvents for Recorder {
        async fn on_connect(&self, _client: &ClientInfo) {}

        async fn on_message(&self, client: &ClientInfo, payload: Payload) -> Result<(), AdapterError> {
            if payload.content.as_deref() == Some("fail") {
                return Err(AdapterError::NoHandler);
            }
            let _ = self.0.send((client.session_id.clone(), payload));
            Ok(())
        }

        async fn on_disconnect(&self, _client: &ClientInfo) {}
    }

    fn setup() -> (Directory, WebchatRoutes, mpsc::UnboundedReceiver<(String, Payload)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let routes = WebchatRoutes::new();
        routes.insert(
            "web-1",
            Route {
                hub: Hub::start(),
                settings: Arc::new(WidgetSettings::default()),
                events: Arc::new(Recorder(tx)),
                tenant_id: "t1".into(),
            },
        );
        let listing = |channel_type, active| ChannelListing { channel_type, active };
        let directory = Directory(HashMap::from([
            ("web-1".to_string(), listing(ChannelType::Webchat, true)),
            ("web-off".to_string(), listing(ChannelType::Webchat, false)),
            ("sms-1".to_string(), listing(ChannelType::Sms, true)),
        ]));
        (directory, routes, rx)
    }

    #[tokio::test]
    async fn upgrade_checks_run_in_order() {
        let (directory, routes, _rx) = setup();
        let reject = |query: &str| validate(query, &directory, &routes).err().unwrap();

        assert_eq!(reject(""), Rejection::new(StatusCode::BAD_REQUEST, "channel_id is required"));
        assert_eq!(reject("channel_id=nope"), Rejection::new(StatusCode::NOT_FOUND, "channel not found"));
        assert_eq!(reject("channel_id=sms-1"), Rejection::new(StatusCode::BAD_REQUEST, "invalid channel type"));
        assert_eq!(
            reject("channel_id=web-off"),
            Rejection::new(StatusCode::SERVICE_UNAVAILABLE, "channel not active")
        );
    }

    #[tokio::test]
    async fn accepted_client_carries_visitor_details() {
        let (directory, routes, _rx) = setup();
        let ok = validate(
            "channel_id=web-1&session_id=s-9&conversation_id=c-1&name=Ada%20L&email=ada%40x.io",
            &directory,
            &routes,
        )
        .ok()
        .unwrap();
        assert_eq!(ok.info.session_id, "s-9");
        assert_eq!(ok.info.conversation_id.as_deref(), Some("c-1"));
        assert_eq!(ok.info.tenant_id, "t1");
        assert_eq!(ok.info.metadata["name"], "Ada L");
        assert_eq!(ok.info.metadata["email"], "ada@x.io");
        assert!(!ok.info.metadata.contains_key("phone"));

        let fresh = validate("channel_id=web-1", &directory, &routes).ok().unwrap();
        assert!(Uuid::parse_str(&fresh.info.session_id).is_ok());
    }

    async fn next_frame<S>(ws: &mut S) -> Envelope
    where
        S: futures_util::Stream<Item = Result<WsMsg, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if let WsMsg::Text(text) = frame {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn widget_round_trip_over_a_real_socket() {
        let (directory, routes, mut rx) = setup();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(serve(
            listener,
            routes.clone(),
            Arc::new(directory),
            Timings::default(),
            shutdown.clone(),
        ));

        let url = format!("ws://{addr}/ws?channel_id=web-1&session_id=s-1");
        let (mut ws, _) = connect_async(url).await.unwrap();

        let connect = next_frame(&mut ws).await;
        assert_eq!(connect.kind, FrameType::Connect);
        assert_eq!(connect.payload.metadata["widget_title"], "Chat with us");

        ws.send(WsMsg::text("not json")).await.unwrap();
        let err = next_frame(&mut ws).await;
        assert_eq!(err.payload.error.as_deref(), Some("invalid message format"));

        ws.send(WsMsg::text(r#"{"type":"message","payload":{"id":"c-1","content":"hi"}}"#))
            .await
            .unwrap();
        let ack = next_frame(&mut ws).await;
        assert_eq!(ack.kind, FrameType::Ack);
        assert_eq!(ack.payload.id.as_deref(), Some("c-1"));
        let (session, payload) = rx.recv().await.unwrap();
        assert_eq!(session, "s-1");
        assert_eq!(payload.content.as_deref(), Some("hi"));

        ws.send(WsMsg::text(r#"{"type":"message","payload":{"content":"fail"}}"#))
            .await
            .unwrap();
        let err = next_frame(&mut ws).await;
        assert_eq!(err.payload.error.as_deref(), Some("no message handler configured"));

        let hub = routes.get("web-1").unwrap().hub;
        hub.bind_conversation("s-1", "conv-1", None).unwrap();
        assert_eq!(hub.broadcast_counted("conv-1", Envelope::typing(true)).await.unwrap(), 1);
        assert!(next_frame(&mut ws).await.payload.is_typing);

        ws.close(None).await.unwrap();
        let mut gone = false;
        for _ in 0..50 {
            if hub.client_count().await.unwrap() == 0 {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(gone);

        let url = format!("ws://{addr}/ws?channel_id=missing");
        let err = connect_async(url).await.err().unwrap();
        match err {
            tokio_tungstenite::tungstenite::Error::Http(response) => {
                assert_eq!(response.status(), StatusCode::NOT_FOUND)
            }
            other => panic!("unexpected error: {other}"),
        }
        shutdown.cancel();
    }
}
