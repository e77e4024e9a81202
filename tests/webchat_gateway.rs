use std::sync::{Arc, Mutex};
use std::time::Duration;

use channel_plugin::message::MessageStatus;
use channel_webchat::{Envelope, FrameType, Timings};
use futures_util::{SinkExt, Stream, StreamExt};
use omnigate::analysis::IntentService;
use omnigate::config::GatewayFile;
use omnigate::domain::SenderType;
use omnigate::events::{Event, EventSink, EventType};
use omnigate::repository::{InMemoryStore, MessageRepository, Repositories};
use omnigate::usecase::{EscalationReason, EscalationStatus, SendMessageInput};
use omnigate::{Gateway, GatewayConfig};
use tokio::net::TcpListener;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMsg;
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_util::sync::CancellationToken;

const FILE: &str = r#"
channels:
  - id: web
    tenant_id: t1
    type: webchat
    name: Site
    config:
      welcome_message: Hello! How can we help?
  - id: web-off
    tenant_id: t1
    type: webchat
    enabled: false
"#;

#[derive(Default)]
struct Collected(Mutex<Vec<Event>>);

impl Collected {
    fn of(&self, kind: EventType) -> Vec<Event> {
        self.0.lock().unwrap().iter().filter(|e| e.kind == kind).cloned().collect()
    }
}

impl EventSink for Collected {
    fn emit(&self, event: Event) {
        self.0.lock().unwrap().push(event);
    }
}

async fn next_frame<S>(ws: &mut S) -> Envelope
where
    S: Stream<Item = Result<WsMsg, tokio_tungstenite::tungstenite::Error>> + Unpin,
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

async fn wait_for(store: &InMemoryStore, message_id: &str, wanted: MessageStatus) -> MessageStatus {
    let mut status = MessageStatus::Pending;
    for _ in 0..100 {
        status = MessageRepository::find_by_id(store, message_id).await.unwrap().unwrap().status;
        if status == wanted {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    status
}

#[tokio::test]
async fn widget_conversation_end_to_end() {
    let store = Arc::new(InMemoryStore::new());
    let events = Arc::new(Collected::default());
    let gateway = Gateway::new(
        Repositories::in_memory(store.clone()),
        IntentService::new(),
        events.clone(),
        None,
        GatewayConfig::default(),
    )
    .await;
    assert_eq!(gateway.start(&GatewayFile::parse(FILE).unwrap()).await.unwrap(), 1);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let stop = CancellationToken::new();
    tokio::spawn(channel_webchat::server::serve(
        listener,
        gateway.routes(),
        gateway.directory(),
        Timings::default(),
        stop.clone(),
    ));

    let (mut ws, _) = connect_async(format!("ws://{addr}/ws?channel_id=web&session_id=s-1&name=Ana"))
        .await
        .unwrap();
    assert_eq!(next_frame(&mut ws).await.kind, FrameType::Connect);
    let welcome = next_frame(&mut ws).await;
    assert_eq!(welcome.payload.content.as_deref(), Some("Hello! How can we help?"));

    ws.send(WsMsg::text(r#"{"type":"message","payload":{"id":"w-1","content":"Where is my order?"}}"#))
        .await
        .unwrap();
    let ack = next_frame(&mut ws).await;
    assert_eq!(ack.kind, FrameType::Ack);

    let received = events.of(EventType::MessageReceived);
    assert_eq!(received.len(), 1);
    let conversation_id = received[0].payload["conversation_id"].as_str().unwrap().to_string();
    let created = events.of(EventType::ContactCreated);
    assert_eq!(created.len(), 1);

    // agent reply reaches the widget and the read receipt moves it on
    let mut reply = SendMessageInput::text("t1", &conversation_id, SenderType::User, "Let me check for you");
    reply.sender_id = Some("agent-7".into());
    let sent = gateway.send_message(reply).await.unwrap();

    let frame = loop {
        let frame = next_frame(&mut ws).await;
        if frame.kind == FrameType::Message {
            break frame;
        }
    };
    assert_eq!(frame.payload.content.as_deref(), Some("Let me check for you"));
    assert_eq!(frame.payload.id.as_deref(), Some(sent.id.as_str()));

    assert_eq!(wait_for(&store, &sent.id, MessageStatus::Delivered).await, MessageStatus::Delivered);
    ws.send(WsMsg::text(format!(r#"{{"type":"read","payload":{{"id":"{}"}}}}"#, sent.id)))
        .await
        .unwrap();
    assert_eq!(wait_for(&store, &sent.id, MessageStatus::Read).await, MessageStatus::Read);

    let escalation = gateway.escalate_from_user("t1", &conversation_id).await.unwrap();
    assert_eq!(escalation.status, EscalationStatus::Queued);
    assert_eq!(escalation.queue_position, Some(1));
    assert_eq!(escalation.estimated_wait_seconds, Some(120));

    let context = gateway.escalation_context("t1", &conversation_id, false).await.unwrap();
    assert_eq!(context.reason, EscalationReason::UserRequest);
    assert_eq!(context.customer.name, "Ana");
    assert_eq!(context.message_count, 2);
    assert!(context.summary.is_none());

    for (query, expected) in [
        ("channel_id=nope", StatusCode::NOT_FOUND),
        ("channel_id=web-off", StatusCode::SERVICE_UNAVAILABLE),
    ] {
        match connect_async(format!("ws://{addr}/ws?{query}")).await {
            Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
                assert_eq!(response.status(), expected)
            }
            other => panic!("expected http rejection, got {:?}", other.map(|_| ())),
        }
    }

    ws.close(None).await.unwrap();
    stop.cancel();
    gateway.shutdown().await;
}
