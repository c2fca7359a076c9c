//! End-to-end tests against a gateway served on a local port with the
//! in-memory log.

use event_gateway::{
    create_router, AppState, Gateway, GatewayConfig, LogBackend, LogBridge, MemoryLog,
};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
    addr: SocketAddr,
    log: Arc<MemoryLog>,
}

fn config() -> GatewayConfig {
    let mut config = GatewayConfig::new("handshake-secret", "pub-key", "sub-key");
    config.log.backend = LogBackend::Memory;
    config
}

async fn serve(config: GatewayConfig) -> TestServer {
    let log = Arc::new(MemoryLog::new());
    let bridge = Arc::new(LogBridge::new(log.clone(), log.clone()));
    let gateway = Gateway::new(config, bridge);
    gateway.start().await.unwrap();

    let app = create_router(Arc::new(AppState { gateway }));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    TestServer { addr, log }
}

async fn connect(addr: SocketAddr) -> Ws {
    let mut request = format!("ws://{}/ws", addr).into_client_request().unwrap();
    request.headers_mut().insert(
        AUTHORIZATION,
        HeaderValue::from_static("Bearer handshake-secret"),
    );
    let (ws, _) = connect_async(request).await.unwrap();
    ws
}

async fn send(ws: &mut Ws, msg: Value) {
    ws.send(Message::Text(msg.to_string().into())).await.unwrap();
}

/// Next server event, skipping control frames. `None` once the server closed.
async fn next_event(ws: &mut Ws) -> Option<Value> {
    loop {
        let frame = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("server responds in time");
        match frame {
            Some(Ok(Message::Text(text))) => {
                return Some(serde_json::from_str(text.as_str()).unwrap())
            }
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return None,
            Some(Ok(_)) => continue,
        }
    }
}

async fn expect_silence(ws: &mut Ws) {
    let quiet = async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return text.to_string(),
                Some(Ok(_)) => continue,
                _ => std::future::pending::<()>().await,
            }
        }
    };
    if let Ok(text) = timeout(Duration::from_millis(200), quiet).await {
        panic!("unexpected event: {}", text);
    }
}

fn record(event_name: &str) -> Value {
    json!({
        "eventVersion": "1.0",
        "eventSource": "bpms",
        "eventTime": "2024-01-01T00:00:00Z",
        "eventName": event_name,
        "eventType": "document",
        "eventMessage": {
            "info": {
                "data": {
                    "referenceId": "REF-1",
                    "documentId": "6f1c0f8e-2b5a-4a57-9f5e-2d4a3c1b0e9a",
                    "namespaceName": "contracts"
                }
            },
            "metadata": {
                "activityType": "upload",
                "trackingId": "0b6c1b3e-4f39-4d0e-9a52-8f9b1f0f3a11"
            }
        }
    })
}

fn publish(source_number: u32, event_name: &str, api_key: &str) -> Value {
    json!({
        "event": "publish",
        "data": {
            "eventData": { "sourceNumber": source_number, "payload": { "records": [record(event_name)] } },
            "apiKey": api_key
        }
    })
}

async fn subscribe(ws: &mut Ws, event: &str) {
    send(ws, json!({ "event": "subscribe", "data": { "event": event, "apiKey": "sub-key" } })).await;
    let ack = next_event(ws).await.unwrap();
    assert_eq!(ack["event"], "subscription-success");
}

#[tokio::test]
async fn test_handshake_requires_token() {
    let server = serve(config()).await;
    assert!(connect_async(format!("ws://{}/ws", server.addr)).await.is_err());

    let mut request = format!("ws://{}/ws", server.addr).into_client_request().unwrap();
    request
        .headers_mut()
        .insert(AUTHORIZATION, HeaderValue::from_static("Bearer wrong"));
    assert!(connect_async(request).await.is_err());
}

#[tokio::test]
async fn test_publish_reaches_subscriber() {
    let server = serve(config()).await;
    let mut subscriber = connect(server.addr).await;
    let mut publisher = connect(server.addr).await;
    subscribe(&mut subscriber, "doc.created").await;

    send(&mut publisher, publish(4, "doc.created", "pub-key")).await;
    let ack = next_event(&mut publisher).await.unwrap();
    assert_eq!(ack["event"], "trackingId");
    let tracking_id = ack["data"]["trackingId"].clone();

    let event = next_event(&mut subscriber).await.unwrap();
    assert_eq!(event["event"], "doc.created");
    assert_eq!(event["data"]["eventName"], "doc.created");
    assert_eq!(event["data"]["trackingId"], tracking_id);
}

#[tokio::test]
async fn test_durable_publish_is_written_once() {
    let server = serve(config()).await;
    let mut publisher = connect(server.addr).await;

    send(&mut publisher, publish(1, "doc.created", "pub-key")).await;
    let ack = next_event(&mut publisher).await.unwrap();
    assert_eq!(ack["event"], "trackingId");

    timeout(Duration::from_secs(2), async {
        while server.log.records("events").is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    let records = server.log.records("events");
    assert_eq!(records.len(), 1);
    let written: Value = serde_json::from_slice(&records[0]).unwrap();
    assert_eq!(written["trackingId"], ack["data"]["trackingId"]);
    assert_eq!(written["payload"], ack["data"]["payload"]);
}

#[tokio::test]
async fn test_invalid_publish_key_has_no_effect() {
    let server = serve(config()).await;
    let mut subscriber = connect(server.addr).await;
    let mut publisher = connect(server.addr).await;
    subscribe(&mut subscriber, "doc.created").await;

    send(&mut publisher, publish(4, "doc.created", "sub-key")).await;
    let err = next_event(&mut publisher).await.unwrap();
    assert_eq!(err["event"], "error");
    assert_eq!(err["data"], "Invalid API key");
    expect_silence(&mut subscriber).await;

    send(&mut publisher, publish(1, "doc.created", "nope")).await;
    assert_eq!(next_event(&mut publisher).await.unwrap()["event"], "error");
    assert!(server.log.records("events").is_empty());
}

#[tokio::test]
async fn test_capacity_limit() {
    let mut config = config();
    config.max_connections = 1;
    let server = serve(config).await;
    let mut first = connect(server.addr).await;
    send(&mut first, json!({ "event": "ping" })).await;
    assert_eq!(next_event(&mut first).await.unwrap()["event"], "pong");

    let mut second = connect(server.addr).await;
    let rejection = next_event(&mut second).await.unwrap();
    assert_eq!(rejection["event"], "connection-error");
    assert_eq!(rejection["data"], "Connection limit exceeded.");
    assert!(next_event(&mut second).await.is_none());

    // The admitted client is unaffected.
    send(&mut first, json!({ "event": "ping" })).await;
    assert_eq!(next_event(&mut first).await.unwrap()["event"], "pong");
}

#[tokio::test]
async fn test_inactive_client_is_evicted() {
    let mut config = config();
    config.inactivity_timeout = Duration::from_millis(300);
    let server = serve(config).await;
    let mut ws = connect(server.addr).await;

    let event = next_event(&mut ws).await.unwrap();
    assert_eq!(event["event"], "connection-inactive");
    assert!(next_event(&mut ws).await.is_none());
}

#[tokio::test]
async fn test_push_event_endpoint() {
    let server = serve(config()).await;
    let mut member = connect(server.addr).await;
    send(&mut member, json!({ "event": "subscribeToChannel", "data": { "channelId": "room-1" } })).await;
    assert_eq!(next_event(&mut member).await.unwrap()["event"], "subscription-success");

    let url = format!("http://{}/push-event", server.addr);
    let body = json!({ "sourceNumber": 4, "channelId": "room-1", "payload": { "records": [record("doc.created")] } });
    let http = reqwest::Client::new();

    let forbidden = http.post(&url).header("apikey", "sub-key").json(&body).send().await.unwrap();
    assert_eq!(forbidden.status().as_u16(), 403);

    let bad = http
        .post(&url)
        .header("apikey", "pub-key")
        .json(&json!({ "channelId": "room-1" }))
        .send()
        .await
        .unwrap();
    assert_eq!(bad.status().as_u16(), 400);

    let created = http.post(&url).header("apikey", "pub-key").json(&body).send().await.unwrap();
    assert_eq!(created.status().as_u16(), 201);
    let created: Value = created.json().await.unwrap();

    let event = next_event(&mut member).await.unwrap();
    assert_eq!(event["event"], "push-event");
    assert_eq!(event["data"]["trackingId"], created["trackingId"]);
    assert_eq!(event["data"]["channelId"], "room-1");
}

#[tokio::test]
async fn test_health() {
    let server = serve(config()).await;
    let _ws = connect(server.addr).await;
    // Admission happens after the upgrade completes on the server side.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let health: Value = reqwest::get(format!("http://{}/health", server.addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["clients"], 1);
    assert_eq!(health["topics"], 1);
}
