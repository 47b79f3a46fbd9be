//! The network server on an ephemeral port: WebSocket frames, the long-poll
//! transport and the health endpoint.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use tavern_chat::client::{ChatClient, ChatEvent, ClientOptions, ConnectionState, PollingConnector};
use tavern_chat::{ChatConfig, ChatServer, ClientConfig, ServerEvent};

async fn start_server() -> SocketAddr {
    let config = ChatConfig {
        port: 0,
        poll_wait_ms: 200,
        ..Default::default()
    };
    let server = ChatServer::bind(config).await.expect("bind");
    let addr = server.local_addr().expect("local addr");
    tokio::spawn(server.run());
    addr
}

type WsStream = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn next_event(ws: &mut WsStream) -> serde_json::Value {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("websocket error");
        if let WsMessage::Text(text) = frame {
            return serde_json::from_str(&text).expect("server sent invalid JSON");
        }
    }
}

async fn next_named(ws: &mut WsStream, name: &str) -> serde_json::Value {
    loop {
        let event = next_event(ws).await;
        if event["event"] == name {
            return event;
        }
    }
}

#[tokio::test]
async fn test_websocket_join_and_chat() {
    let addr = start_server().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws")).await.unwrap();

    ws.send(WsMessage::Text(
        r#"{"event":"join_chat","data":{"username":"Alice"}}"#.to_string(),
    ))
    .await
    .unwrap();
    let joined = next_named(&mut ws, "join_success").await;
    assert_eq!(joined["data"]["username"], "Alice");
    assert_eq!(joined["data"]["isAdmin"], false);

    ws.send(WsMessage::Text(
        r#"{"event":"send_message","data":{"content":"hello"}}"#.to_string(),
    ))
    .await
    .unwrap();
    let msg = next_named(&mut ws, "new_message").await;
    assert_eq!(msg["data"]["senderName"], "Alice");
    assert_eq!(msg["data"]["content"], "hello");
    assert_eq!(msg["data"]["type"], "public");
}

#[tokio::test]
async fn test_websocket_malformed_frame_gets_error_and_stays_open() {
    let addr = start_server().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws")).await.unwrap();

    ws.send(WsMessage::Text("{not json".to_string())).await.unwrap();
    let err = next_named(&mut ws, "error").await;
    assert_eq!(err["data"]["code"], "malformed_event");

    ws.send(WsMessage::Text(r#"{"event":"join_chat","data":{}}"#.to_string()))
        .await
        .unwrap();
    let joined = next_named(&mut ws, "join_success").await;
    assert!(joined["data"]["username"].as_str().is_some_and(|n| !n.is_empty()));
}

#[tokio::test]
async fn test_health_endpoint() {
    let addr = start_server().await;
    let body: serde_json::Value = reqwest::get(format!("http://{addr}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_unknown_poll_connection_is_404() {
    let addr = start_server().await;
    let resp = reqwest::get(format!("http://{addr}/poll/nope")).await.unwrap();
    assert_eq!(resp.status().as_u16(), 404);
}

#[tokio::test]
async fn test_polling_client_talks_to_websocket_client() {
    let addr = start_server().await;

    let polling = PollingConnector::new(format!("http://{addr}"), None).unwrap();
    let client = ChatClient::start(
        polling,
        ClientOptions {
            username: Some("Bob".into()),
            config: ClientConfig { retry_delay_ms: 50, ..Default::default() },
            ..Default::default()
        },
    );
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    client.subscribe(move |event| {
        if let ChatEvent::Server(ServerEvent::NewMessage(m)) = event {
            sink.lock().unwrap().push((m.sender_name.clone(), m.content.clone()));
        }
    });
    assert!(client.wait_for_state(ConnectionState::Connected, Duration::from_secs(3)).await);

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws")).await.unwrap();
    ws.send(WsMessage::Text(
        r#"{"event":"join_chat","data":{"username":"Alice"}}"#.to_string(),
    ))
    .await
    .unwrap();
    next_named(&mut ws, "join_success").await;

    ws.send(WsMessage::Text(
        r#"{"event":"send_message","data":{"content":"over the wire"}}"#.to_string(),
    ))
    .await
    .unwrap();

    for _ in 0..300 {
        if !received.lock().unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(
        received.lock().unwrap().first().cloned(),
        Some(("Alice".to_string(), "over the wire".to_string()))
    );

    // And the other direction.
    client.send("and back").unwrap();
    let msg = loop {
        let event = next_named(&mut ws, "new_message").await;
        if event["data"]["senderName"] == "Bob" {
            break event;
        }
    };
    assert_eq!(msg["data"]["content"], "and back");
}
