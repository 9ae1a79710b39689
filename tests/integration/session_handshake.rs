//! End-to-end HELLO/WELCOME/GOODBYE over a real WebSocket connection.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use wamp_broker::config::RouterConfig;
use wamp_broker::router::{AllowAll, Router};
use wamp_broker::{Dict, Message};

type Socket = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn spawn_router(listen_addr: &str) -> Arc<Router> {
    let config = RouterConfig {
        listen_addr: listen_addr.to_string(),
        ..RouterConfig::default()
    };
    let router = Arc::new(Router::new(config, Arc::new(AllowAll)).unwrap());
    let listener = router.clone();
    tokio::spawn(async move { listener.listen().await });
    // give the accept loop a moment to bind before the first dial
    tokio::time::sleep(Duration::from_millis(50)).await;
    router
}

async fn connect(listen_addr: &str) -> Socket {
    let mut request = format!("ws://{}", listen_addr).into_client_request().unwrap();
    request
        .headers_mut()
        .insert("Sec-WebSocket-Protocol", "wamp.2.json".parse().unwrap());
    let (stream, _response) = connect_async(request).await.unwrap();
    stream
}

async fn recv(stream: &mut Socket) -> Message {
    match stream.next().await.unwrap().unwrap() {
        WsMessage::Text(text) => Message::from_text(&text).unwrap(),
        other => panic!("expected a text frame, got {:?}", other),
    }
}

#[tokio::test]
async fn hello_is_welcomed_with_a_session_id_in_range() {
    let addr = "127.0.0.1:18971";
    let _router = spawn_router(addr).await;
    let mut client = connect(addr).await;

    client
        .send(WsMessage::Text(Message::hello("default", Dict::new()).json()))
        .await
        .unwrap();

    match recv(&mut client).await {
        Message::Welcome { session_id, .. } => {
            assert!(session_id <= 1u64 << 53);
        }
        other => panic!("expected WELCOME, got {:?}", other),
    }
}

#[tokio::test]
async fn goodbye_reason_echoes_the_sent_details_message() {
    let addr = "127.0.0.1:18972";
    let _router = spawn_router(addr).await;
    let mut client = connect(addr).await;

    client
        .send(WsMessage::Text(Message::hello("default", Dict::new()).json()))
        .await
        .unwrap();
    recv(&mut client).await;

    let mut details = Dict::new();
    details.insert("message".to_string(), serde_json::json!("leaving now"));
    client
        .send(WsMessage::Text(Message::goodbye(details, "wamp.close.normal").json()))
        .await
        .unwrap();

    match recv(&mut client).await {
        Message::Goodbye { reason, .. } => assert_eq!(reason, "leaving now"),
        other => panic!("expected GOODBYE, got {:?}", other),
    }
}
