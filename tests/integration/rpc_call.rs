//! End-to-end CALL against the static procedure table.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
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
    tokio::time::sleep(Duration::from_millis(50)).await;
    router
}

async fn session(listen_addr: &str) -> Socket {
    let mut request = format!("ws://{}", listen_addr).into_client_request().unwrap();
    request
        .headers_mut()
        .insert("Sec-WebSocket-Protocol", "wamp.2.json".parse().unwrap());
    let (mut stream, _response) = connect_async(request).await.unwrap();
    stream
        .send(WsMessage::Text(Message::hello("default", Dict::new()).json()))
        .await
        .unwrap();
    recv(&mut stream).await; // WELCOME
    stream
}

async fn recv(stream: &mut Socket) -> Message {
    match stream.next().await.unwrap().unwrap() {
        WsMessage::Text(text) => Message::from_text(&text).unwrap(),
        other => panic!("expected a text frame, got {:?}", other),
    }
}

async fn send(stream: &mut Socket, message: Message) {
    stream.send(WsMessage::Text(message.json())).await.unwrap();
}

#[tokio::test]
async fn ping_returns_its_fixed_response() {
    let addr = "127.0.0.1:18991";
    let _router = spawn_router(addr).await;
    let mut client = session(addr).await;

    send(&mut client, Message::call(1, Dict::new(), "ping", None, None)).await;

    match recv(&mut client).await {
        Message::Result { request_id, args, .. } => {
            assert_eq!(request_id, 1);
            assert_eq!(args, Some(vec![json!("Ping response")]));
        }
        other => panic!("expected RESULT, got {:?}", other),
    }
}

#[tokio::test]
async fn calling_an_unregistered_procedure_errors_with_the_exact_wire_form() {
    let addr = "127.0.0.1:18992";
    let _router = spawn_router(addr).await;
    let mut client = session(addr).await;

    send(&mut client, Message::call(9, Dict::new(), "abc", None, None)).await;

    match recv(&mut client).await {
        Message::Error {
            request_code,
            request_id,
            uri,
            details,
            ..
        } => {
            assert_eq!(request_code, 48);
            assert_eq!(request_id, 9);
            assert_eq!(uri, "wamp.rpc.unsupported.procedure");
            assert_eq!(
                details.get("message").and_then(|v| v.as_str()),
                Some("The procedure abc doesn't exist")
            );
            assert!(details.get("call").is_some());
        }
        other => panic!("expected ERROR, got {:?}", other),
    }
}
