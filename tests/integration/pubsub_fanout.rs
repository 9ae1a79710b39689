//! End-to-end SUBSCRIBE/PUBLISH fanout: the publisher is excluded by default,
//! the other subscriber receives the EVENT.

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
async fn publisher_is_excluded_the_other_subscriber_gets_the_event() {
    let addr = "127.0.0.1:18981";
    let _router = spawn_router(addr).await;

    let mut publisher = session(addr).await;
    let mut subscriber = session(addr).await;

    send(&mut subscriber, Message::subscribe(1, Dict::new(), "ca.dal.scores")).await;
    let subscription_id = match recv(&mut subscriber).await {
        Message::Subscribed { subscription_id, .. } => subscription_id,
        other => panic!("expected SUBSCRIBED, got {:?}", other),
    };

    let mut options = Dict::new();
    options.insert("acknowledge".to_string(), serde_json::json!(true));
    send(
        &mut publisher,
        Message::publish(2, options, "ca.dal.scores", Some(vec![serde_json::json!(7)]), None),
    )
    .await;

    match recv(&mut publisher).await {
        Message::Published { request_id, .. } => assert_eq!(request_id, 2),
        other => panic!("expected PUBLISHED, got {:?}", other),
    }

    match recv(&mut subscriber).await {
        Message::Event {
            subscription_id: got_subscription_id,
            args,
            ..
        } => {
            assert_eq!(got_subscription_id, subscription_id);
            assert_eq!(args, Some(vec![serde_json::json!(7)]));
        }
        other => panic!("expected EVENT, got {:?}", other),
    }

    // the publisher itself never sees an EVENT for its own publication
    let no_further_frame = tokio::time::timeout(Duration::from_millis(200), recv(&mut publisher)).await;
    assert!(no_further_frame.is_err(), "publisher should not have received its own EVENT");
}
