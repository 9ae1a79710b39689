//! WebSocket transport: accepts a connection, runs the HELLO/WELCOME/ABORT
//! handshake, then hands every subsequent frame to the `Dispatcher`.
//!
//! Generalizes wampire's `parity-ws`-driven, single-threaded
//! `ConnectionHandler` to one reader task and one writer task per
//! connection, communicating over an unbounded channel — the natural
//! idiom for a `tokio`-based router (§5 explicitly allows this).

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::unbounded_channel;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use crate::messages::Message;
use crate::session::ClientConnection;
use crate::{Error, ErrorKind, WampResult, ID};

use super::Router;

const WAMP_JSON_SUBPROTOCOL: &str = "wamp.2.json";

pub async fn handle_connection(router: Arc<Router>, stream: TcpStream, peer_addr: SocketAddr) -> WampResult<()> {
    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, subprotocol_check).await?;
    let (mut write, mut read) = ws_stream.split();

    let hello = match read.next().await {
        Some(Ok(WsMessage::Text(text))) => Message::from_text(&text)?,
        Some(Ok(WsMessage::Close(_))) | None => return Ok(()),
        Some(Ok(_)) => return Err(Error::new(ErrorKind::Protocol("expected a text frame".to_string()))),
        Some(Err(e)) => return Err(e.into()),
    };

    let (realm, details) = match hello {
        Message::Hello { realm, details } => (realm, details),
        other => {
            let abort = Message::abort(
                "wamp.error.protocol_violation",
                {
                    let mut d = crate::Dict::new();
                    d.insert(
                        "message".to_string(),
                        serde_json::Value::String("session must open with HELLO".to_string()),
                    );
                    d
                },
            );
            let _ = write.send(WsMessage::Text(abort.json())).await;
            debug!(code = other.code(), "rejected non-HELLO opening frame");
            return Ok(());
        }
    };

    let welcome_details = match router.dispatcher().authorizer.authorize_hello(&realm, &details) {
        Ok(details) => details,
        Err(reason) => {
            warn!(peer = %peer_addr, realm = %realm, "HELLO rejected: {}", reason);
            let abort = Message::abort_unauthorized(reason);
            let _ = write.send(WsMessage::Text(abort.json())).await;
            return Ok(());
        }
    };

    let session_id = router.allocate_session_id();
    let (outbox, mut inbox) = unbounded_channel::<Message>();
    let connection = Arc::new(ClientConnection::new(session_id, Some(peer_addr), outbox));
    router.registry().insert(connection.clone());

    info!(peer = %connection.peer(), realm = %realm, session_id, "session established");
    connection.send(Message::welcome(session_id, welcome_details));

    let writer = tokio::spawn(async move {
        while let Some(message) = inbox.recv().await {
            if write.send(WsMessage::Text(message.json())).await.is_err() {
                break;
            }
        }
        let _ = write
            .send(WsMessage::Close(Some(CloseFrame {
                code: tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode::Normal,
                reason: "goodbye".into(),
            })))
            .await;
    });

    let dispatcher = router.dispatcher().clone();
    loop {
        tokio::select! {
            frame = read.next() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => match Message::from_text(&text) {
                        Ok(message) => dispatcher.dispatch(&connection, message).await,
                        Err(e) => warn!(peer = %connection.peer(), "dropping malformed frame: {}", e),
                    },
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(WsMessage::Ping(_))) | Some(Ok(WsMessage::Pong(_))) => {}
                    Some(Ok(_)) => warn!(peer = %connection.peer(), "ignoring non-text frame"),
                    Some(Err(e)) => {
                        warn!(peer = %connection.peer(), "transport error: {}", e);
                        break;
                    }
                }
            }
            _ = connection.wait_closed() => {
                // Evicted by the broker (e.g. a dropped Redis subscriber
                // connection, §4.4.4) rather than by the peer.
                info!(peer = %connection.peer(), "connection closed by broker eviction");
                break;
            }
        }
    }

    cleanup(&router, &connection, session_id).await;
    writer.abort();
    Ok(())
}

async fn cleanup(router: &Arc<Router>, connection: &Arc<ClientConnection>, session_id: ID) {
    connection.zombify();
    router.dispatcher().topics.remove_connection(session_id).await;
    router.registry().remove(session_id);
    info!(peer = %connection.peer(), "session closed");
}

fn subprotocol_check(
    request: &tokio_tungstenite::tungstenite::handshake::server::Request,
    mut response: tokio_tungstenite::tungstenite::handshake::server::Response,
) -> Result<
    tokio_tungstenite::tungstenite::handshake::server::Response,
    tokio_tungstenite::tungstenite::handshake::server::ErrorResponse,
> {
    let wants_wamp = request
        .headers()
        .get("Sec-WebSocket-Protocol")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').any(|p| p.trim() == WAMP_JSON_SUBPROTOCOL))
        .unwrap_or(false);
    if wants_wamp {
        response
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", WAMP_JSON_SUBPROTOCOL.parse().unwrap());
    }
    Ok(response)
}
