//! Per-message processors: the session state machine (HELLO/WELCOME/ABORT,
//! GOODBYE) and the broker/dealer request handlers (SUBSCRIBE, PUBLISH,
//! CALL), plus the catch-all `ERROR` responder for anything else.
//!
//! Grounded on `tornwamp/processors/__init__.py` (one processor per message
//! code, each returning zero or more outbound messages) and wampire's
//! `router/pubsub/mod.rs` / `router/rpc/mod.rs` handler shape, generalized
//! from synchronous per-connection mutation to this router's shared
//! `TopicManager`/`ConnectionRegistry`.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::messages::{build_error_for, Message};
use crate::session::ClientConnection;
use crate::{Dict, WampResult};

use super::rpc::ProcedureTable;
#[cfg(test)]
use super::rpc::Broadcast;
use super::Authorizer;
use crate::identifier::IdAllocator;
use crate::topic::TopicManager;

/// Owns everything a message processor needs to act: the session/topic
/// state plus the pluggable authorization hook. Shared (`Arc`-wrapped)
/// across every connection's processing task.
pub struct Dispatcher {
    pub realm: String,
    pub ids: Arc<IdAllocator>,
    pub topics: Arc<TopicManager>,
    pub procedures: Arc<ProcedureTable>,
    pub authorizer: Arc<dyn Authorizer>,
}

impl Dispatcher {
    /// Handle one inbound message from `connection`. Before the session is
    /// established (`connection.session_id` analog — tracked by the caller
    /// via the HELLO/WELCOME exchange), only `Hello` is a legal message;
    /// `transport.rs` enforces that ordering and calls this only with an
    /// admitted connection thereafter.
    pub async fn dispatch(&self, connection: &Arc<ClientConnection>, message: Message) {
        connection.touch();
        let reply = match message {
            Message::Goodbye { details, reason } => {
                self.handle_goodbye(connection, details, reason).await;
                None
            }
            Message::Subscribe {
                request_id,
                options,
                topic,
            } => Some(self.handle_subscribe(connection, request_id, options, topic).await),
            Message::Unsubscribe {
                request_id,
                subscription_id,
            } => Some(self.handle_unsubscribe(connection, request_id, subscription_id).await),
            Message::Publish {
                request_id,
                options,
                topic,
                args,
                kwargs,
            } => self.handle_publish(connection, request_id, options, topic, args, kwargs).await,
            Message::Call {
                request_id,
                options: _,
                procedure,
                args,
                kwargs,
            } => Some(self.handle_call(connection, request_id, procedure, args, kwargs).await),
            other => Some(self.handle_unsupported(other)),
        };

        if let Some(reply) = reply {
            connection.send(reply);
        }
    }

    /// §4.5: GOODBYE always closes the session — echo it back, then ask the
    /// transport to terminate the connection (code 1000) rather than leaving
    /// the socket open for the peer to close on its own.
    async fn handle_goodbye(&self, connection: &Arc<ClientConnection>, details: Dict, reason: String) {
        let close_reason = details
            .get("message")
            .and_then(serde_json::Value::as_str)
            .map(str::to_string)
            .unwrap_or(reason);
        info!(peer = %connection.peer(), "session closing (GOODBYE): {}", close_reason);
        self.topics.remove_connection(connection.id).await;
        connection.send(Message::goodbye(details, close_reason));
        connection.close();
    }

    async fn handle_subscribe(
        &self,
        connection: &Arc<ClientConnection>,
        request_id: u64,
        _options: Dict,
        topic: String,
    ) -> Message {
        let in_message = Message::subscribe(request_id, Dict::new(), topic.clone());
        if let Err(reason) = self.authorizer.authorize_subscribe(connection, &topic) {
            warn!(peer = %connection.peer(), topic = %topic, "subscribe denied: {}", reason);
            return build_error_for(&in_message, "tornwamp.subscribe.unauthorized", &reason)
                .expect("Subscribe is always error-prone");
        }

        match self.topics.add_subscriber(&topic, connection.id).await {
            Ok(subscription_id) => {
                connection.record_subscription(&topic, subscription_id);
                debug!(peer = %connection.peer(), topic = %topic, subscription_id, "subscribed");
                Message::subscribed(request_id, subscription_id)
            }
            Err(e) => build_error_for(&in_message, "wamp.error.canceled", &e.to_string())
                .expect("Subscribe is always error-prone"),
        }
    }

    async fn handle_unsubscribe(
        &self,
        connection: &Arc<ClientConnection>,
        request_id: u64,
        subscription_id: u64,
    ) -> Message {
        let in_message = Message::unsubscribe(request_id, subscription_id);
        let topic = connection
            .subscriptions()
            .into_iter()
            .find(|(_, id)| *id == subscription_id)
            .map(|(topic, _)| topic);

        match topic {
            Some(topic) => {
                self.topics.remove_subscriber(&topic, subscription_id).await;
                connection.forget_subscription(&topic);
                Message::unsubscribed(request_id)
            }
            None => build_error_for(&in_message, "wamp.error.no_such_subscription", "no such subscription")
                .expect("Unsubscribe is always error-prone"),
        }
    }

    async fn handle_publish(
        &self,
        connection: &Arc<ClientConnection>,
        request_id: u64,
        options: Dict,
        topic: String,
        args: Option<crate::List>,
        kwargs: Option<Dict>,
    ) -> Option<Message> {
        let should_acknowledge = options
            .get("acknowledge")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);
        let exclude_me = options
            .get("exclude_me")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(true);

        let in_message = Message::publish(request_id, options.clone(), topic.clone(), args.clone(), kwargs.clone());
        if let Err(reason) = self.authorizer.authorize_publish(connection, &topic) {
            warn!(peer = %connection.peer(), topic = %topic, "publish denied: {}", reason);
            let error = build_error_for(&in_message, "tornwamp.publish.unauthorized", &reason)
                .expect("Publish is always error-prone");
            return Some(error);
        }

        match self
            .topics
            .publish(&topic, connection.id, Dict::new(), args, kwargs, exclude_me)
            .await
        {
            Ok(publication_id) => {
                connection.record_publication(&topic, publication_id);
                if should_acknowledge {
                    Some(Message::published(request_id, publication_id))
                } else {
                    None
                }
            }
            Err(e) => Some(
                build_error_for(&in_message, "wamp.error.canceled", &e.to_string())
                    .expect("Publish is always error-prone"),
            ),
        }
    }

    async fn handle_call(
        &self,
        connection: &Arc<ClientConnection>,
        request_id: u64,
        procedure: String,
        args: Option<crate::List>,
        kwargs: Option<Dict>,
    ) -> Message {
        let in_message = Message::call(request_id, Dict::new(), procedure.clone(), args.clone(), kwargs.clone());
        match self.procedures.call(&procedure, &in_message, connection, args, kwargs) {
            Ok((args, kwargs, broadcasts)) => {
                for broadcast in broadcasts {
                    if let Err(e) = self
                        .topics
                        .publish(&broadcast.topic, connection.id, Dict::new(), broadcast.args, broadcast.kwargs, true)
                        .await
                    {
                        warn!(procedure = %procedure, topic = %broadcast.topic, "broadcast from RPC handler failed: {}", e);
                    }
                }
                Message::result(request_id, Dict::new(), args, kwargs)
            }
            Err(e) => {
                let mut details = Dict::new();
                details.insert(
                    "message".to_string(),
                    serde_json::Value::String(e.kind().description()),
                );
                details.insert("call".to_string(), in_message.to_value());
                Message::error(
                    in_message.code(),
                    request_id,
                    "wamp.rpc.unsupported.procedure",
                    details,
                    None,
                    None,
                )
            }
        }
    }

    fn handle_unsupported(&self, message: Message) -> Message {
        let code = message.code();
        warn!(code, "no processor for this message code");
        match build_error_for(&message, "wamp.unsupported.message", &format!("Unsupported message code {}", code)) {
            Some(error) => error,
            // HELLO/WELCOME/ABORT/EVENT/PUBLISHED/SUBSCRIBED/UNSUBSCRIBED/
            // RESULT arriving out of band carry no request id to target; a
            // protocol violation is the best we can report.
            None => Message::abort(
                "wamp.error.protocol_violation",
                {
                    let mut details = Dict::new();
                    details.insert(
                        "message".to_string(),
                        serde_json::Value::String(format!("unexpected message code {}", code)),
                    );
                    details
                },
            ),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::identifier::IdAllocator;
    use crate::router::AllowAll;
    use crate::session::{ClientConnection, ConnectionRegistry};
    use crate::topic::TopicManager;
    use serde_json::json;
    use tokio::sync::mpsc::unbounded_channel;

    struct DenyPublish;

    impl Authorizer for DenyPublish {
        fn authorize_hello(&self, _realm: &str, _details: &Dict) -> Result<Dict, String> {
            Ok(Dict::new())
        }

        fn authorize_subscribe(&self, _connection: &ClientConnection, _topic: &str) -> Result<(), String> {
            Ok(())
        }

        fn authorize_publish(&self, _connection: &ClientConnection, _topic: &str) -> Result<(), String> {
            Err("Your problem".to_string())
        }
    }

    fn dispatcher(authorizer: Arc<dyn Authorizer>) -> (Arc<Dispatcher>, Arc<ConnectionRegistry>) {
        dispatcher_with(authorizer, ProcedureTable::new())
    }

    fn dispatcher_with(authorizer: Arc<dyn Authorizer>, procedures: ProcedureTable) -> (Arc<Dispatcher>, Arc<ConnectionRegistry>) {
        let registry = Arc::new(ConnectionRegistry::new());
        let ids = Arc::new(IdAllocator::new());
        let topics = Arc::new(TopicManager::new(registry.clone(), ids.clone(), None, "node-a"));
        let dispatcher = Arc::new(Dispatcher {
            realm: "default".to_string(),
            ids,
            topics,
            procedures: Arc::new(procedures),
            authorizer,
        });
        (dispatcher, registry)
    }

    fn connection(registry: &ConnectionRegistry, id: crate::ID) -> (Arc<ClientConnection>, tokio::sync::mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = unbounded_channel();
        let conn = Arc::new(ClientConnection::new(id, None, tx));
        registry.insert(conn.clone());
        (conn, rx)
    }

    #[tokio::test]
    async fn publish_without_acknowledge_reaches_other_subscribers_only() {
        let (dispatcher, registry) = dispatcher(Arc::new(AllowAll));
        let (publisher, mut publisher_rx) = connection(&registry, 1);
        let (subscriber, mut subscriber_rx) = connection(&registry, 2);

        dispatcher
            .dispatch(
                &publisher,
                Message::subscribe(1, Dict::new(), "world.cup"),
            )
            .await;
        // drain the SUBSCRIBED reply sent to connection 1 for this test's own bookkeeping
        publisher_rx.recv().await.unwrap();

        dispatcher
            .dispatch(&subscriber, Message::subscribe(2, Dict::new(), "world.cup"))
            .await;
        subscriber_rx.recv().await.unwrap();

        dispatcher
            .dispatch(&publisher, Message::publish(345, Dict::new(), "world.cup", None, None))
            .await;

        assert!(publisher_rx.try_recv().is_err(), "no reply without acknowledge");
        let event = subscriber_rx.recv().await.unwrap();
        assert!(matches!(event, Message::Event { .. }));
    }

    #[tokio::test]
    async fn publish_with_acknowledge_denied_matches_the_exact_wire_form() {
        let (dispatcher, registry) = dispatcher(Arc::new(DenyPublish));
        let (publisher, mut rx) = connection(&registry, 1);

        let mut options = Dict::new();
        options.insert("acknowledge".to_string(), json!(true));
        dispatcher
            .dispatch(&publisher, Message::publish(456, options, "world.cup", None, None))
            .await;

        let reply = rx.recv().await.unwrap();
        assert_eq!(
            reply.json(),
            r#"[8,16,456,{"message":"Your problem"},"tornwamp.publish.unauthorized"]"#
        );
    }

    #[tokio::test]
    async fn call_unknown_procedure_matches_the_exact_wire_form() {
        let (dispatcher, registry) = dispatcher(Arc::new(AllowAll));
        let (caller, mut rx) = connection(&registry, 1);

        dispatcher
            .dispatch(&caller, Message::call(9, Dict::new(), "abc", None, None))
            .await;

        let reply = rx.recv().await.unwrap();
        match reply {
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
            other => panic!("expected an ERROR, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn call_handler_broadcasts_reach_topic_subscribers() {
        let mut procedures = ProcedureTable::new();
        procedures.register("ca.dal.wamp.broker.announce", |_call_message, _connection, args, _kwargs| {
            Ok((
                Some(vec![json!("ack")]),
                None,
                vec![Broadcast::new("ca.dal.announcements", args, None)],
            ))
        });
        let (dispatcher, registry) = dispatcher_with(Arc::new(AllowAll), procedures);
        let (subscriber, mut subscriber_rx) = connection(&registry, 1);
        let (caller, mut caller_rx) = connection(&registry, 2);

        dispatcher
            .dispatch(&subscriber, Message::subscribe(1, Dict::new(), "ca.dal.announcements"))
            .await;
        subscriber_rx.recv().await.unwrap();

        dispatcher
            .dispatch(
                &caller,
                Message::call(10, Dict::new(), "ca.dal.wamp.broker.announce", Some(vec![json!("hello")]), None),
            )
            .await;

        match caller_rx.recv().await.unwrap() {
            Message::Result { args, .. } => assert_eq!(args, Some(vec![json!("ack")])),
            other => panic!("expected a RESULT, got {:?}", other),
        }
        match subscriber_rx.recv().await.unwrap() {
            Message::Event { args, .. } => assert_eq!(args, Some(vec![json!("hello")])),
            other => panic!("expected an EVENT, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn goodbye_echoes_the_incoming_details_message() {
        let (dispatcher, registry) = dispatcher(Arc::new(AllowAll));
        let (conn, mut rx) = connection(&registry, 1);

        let mut details = Dict::new();
        details.insert("message".to_string(), json!("see you"));
        dispatcher
            .dispatch(&conn, Message::goodbye(details, "wamp.close.normal"))
            .await;

        match rx.recv().await.unwrap() {
            Message::Goodbye { reason, .. } => assert_eq!(reason, "see you"),
            other => panic!("expected a GOODBYE, got {:?}", other),
        }
        assert!(conn.is_zombie(), "GOODBYE must close the session, not just echo it");
    }
}
