//! The pub/sub broker: local topic fanout plus optional cross-node
//! propagation over a `PubSubBackend`.
//!
//! Grounded on wampire's `router/pubsub/mod.rs` `handle_publish` (build one
//! `Event` template per publication, rewrite its subscription id per
//! recipient before sending) and on `tornwamp/topic/__init__.py`'s
//! subscription_id-keyed `Topic.subscribers` map.

pub mod redis_backend;

pub use redis_backend::{PubSubBackend, RedisBus};

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::identifier::IdAllocator;
use crate::messages::{BroadcastMessage, Message};
use crate::session::ConnectionRegistry;
use crate::{Dict, List, WampResult, ID};

/// One topic's set of local subscribers, keyed by the subscription id handed
/// out to each subscriber.
pub struct Topic {
    name: String,
    subscribers: RwLock<HashMap<ID, ID>>,
}

impl Topic {
    fn new(name: String) -> Topic {
        Topic {
            name,
            subscribers: RwLock::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn add_subscriber(&self, subscription_id: ID, connection_id: ID) {
        self.subscribers.write().unwrap().insert(subscription_id, connection_id);
    }

    fn remove_subscriber(&self, subscription_id: ID) -> Option<ID> {
        self.subscribers.write().unwrap().remove(&subscription_id)
    }

    fn remove_connection(&self, connection_id: ID) -> Vec<ID> {
        let mut subs = self.subscribers.write().unwrap();
        let dead: Vec<ID> = subs
            .iter()
            .filter(|(_, c)| **c == connection_id)
            .map(|(s, _)| *s)
            .collect();
        for subscription_id in &dead {
            subs.remove(subscription_id);
        }
        dead
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().unwrap().len()
    }

    fn subscriber_pairs(&self) -> Vec<(ID, ID)> {
        self.subscribers
            .read()
            .unwrap()
            .iter()
            .map(|(sub, conn)| (*sub, *conn))
            .collect()
    }
}

/// Owns every known topic and the optional cross-node bus. One instance per
/// router node.
pub struct TopicManager {
    topics: RwLock<HashMap<String, Arc<Topic>>>,
    registry: Arc<ConnectionRegistry>,
    ids: Arc<IdAllocator>,
    backend: Option<Arc<dyn PubSubBackend>>,
    node_id: String,
}

impl TopicManager {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        ids: Arc<IdAllocator>,
        backend: Option<Arc<dyn PubSubBackend>>,
        node_id: impl Into<String>,
    ) -> TopicManager {
        TopicManager {
            topics: RwLock::new(HashMap::new()),
            registry,
            ids,
            backend,
            node_id: node_id.into(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Creating a topic is idempotent: the first caller for a name wins, and
    /// every caller gets the same `Arc<Topic>` back.
    pub fn create_topic(&self, name: &str) -> Arc<Topic> {
        let mut topics = self.topics.write().unwrap();
        topics
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Topic::new(name.to_string())))
            .clone()
    }

    pub fn topic(&self, name: &str) -> Option<Arc<Topic>> {
        self.topics.read().unwrap().get(name).cloned()
    }

    pub fn get_connection(&self, id: ID) -> Option<Arc<crate::session::ClientConnection>> {
        self.registry.get(id)
    }

    /// Register `connection_id` as a subscriber of `topic_name`, starting a
    /// Redis subscriber loop for the topic if this is its first local
    /// subscriber and a backend is configured. If that subscriber loop can't
    /// be established, the local subscription is never recorded and the
    /// operation fails with `BackendUnavailable` (§4.4.1) — a topic must
    /// never hold a subscriber with no live subscriber connection behind it.
    pub async fn add_subscriber(&self, topic_name: &str, connection_id: ID) -> WampResult<ID> {
        let topic = self.create_topic(topic_name);
        let subscription_id = self.ids.allocate();
        let was_empty = topic.subscriber_count() == 0;

        if was_empty {
            if let Some(backend) = self.backend.clone() {
                let registry = self.registry.clone();
                let topic_for_message = topic.clone();
                let on_message: Arc<dyn Fn(BroadcastMessage) + Send + Sync> =
                    Arc::new(move |broadcast| deliver_remote(&registry, &topic_for_message, broadcast));

                let registry = self.registry.clone();
                let ids = self.ids.clone();
                let topic_for_eviction = topic.clone();
                let on_disconnect: Arc<dyn Fn() + Send + Sync> =
                    Arc::new(move || evict_topic(&registry, &ids, &topic_for_eviction));

                if let Err(e) = backend
                    .ensure_subscribed(topic_name.to_string(), on_message, on_disconnect)
                    .await
                {
                    self.ids.release(subscription_id);
                    return Err(e);
                }
            }
        }

        topic.add_subscriber(subscription_id, connection_id);
        Ok(subscription_id)
    }

    /// Unregister a subscription. Tears down the topic's Redis subscriber
    /// loop if this was the last local subscriber.
    pub async fn remove_subscriber(&self, topic_name: &str, subscription_id: ID) {
        let topic = match self.topic(topic_name) {
            Some(topic) => topic,
            None => return,
        };
        self.ids.release(subscription_id);
        topic.remove_subscriber(subscription_id);
        if topic.subscriber_count() == 0 {
            if let Some(backend) = &self.backend {
                backend.ensure_unsubscribed(topic_name).await;
            }
        }
    }

    /// Drop every subscription a closing connection held, across all
    /// topics. Called from the GOODBYE / transport-close path.
    pub async fn remove_connection(&self, connection_id: ID) {
        let topics: Vec<Arc<Topic>> = self.topics.read().unwrap().values().cloned().collect();
        for topic in topics {
            let removed = topic.remove_connection(connection_id);
            for subscription_id in removed {
                self.ids.release(subscription_id);
            }
            if topic.subscriber_count() == 0 {
                if let Some(backend) = &self.backend {
                    backend.ensure_unsubscribed(topic.name()).await;
                }
            }
        }
    }

    /// Publish an event to a topic: deliver to every local subscriber
    /// (excluding the publisher's own connection when `exclude_me` is set,
    /// the WAMP default) and, if a backend is configured, hand the event to
    /// other nodes for their own local fanout.
    pub async fn publish(
        &self,
        topic_name: &str,
        publisher_connection_id: ID,
        details: Dict,
        args: Option<List>,
        kwargs: Option<Dict>,
        exclude_me: bool,
    ) -> WampResult<ID> {
        let publication_id = self.ids.allocate();
        let topic = self.create_topic(topic_name);
        let exclude = exclude_me.then_some(publisher_connection_id);

        self.fanout_local(&topic, publication_id, &details, &args, &kwargs, exclude);

        if let Some(backend) = &self.backend {
            // subscription_id 0 is a placeholder: each receiving node
            // rewrites it to the local subscriber's own id before delivery.
            let template = Message::event(0, publication_id, details, args, kwargs);
            let broadcast = BroadcastMessage::new(topic_name, template, exclude, self.node_id.clone());
            backend.publish(topic_name, &broadcast).await?;
        }

        Ok(publication_id)
    }

    fn fanout_local(
        &self,
        topic: &Topic,
        publication_id: ID,
        details: &Dict,
        args: &Option<List>,
        kwargs: &Option<Dict>,
        exclude_connection_id: Option<ID>,
    ) {
        for (subscription_id, connection_id) in topic.subscriber_pairs() {
            if Some(connection_id) == exclude_connection_id {
                continue;
            }
            if let Some(conn) = self.registry.get(connection_id) {
                conn.send(Message::event(
                    subscription_id,
                    publication_id,
                    details.clone(),
                    args.clone(),
                    kwargs.clone(),
                ));
            }
        }
    }
}

/// Deliver a broadcast received from another node to this node's local
/// subscribers of `topic`. Publisher-connection exclusion does not apply
/// here: the publishing session lives on the remote node, never on this
/// one, so every local subscriber is a legitimate recipient.
fn deliver_remote(registry: &Arc<ConnectionRegistry>, topic: &Arc<Topic>, broadcast: BroadcastMessage) {
    let (publication_id, details, args, kwargs) = match broadcast.event_message {
        Message::Event {
            publication_id,
            details,
            args,
            kwargs,
            ..
        } => (publication_id, details, args, kwargs),
        _ => return,
    };
    for (subscription_id, connection_id) in topic.subscriber_pairs() {
        if let Some(conn) = registry.get(connection_id) {
            conn.send(Message::event(
                subscription_id,
                publication_id,
                details.clone(),
                args.clone(),
                kwargs.clone(),
            ));
        }
    }
}

/// Eviction path (§4.4.4, §7): the topic's Redis subscriber connection is
/// gone, so every local subscriber's WebSocket is closed rather than risking
/// silently missed messages. The topic itself survives and can be
/// resubscribed later.
fn evict_topic(registry: &Arc<ConnectionRegistry>, ids: &Arc<IdAllocator>, topic: &Arc<Topic>) {
    for (subscription_id, connection_id) in topic.subscriber_pairs() {
        topic.remove_subscriber(subscription_id);
        ids.release(subscription_id);
        if let Some(conn) = registry.get(connection_id) {
            conn.close();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::session::ClientConnection;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    fn connection(registry: &ConnectionRegistry, id: ID) -> UnboundedReceiver<Message> {
        let (tx, rx) = unbounded_channel();
        registry.insert(Arc::new(ClientConnection::new(id, None, tx)));
        rx
    }

    fn manager_without_backend() -> (Arc<ConnectionRegistry>, TopicManager) {
        let registry = Arc::new(ConnectionRegistry::new());
        let ids = Arc::new(IdAllocator::new());
        let manager = TopicManager::new(registry.clone(), ids, None, "node-a");
        (registry, manager)
    }

    #[tokio::test]
    async fn publish_excludes_the_publisher_by_default() {
        let (registry, manager) = manager_without_backend();
        let mut rx1 = connection(&registry, 1);
        let mut rx2 = connection(&registry, 2);

        manager.add_subscriber("a.topic", 1).await.unwrap();
        manager.add_subscriber("a.topic", 2).await.unwrap();

        manager
            .publish("a.topic", 1, Dict::new(), None, None, true)
            .await
            .unwrap();

        assert!(rx1.try_recv().is_err(), "publisher should not receive its own event");
        assert!(rx2.try_recv().is_ok(), "other subscriber should receive the event");
    }

    #[tokio::test]
    async fn publish_includes_publisher_when_exclude_me_is_false() {
        let (registry, manager) = manager_without_backend();
        let mut rx1 = connection(&registry, 1);

        manager.add_subscriber("a.topic", 1).await.unwrap();
        manager
            .publish("a.topic", 1, Dict::new(), None, None, false)
            .await
            .unwrap();

        assert!(rx1.try_recv().is_ok());
    }

    #[tokio::test]
    async fn remove_connection_drops_all_of_its_subscriptions() {
        let (registry, manager) = manager_without_backend();
        connection(&registry, 1);
        manager.add_subscriber("a.topic", 1).await.unwrap();
        manager.add_subscriber("b.topic", 1).await.unwrap();

        manager.remove_connection(1).await;

        assert_eq!(manager.topic("a.topic").unwrap().subscriber_count(), 0);
        assert_eq!(manager.topic("b.topic").unwrap().subscriber_count(), 0);
    }

    struct FailingBackend;

    #[async_trait]
    impl PubSubBackend for FailingBackend {
        async fn publish(&self, _topic: &str, _broadcast: &BroadcastMessage) -> WampResult<()> {
            Ok(())
        }

        async fn ensure_subscribed(
            self: Arc<Self>,
            _topic: String,
            _on_message: Arc<dyn Fn(BroadcastMessage) + Send + Sync>,
            _on_disconnect: Arc<dyn Fn() + Send + Sync>,
        ) -> WampResult<()> {
            Err(crate::Error::new(crate::ErrorKind::InvalidState("redis unavailable")))
        }

        async fn ensure_unsubscribed(&self, _topic: &str) {}
    }

    #[tokio::test]
    async fn add_subscriber_does_not_record_a_subscription_when_the_backend_fails() {
        let registry = Arc::new(ConnectionRegistry::new());
        let ids = Arc::new(IdAllocator::new());
        let backend = Arc::new(FailingBackend);
        let manager = TopicManager::new(registry.clone(), ids, Some(backend as Arc<dyn PubSubBackend>), "node-a");
        connection(&registry, 1);

        let result = manager.add_subscriber("a.topic", 1).await;

        assert!(result.is_err());
        assert_eq!(manager.topic("a.topic").unwrap().subscriber_count(), 0);
    }

    struct FakeBackend {
        published: StdMutex<Vec<(String, BroadcastMessage)>>,
    }

    impl FakeBackend {
        fn new() -> FakeBackend {
            FakeBackend {
                published: StdMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl PubSubBackend for FakeBackend {
        async fn publish(&self, topic: &str, broadcast: &BroadcastMessage) -> WampResult<()> {
            self.published
                .lock()
                .unwrap()
                .push((topic.to_string(), broadcast.clone()));
            Ok(())
        }

        async fn ensure_subscribed(
            self: Arc<Self>,
            _topic: String,
            _on_message: Arc<dyn Fn(BroadcastMessage) + Send + Sync>,
            _on_disconnect: Arc<dyn Fn() + Send + Sync>,
        ) -> WampResult<()> {
            Ok(())
        }

        async fn ensure_unsubscribed(&self, _topic: &str) {}
    }

    /// A backend that hands the caller its `on_disconnect` hook instead of
    /// ever calling it itself, so a test can simulate a subscriber
    /// connection drop on demand (§4.4.4, §8 scenario 6).
    struct DisconnectingBackend {
        on_disconnect: StdMutex<Option<Arc<dyn Fn() + Send + Sync>>>,
    }

    impl DisconnectingBackend {
        fn new() -> DisconnectingBackend {
            DisconnectingBackend {
                on_disconnect: StdMutex::new(None),
            }
        }

        fn simulate_drop(&self) {
            if let Some(hook) = self.on_disconnect.lock().unwrap().take() {
                hook();
            }
        }
    }

    #[async_trait]
    impl PubSubBackend for DisconnectingBackend {
        async fn publish(&self, _topic: &str, _broadcast: &BroadcastMessage) -> WampResult<()> {
            Ok(())
        }

        async fn ensure_subscribed(
            self: Arc<Self>,
            _topic: String,
            _on_message: Arc<dyn Fn(BroadcastMessage) + Send + Sync>,
            on_disconnect: Arc<dyn Fn() + Send + Sync>,
        ) -> WampResult<()> {
            *self.on_disconnect.lock().unwrap() = Some(on_disconnect);
            Ok(())
        }

        async fn ensure_unsubscribed(&self, _topic: &str) {}
    }

    #[tokio::test]
    async fn subscriber_connection_drop_evicts_local_subscribers() {
        let registry = Arc::new(ConnectionRegistry::new());
        let ids = Arc::new(IdAllocator::new());
        let backend = Arc::new(DisconnectingBackend::new());
        let manager = TopicManager::new(registry.clone(), ids, Some(backend.clone() as Arc<dyn PubSubBackend>), "node-a");
        let _rx = connection(&registry, 1);

        manager.add_subscriber("olympic.games", 1).await.unwrap();
        assert_eq!(manager.topic("olympic.games").unwrap().subscriber_count(), 1);

        backend.simulate_drop();

        assert_eq!(manager.topic("olympic.games").unwrap().subscriber_count(), 0);
        assert!(registry.get(1).unwrap().is_zombie());
    }

    #[tokio::test]
    async fn publish_forwards_to_the_backend_with_placeholder_subscription_id() {
        let registry = Arc::new(ConnectionRegistry::new());
        let ids = Arc::new(IdAllocator::new());
        let backend = Arc::new(FakeBackend::new());
        let manager = TopicManager::new(registry, ids, Some(backend.clone() as Arc<dyn PubSubBackend>), "node-a");

        manager
            .publish("a.topic", 1, Dict::new(), None, None, true)
            .await
            .unwrap();

        let published = backend.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "a.topic");
        assert_eq!(published[0].1.publisher_node_id, "node-a");
        match &published[0].1.event_message {
            Message::Event { subscription_id, .. } => assert_eq!(*subscription_id, 0),
            _ => panic!("expected an Event"),
        }
    }
}
