//! Client session state: one `ClientConnection` per WAMP session, held in a
//! process-wide `ConnectionRegistry`.
//!
//! Grounded on `tornwamp/session.py`: a session tracks, per topic it is
//! involved with, the subscription/publication id the broker handed out for
//! it, plus a free-form metadata dict filled in by the authorization hook.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::watch;

use crate::messages::Message;
use crate::utils::peer_string;
use crate::{Dict, ID};

/// Outbound half of a connection: delivers an encoded message to the peer's
/// writer task. Severed when the connection closes.
pub type Outbox = UnboundedSender<Message>;

struct ConnectionState {
    metadata: Dict,
    /// topic name -> subscription id, for topics this connection subscribes to.
    subscriber_of: HashMap<String, ID>,
    /// topic name -> publication id, for topics this connection has
    /// registered as a publisher on (mirrors `subscriber_of` so GOODBYE
    /// cleanup can remove both sides symmetrically).
    publisher_of: HashMap<String, ID>,
    last_update: Instant,
    zombie_since: Option<Instant>,
}

/// A single WAMP session bound to one transport connection.
pub struct ClientConnection {
    pub id: ID,
    address: Option<SocketAddr>,
    outbox: Outbox,
    state: RwLock<ConnectionState>,
    /// Set by `close()` to ask the transport's read loop to stop and send a
    /// close frame, independent of the inbound frame stream. Used by the
    /// broker's subscriber-eviction path (§4.4.4) to drop a connection it
    /// decided is no longer viable. A `watch` (rather than `Notify`) so a
    /// `close()` that races ahead of the transport's next poll is never
    /// missed.
    closed: watch::Sender<bool>,
}

impl ClientConnection {
    pub fn new(id: ID, address: Option<SocketAddr>, outbox: Outbox) -> ClientConnection {
        let (closed, _) = watch::channel(false);
        ClientConnection {
            id,
            address,
            outbox,
            state: RwLock::new(ConnectionState {
                metadata: Dict::new(),
                subscriber_of: HashMap::new(),
                publisher_of: HashMap::new(),
                last_update: Instant::now(),
                zombie_since: None,
            }),
            closed,
        }
    }

    /// Ask the transport to close this connection: zombify it immediately
    /// (so no further broker fanout targets it) and flag it closed for
    /// anything waiting on `wait_closed`.
    pub fn close(&self) {
        self.zombify();
        let _ = self.closed.send(true);
    }

    /// Resolves once `close()` has been called on this connection (or
    /// immediately if it already has been). The transport read loop selects
    /// on this alongside inbound frames.
    pub async fn wait_closed(&self) {
        let mut rx = self.closed.subscribe();
        if *rx.borrow() {
            return;
        }
        let _ = rx.changed().await;
    }

    /// `ip:port|session_id`, or a placeholder if the transport never
    /// exposed a peer address (e.g. a test double).
    pub fn peer(&self) -> String {
        peer_string(self.address, self.id)
    }

    pub fn address(&self) -> Option<SocketAddr> {
        self.address
    }

    /// Send a message to this connection's writer task. A closed outbox
    /// (the connection already dropped) is not an error here — the caller
    /// learns about the dead connection from the registry, not from every
    /// send.
    pub fn send(&self, message: Message) {
        let _ = self.outbox.send(message);
    }

    pub fn touch(&self) {
        self.state.write().unwrap().last_update = Instant::now();
    }

    pub fn last_update(&self) -> Instant {
        self.state.read().unwrap().last_update
    }

    /// Mark this connection as a zombie: its transport is gone but the
    /// registry entry (and its subscriptions) are kept briefly so in-flight
    /// broker fanout doesn't race a `None` lookup. See SPEC_FULL.md's
    /// "zombie connections" note.
    pub fn zombify(&self) {
        let mut state = self.state.write().unwrap();
        if state.zombie_since.is_none() {
            state.zombie_since = Some(Instant::now());
        }
    }

    pub fn is_zombie(&self) -> bool {
        self.state.read().unwrap().zombie_since.is_some()
    }

    pub fn zombie_since(&self) -> Option<Instant> {
        self.state.read().unwrap().zombie_since
    }

    pub fn metadata(&self) -> Dict {
        self.state.read().unwrap().metadata.clone()
    }

    pub fn set_metadata(&self, metadata: Dict) {
        self.state.write().unwrap().metadata = metadata;
    }

    pub fn record_subscription(&self, topic: impl Into<String>, subscription_id: ID) {
        self.state
            .write()
            .unwrap()
            .subscriber_of
            .insert(topic.into(), subscription_id);
    }

    pub fn subscription_for(&self, topic: &str) -> Option<ID> {
        self.state.read().unwrap().subscriber_of.get(topic).copied()
    }

    pub fn forget_subscription(&self, topic: &str) -> Option<ID> {
        self.state.write().unwrap().subscriber_of.remove(topic)
    }

    /// All topics this connection currently subscribes to, paired with
    /// their subscription id.
    pub fn subscriptions(&self) -> Vec<(String, ID)> {
        self.state
            .read()
            .unwrap()
            .subscriber_of
            .iter()
            .map(|(topic, id)| (topic.clone(), *id))
            .collect()
    }

    pub fn record_publication(&self, topic: impl Into<String>, publication_id: ID) {
        self.state
            .write()
            .unwrap()
            .publisher_of
            .insert(topic.into(), publication_id);
    }

    pub fn forget_publication(&self, topic: &str) -> Option<ID> {
        self.state.write().unwrap().publisher_of.remove(topic)
    }

    pub fn publications(&self) -> Vec<(String, ID)> {
        self.state
            .read()
            .unwrap()
            .publisher_of
            .iter()
            .map(|(topic, id)| (topic.clone(), *id))
            .collect()
    }
}

/// Process-wide table of live sessions, keyed by session id.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ID, Arc<ClientConnection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> ConnectionRegistry {
        ConnectionRegistry {
            connections: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, connection: Arc<ClientConnection>) {
        self.connections.write().unwrap().insert(connection.id, connection);
    }

    /// Idempotent: removing an id that is not present is a no-op, not an
    /// error, since GOODBYE and transport-close can both race to clean up
    /// the same session.
    pub fn remove(&self, id: ID) -> Option<Arc<ClientConnection>> {
        self.connections.write().unwrap().remove(&id)
    }

    pub fn get(&self, id: ID) -> Option<Arc<ClientConnection>> {
        self.connections.read().unwrap().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.connections.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All connections passing `predicate`, e.g. to locate zombie sessions
    /// to reap or all sessions that hold a given metadata field.
    pub fn filter_by<F>(&self, predicate: F) -> Vec<Arc<ClientConnection>>
    where
        F: Fn(&ClientConnection) -> bool,
    {
        self.connections
            .read()
            .unwrap()
            .values()
            .filter(|c| predicate(c))
            .cloned()
            .collect()
    }

    pub fn all(&self) -> Vec<Arc<ClientConnection>> {
        self.connections.read().unwrap().values().cloned().collect()
    }
}
