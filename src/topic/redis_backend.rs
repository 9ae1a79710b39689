//! Cross-node fanout over Redis pub/sub.
//!
//! Grounded on `tests/integration/test_topic.py` (the only place in the
//! original implementation that exercises the Redis wiring —
//! `tornadis.Client` / `tornadis.PubSubClient`, `RedisUnavailableError`,
//! `PUBSUB_TIMEOUT`) and on the async Redis pub/sub pattern used by
//! `rcommerce`'s cache module: one shared publisher connection, one lazily
//! created subscriber task per topic, evicted on transport error.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::messages::BroadcastMessage;
use crate::{Error, ErrorKind, WampResult};

/// Whatever a `TopicManager` uses to fan events out to other nodes. A trait
/// so tests can substitute a fake bus instead of a live Redis deployment.
#[async_trait]
pub trait PubSubBackend: Send + Sync {
    async fn publish(&self, topic: &str, broadcast: &BroadcastMessage) -> WampResult<()>;

    /// Ensure a subscriber loop is running for `topic`, delivering every
    /// message it receives to `on_message`. A no-op if one is already
    /// running. Called when a topic's first local subscriber arrives.
    /// `on_disconnect` fires once, from within the loop's task, if the
    /// subscriber connection drops or its stream ends for any other reason
    /// (§4.4.4's eviction path) — the caller is responsible for evicting
    /// local subscribers of `topic` in response.
    async fn ensure_subscribed(
        self: Arc<Self>,
        topic: String,
        on_message: Arc<dyn Fn(BroadcastMessage) + Send + Sync>,
        on_disconnect: Arc<dyn Fn() + Send + Sync>,
    ) -> WampResult<()>;

    /// Tear down the subscriber loop for `topic`. Called when a topic's
    /// last local subscriber leaves.
    async fn ensure_unsubscribed(&self, topic: &str);
}

struct SubscriberHandle {
    task: JoinHandle<()>,
}

/// Live Redis-backed implementation.
pub struct RedisBus {
    client: redis::Client,
    node_id: String,
    pubsub_timeout: Duration,
    publisher_recycle_interval: Duration,
    publisher: Mutex<Option<(ConnectionManager, Instant)>>,
    subscribers: Mutex<HashMap<String, SubscriberHandle>>,
}

impl RedisBus {
    pub fn new(
        url: &str,
        node_id: String,
        pubsub_timeout: Duration,
        publisher_recycle_interval: Duration,
    ) -> WampResult<RedisBus> {
        let client = redis::Client::open(url).map_err(|e| Error::new(ErrorKind::BackendUnavailable(e)))?;
        Ok(RedisBus {
            client,
            node_id,
            pubsub_timeout,
            publisher_recycle_interval,
            publisher: Mutex::new(None),
            subscribers: Mutex::new(HashMap::new()),
        })
    }

    /// The shared publisher connection, created lazily and recycled once it
    /// outlives `publisher_recycle_interval`.
    async fn publisher_connection(&self) -> WampResult<ConnectionManager> {
        let mut slot = self.publisher.lock().await;
        if let Some((conn, created_at)) = slot.as_ref() {
            if created_at.elapsed() < self.publisher_recycle_interval {
                return Ok(conn.clone());
            }
            debug!("recycling redis publisher connection after {:?}", created_at.elapsed());
        }
        let conn = self
            .client
            .get_connection_manager()
            .await
            .map_err(|e| Error::new(ErrorKind::BackendUnavailable(e)))?;
        *slot = Some((conn.clone(), Instant::now()));
        Ok(conn)
    }
}

#[async_trait]
impl PubSubBackend for RedisBus {
    async fn publish(&self, topic: &str, broadcast: &BroadcastMessage) -> WampResult<()> {
        let mut conn = self.publisher_connection().await?;
        let payload = broadcast.to_json();
        let _: i64 = conn
            .publish(topic, payload)
            .await
            .map_err(|e| Error::new(ErrorKind::BackendUnavailable(e)))?;
        Ok(())
    }

    async fn ensure_subscribed(
        self: Arc<Self>,
        topic: String,
        on_message: Arc<dyn Fn(BroadcastMessage) + Send + Sync>,
        on_disconnect: Arc<dyn Fn() + Send + Sync>,
    ) -> WampResult<()> {
        let mut subscribers = self.subscribers.lock().await;
        if subscribers.contains_key(&topic) {
            return Ok(());
        }

        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| Error::new(ErrorKind::BackendUnavailable(e)))?;
        pubsub
            .subscribe(&topic)
            .await
            .map_err(|e| Error::new(ErrorKind::BackendUnavailable(e)))?;

        let node_id = self.node_id.clone();
        let pubsub_timeout = self.pubsub_timeout;
        let topic_for_task = topic.clone();
        let bus = self.clone();
        let task = tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            loop {
                match tokio::time::timeout(pubsub_timeout, stream.next()).await {
                    Ok(Some(msg)) => {
                        let payload: String = match msg.get_payload() {
                            Ok(p) => p,
                            Err(e) => {
                                warn!("redis pubsub payload decode failed on {}: {}", topic_for_task, e);
                                continue;
                            }
                        };
                        match BroadcastMessage::from_json(&payload) {
                            Ok(broadcast) if broadcast.publisher_node_id == node_id => {
                                // Our own publish already fanned out locally.
                            }
                            Ok(broadcast) => on_message(broadcast),
                            Err(e) => warn!("dropping malformed broadcast on {}: {}", topic_for_task, e),
                        }
                    }
                    Ok(None) => {
                        info!("redis pubsub stream for {} ended; evicting its local subscribers", topic_for_task);
                        on_disconnect();
                        break;
                    }
                    Err(_elapsed) => {
                        // Plain keepalive tick; PUBSUB_TIMEOUT just bounds
                        // how long we block before re-checking for shutdown.
                        continue;
                    }
                }
            }
            // Drop the stale entry so a future subscriber can establish a
            // fresh subscriber connection instead of finding this dead one.
            bus.subscribers.lock().await.remove(&topic_for_task);
        });

        subscribers.insert(topic, SubscriberHandle { task });
        Ok(())
    }

    async fn ensure_unsubscribed(&self, topic: &str) {
        let mut subscribers = self.subscribers.lock().await;
        if let Some(handle) = subscribers.remove(topic) {
            handle.task.abort();
        }
    }
}
