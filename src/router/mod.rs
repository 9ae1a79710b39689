//! WAMP router: owns the session registry, the topic manager, and the
//! static procedure table, and drives the WebSocket accept loop.

mod processors;
mod rpc;
mod transport;

pub use processors::Dispatcher;
pub use rpc::{Broadcast, ProcedureTable};

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::config::RouterConfig;
use crate::identifier::IdAllocator;
use crate::messages::{default_welcome_details, Message};
use crate::session::{ClientConnection, ConnectionRegistry};
use crate::topic::{PubSubBackend, TopicManager};
use crate::{Dict, WampResult};

/// Pluggable admission and permission checks (§6's "authorization hook").
/// The default `AllowAll` admits every realm and every subscribe/publish.
pub trait Authorizer: Send + Sync {
    /// Called on `HELLO`. `Ok` admits the session and returns the `details`
    /// dict for `WELCOME`; `Err` aborts the connection with the given
    /// message.
    fn authorize_hello(&self, realm: &str, details: &Dict) -> Result<Dict, String>;

    fn authorize_subscribe(&self, connection: &ClientConnection, topic: &str) -> Result<(), String>;

    fn authorize_publish(&self, connection: &ClientConnection, topic: &str) -> Result<(), String>;
}

pub struct AllowAll;

impl Authorizer for AllowAll {
    fn authorize_hello(&self, _realm: &str, _details: &Dict) -> Result<Dict, String> {
        Ok(default_welcome_details())
    }

    fn authorize_subscribe(&self, _connection: &ClientConnection, _topic: &str) -> Result<(), String> {
        Ok(())
    }

    fn authorize_publish(&self, _connection: &ClientConnection, _topic: &str) -> Result<(), String> {
        Ok(())
    }
}

/// A running WAMP router node.
pub struct Router {
    config: RouterConfig,
    registry: Arc<ConnectionRegistry>,
    ids: Arc<IdAllocator>,
    dispatcher: Arc<Dispatcher>,
    shutting_down: Arc<Notify>,
}

impl Router {
    pub fn new(config: RouterConfig, authorizer: Arc<dyn Authorizer>) -> WampResult<Router> {
        let node_id = uuid::Uuid::new_v4().simple().to_string();
        let registry = Arc::new(ConnectionRegistry::new());
        let ids = Arc::new(IdAllocator::new());

        let backend: Option<Arc<dyn PubSubBackend>> = match &config.redis {
            Some(redis_config) => {
                let bus = crate::topic::redis_backend::RedisBus::new(
                    &redis_config.url(),
                    node_id.clone(),
                    config.pubsub_timeout,
                    config.publisher_recycle_interval,
                )?;
                Some(Arc::new(bus))
            }
            None => {
                info!("no redis configured; running single-node, local fanout only");
                None
            }
        };

        let topics = Arc::new(TopicManager::new(registry.clone(), ids.clone(), backend, node_id));
        let procedures = Arc::new(ProcedureTable::new());
        let dispatcher = Arc::new(Dispatcher {
            realm: config.realm.clone(),
            ids: ids.clone(),
            topics,
            procedures,
            authorizer,
        });

        Ok(Router {
            config,
            registry,
            ids,
            dispatcher,
            shutting_down: Arc::new(Notify::new()),
        })
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Bind and accept WebSocket connections until `shutdown` is called.
    pub async fn listen(self: Arc<Self>) -> WampResult<()> {
        let listener = TcpListener::bind(&self.config.listen_addr).await?;
        info!(addr = %self.config.listen_addr, realm = %self.config.realm, "router listening");

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer_addr) = accepted?;
                    let router = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = transport::handle_connection(router, stream, peer_addr).await {
                            warn!(peer = %peer_addr, "connection ended with error: {}", e);
                        }
                    });
                }
                _ = self.shutting_down.notified() => {
                    info!("router shutting down, no longer accepting connections");
                    return Ok(());
                }
            }
        }
    }

    /// Broadcast `GOODBYE` to every live session, give writer tasks a
    /// moment to flush, then stop the accept loop. Mirrors the original
    /// router's shutdown (send GOODBYE, sleep, close sockets) adapted to
    /// cooperative async tasks instead of owned socket handles.
    pub async fn shutdown(&self) {
        for connection in self.registry.all() {
            connection.send(Message::goodbye(Dict::new(), "wamp.close.system_shutdown"));
        }
        info!("goodbye sent to {} session(s); waiting for drain", self.registry.len());
        tokio::time::sleep(Duration::from_secs(5)).await;
        self.shutting_down.notify_waiters();
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn allocate_session_id(&self) -> crate::ID {
        self.ids.allocate()
    }
}
