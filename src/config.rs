//! Router configuration and the CLI surface over it.

use std::time::Duration;

use clap::Parser;

/// Runtime configuration for a single router node.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub realm: String,
    pub listen_addr: String,
    pub redis: Option<RedisConfig>,
    /// How long a topic's Redis subscriber loop waits for a message before
    /// looping again to check for shutdown. Does not bound message latency.
    pub pubsub_timeout: Duration,
    /// Shared Redis publisher connections are recycled after this long to
    /// bound the lifetime of any single TCP connection.
    pub publisher_recycle_interval: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        RouterConfig {
            realm: "default".to_string(),
            listen_addr: "127.0.0.1:8090".to_string(),
            redis: None,
            pubsub_timeout: Duration::from_secs(60),
            publisher_recycle_interval: Duration::from_secs(3 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
}

impl RedisConfig {
    pub fn url(&self) -> String {
        format!("redis://{}:{}", self.host, self.port)
    }
}

/// `wamp-broker` command-line arguments.
#[derive(Debug, Parser)]
#[command(name = "wamp-broker", about = "WAMPv2 router: session, broker, dealer")]
pub struct Args {
    /// Default realm new sessions are admitted to.
    #[arg(long, default_value = "default")]
    pub realm: String,

    /// Address the WebSocket listener binds to.
    #[arg(long, default_value = "127.0.0.1:8090")]
    pub listen_addr: String,

    /// Redis host for cross-node fanout. Omit to run single-node, local-only.
    #[arg(long)]
    pub redis_host: Option<String>,

    #[arg(long, default_value_t = 6379)]
    pub redis_port: u16,

    /// Seconds a topic's Redis subscriber loop waits per poll.
    #[arg(long, default_value_t = 60)]
    pub pubsub_timeout_secs: u64,

    /// Hours before a shared Redis publisher connection is recycled.
    #[arg(long, default_value_t = 3)]
    pub publisher_recycle_hours: u64,

    /// Log filter directive, e.g. `wamp_broker=debug,tower_http=info`.
    #[arg(long, env = "WAMP_BROKER_LOG", default_value = "info")]
    pub log_filter: String,
}

impl From<Args> for RouterConfig {
    fn from(args: Args) -> RouterConfig {
        let redis = args.redis_host.map(|host| RedisConfig {
            host,
            port: args.redis_port,
        });
        RouterConfig {
            realm: args.realm,
            listen_addr: args.listen_addr,
            redis,
            pubsub_timeout: Duration::from_secs(args.pubsub_timeout_secs),
            publisher_recycle_interval: Duration::from_secs(args.publisher_recycle_hours * 60 * 60),
        }
    }
}
