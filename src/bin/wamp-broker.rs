use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use wamp_broker::config::{Args, RouterConfig};
use wamp_broker::router::{AllowAll, Router};

#[tokio::main]
async fn main() -> wamp_broker::WampResult<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&args.log_filter).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = RouterConfig::from(args);
    let router = Arc::new(Router::new(config, Arc::new(AllowAll))?);

    let listener = router.clone();
    let listen_task = tokio::spawn(async move { listener.listen().await });

    tokio::signal::ctrl_c().await.expect("failed to listen for ctrl-c");
    tracing::info!("received shutdown signal");
    router.shutdown().await;

    match listen_task.await {
        Ok(result) => result,
        Err(e) => {
            tracing::warn!("listener task panicked: {}", e);
            Ok(())
        }
    }
}
