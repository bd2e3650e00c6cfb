use tracing::info;
use tracing_subscriber::EnvFilter;

use flotilla::config::ServerConfig;
use flotilla::metrics::register_metrics;
use flotilla::server::Server;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // RUST_LOG controls verbosity; LOG_FORMAT=json switches to structured
    // output for log shippers.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if std::env::var("LOG_FORMAT").map(|v| v == "json").unwrap_or(false) {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    register_metrics()?;

    let config = ServerConfig::from_env();
    info!(
        node_id = %config.node_id,
        region = %config.region,
        bind_addr = %config.bind_addr,
        peers = config.peers.len(),
        num_schedulers = config.num_schedulers,
        "starting flotilla server"
    );

    let server = Server::start(config).await?;

    // Run until interrupted, then shut down cleanly: workers nack their
    // in-flight evals so a successor can pick them up.
    tokio::signal::ctrl_c().await?;
    info!("interrupt received");
    server.shutdown();
    // Give long-lived loops a moment to observe the cancellation.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    Ok(())
}
