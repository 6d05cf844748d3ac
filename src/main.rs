use anyhow::Result;
use portmux::{
    Config, FileRouteSource, ListenerRegistry, Reconciler, RouteSource, SqlRouteSource,
    config::{CONFIG_FILE, RouteStore},
    load_config,
};
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config = load_config()?;
    info!(
        config_file = CONFIG_FILE,
        listen_ip = %config.listen.ip,
        refresh_interval_secs = config.routes.refresh_interval_secs,
        "Configuration loaded"
    );

    match config.route_store()? {
        RouteStore::Database(database) => {
            let source = SqlRouteSource::connect(database).await?;
            let reconciler = serve(source, &config).await;
            reconciler.source().close().await;
        }
        RouteStore::File(path) => {
            info!(routes_file = %path.display(), "Using route file");
            serve(FileRouteSource::open(path)?, &config).await;
        }
    }

    info!("Port forwarder stopped");
    Ok(())
}

async fn serve<S: RouteSource>(source: S, config: &Config) -> Reconciler<S> {
    let registry = Arc::new(ListenerRegistry::new());
    let reconciler = Reconciler::new(source, registry, config.listen.ip);

    info!("Port forwarder started");
    reconciler
        .run(config.routes.refresh_interval(), shutdown_signal())
        .await;
    reconciler
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal, running until killed");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
