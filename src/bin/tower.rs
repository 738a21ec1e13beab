use std::sync::Arc;

use retrowaves::config::TowerConfig;
use retrowaves::tower::{http, service::TowerService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    retrowaves::logging::init("tower");

    let config = TowerConfig::from_env();
    tracing::info!(?config, "configuration loaded");

    let service = Arc::new(TowerService::new(config.clone()));
    service.start()?;

    let app = http::router(Arc::clone(&service));
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("HTTP server listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    service.stop();
    Ok(())
}

/// Resolves on SIGINT or SIGTERM. Handlers only observe the signal; all
/// shutdown ordering lives in `TowerService::stop`.
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
    tracing::info!("shutdown signal received");
}
