use retrowaves::config::StationConfig;
use retrowaves::station::lifecycle::Station;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    retrowaves::logging::init("station");

    let config = StationConfig::from_env();
    tracing::info!(?config, "configuration loaded");

    let station = Station::new(config)?;
    station.start()?;

    // Signal handlers only observe; the lifecycle machine owns every
    // ordering decision, so SIGTERM, SIGINT and programmatic stop all
    // follow the same path.
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        tracing::info!("shutdown signal received");
    }

    // The drain phase can run for minutes; keep it off the runtime
    // workers.
    tokio::task::spawn_blocking(move || station.stop()).await?;
    Ok(())
}
