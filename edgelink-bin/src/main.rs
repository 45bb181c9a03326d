use clap::Parser;
use edgelink_broker::{BrokerConfig, DriverBroker};
use edgelink_common::{Logger, Settings};
use edgelink_error::EdgeResult;
use std::path::PathBuf;
use tracing::info;

/// Edge driver protocol broker.
///
/// Hosts the private MQTT bus that an edge agent and its southbound
/// drivers coordinate over. Listening address, credential directory and
/// the optional debug identity come from `EDGE_*` environment variables
/// or a settings file.
#[derive(Parser)]
#[command(name = "edgelink")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Edge driver protocol broker", long_about = None)]
struct Cli {
    /// Sets a custom settings file with full path
    #[arg(short, long, env = "EDGE_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> EdgeResult<()> {
    let cli = Cli::parse();

    let mut logger = Logger::new(None);
    logger.initialize()?;

    let config_path = cli.config.as_ref().map(|p| p.to_string_lossy().to_string());
    let settings = Settings::new(config_path.as_deref())?;

    let broker = DriverBroker::new(BrokerConfig::from_settings(&settings)?);
    broker.start().await?;

    shutdown_signal().await;
    info!("Shutdown signal received");
    broker.stop();
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut interrupt = signal(SignalKind::interrupt()).expect("SIGINT handler");
    let mut terminate = signal(SignalKind::terminate()).expect("SIGTERM handler");
    tokio::select! {
        _ = interrupt.recv() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
