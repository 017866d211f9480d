//! Conduit Agent
//!
//! Bridges a game server's management WebSocket to the Conduit relay.

use std::sync::Arc;

use clap::Parser;
use tracing::info;

use conduit_agent::bridge::BridgeSettings;
use conduit_agent::config::{AgentArgs, AgentConfig};
use conduit_agent::dial::WsDialer;
use conduit_agent::supervisor::ReconnectSupervisor;
use conduit_agent::telemetry::TelemetryRecorder;
use conduit_core::shutdown::ShutdownListener;
use conduit_core::tracing_init::{LogFormat, init_tracing};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let args = AgentArgs::parse();
    init_tracing("conduit_agent=info", LogFormat::from_json_flag(args.log_json));

    let config = AgentConfig::from_args(&args)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        control = %config.control.url,
        endpoint = %config.endpoint.url,
        "Starting conduit-agent"
    );

    let telemetry = Arc::new(TelemetryRecorder::new());
    let policy = config.reconnect.clone();
    let telemetry_interval = config.telemetry_interval;
    let dialer = Arc::new(WsDialer::new(config)?);

    let mut signals = ShutdownListener::install()?;
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let reporter = telemetry.spawn_reporter(telemetry_interval, shutdown_rx.clone());
    let supervisor = ReconnectSupervisor::new(
        dialer,
        policy,
        BridgeSettings::default(),
        Arc::clone(&telemetry),
    );
    let supervisor = tokio::spawn(async move { supervisor.run(shutdown_rx).await });

    signals.recv().await?;
    let _ = shutdown_tx.send(true);

    supervisor.await?;
    reporter.await?;
    info!("Agent stopped");
    Ok(())
}
