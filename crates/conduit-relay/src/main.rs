//! Conduit Relay Server
//!
//! Accepts agent management sockets, proxies operator RPC calls to them and
//! fans agent notifications out to viewer sockets.

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::info;

use conduit_core::shutdown::ShutdownListener;
use conduit_core::tracing_init::{LogFormat, init_tracing};
use conduit_relay::provision::provision_server;
use conduit_relay::registry::{ConnectionHub, HubSettings};
use conduit_relay::server::{AppState, build_router};
use conduit_relay::storage::RelayDatabase;

#[derive(Parser, Debug)]
#[command(name = "conduit-relay")]
#[command(version, about = "Conduit relay server - agent hub and RPC proxy")]
struct Args {
    /// Address to listen on. Defaults to `0.0.0.0:$PORT`, or port 8080.
    #[arg(long, env = "CONDUIT_LISTEN_ADDR")]
    addr: Option<SocketAddr>,

    /// Port to listen on when no address is given.
    #[arg(long, env = "PORT")]
    port: Option<u16>,

    /// Path to SQLite database file.
    #[arg(long, env = "CONDUIT_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Bearer token operators present on RPC, schema and viewer endpoints.
    #[arg(long, env = "CONDUIT_OPERATOR_TOKEN", hide_env_values = true)]
    operator_token: Option<String>,

    /// Deadline for one proxied RPC call, in seconds.
    #[arg(long, default_value_t = 15)]
    request_timeout: u64,

    /// Deadline for delivering one notification to one viewer, in seconds.
    #[arg(long, default_value_t = 5)]
    broadcast_timeout: u64,

    /// Deadline for any other socket write, in seconds.
    #[arg(long, default_value_t = 10)]
    write_timeout: u64,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register a server and print the token its agent must present.
    AddServer {
        /// Display name of the server.
        #[arg(long)]
        name: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing("conduit_relay=info", LogFormat::from_json_flag(args.log_json));

    let db_path = match &args.db_path {
        Some(path) => path.clone(),
        None => default_db_path()?,
    };
    info!(path = %db_path.display(), "Opening relay database");
    let db = RelayDatabase::open(&db_path).await?;

    if let Some(Command::AddServer { name }) = &args.command {
        let server = provision_server(&db, name).await?;
        info!(server_id = %server.id, name = %server.name, "Server registered");
        #[allow(clippy::print_stdout)]
        {
            println!("server id:   {}", server.id);
            println!("agent token: {}", server.agent_token);
        }
        return Ok(());
    }

    let operator_token = args
        .operator_token
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| anyhow::anyhow!("CONDUIT_OPERATOR_TOKEN (--operator-token) is required"))?;

    let addr = listen_addr(args.addr, args.port);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        %addr,
        "Starting conduit-relay"
    );

    let hub = ConnectionHub::new(
        Arc::new(db),
        HubSettings {
            write_timeout: Duration::from_secs(args.write_timeout),
            broadcast_timeout: Duration::from_secs(args.broadcast_timeout),
        },
    );
    let state = AppState::new(
        hub.clone(),
        operator_token,
        Duration::from_secs(args.request_timeout),
    );

    let mut signals = ShutdownListener::install()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "Relay listening");

    let server = axum::serve(listener, build_router(state)).into_future();
    tokio::select! {
        result = server => {
            result?;
        }
        signal = signals.recv() => {
            signal?;
        }
    }

    hub.shutdown().await;
    info!("Relay stopped");
    Ok(())
}

const DEFAULT_PORT: u16 = 8080;

/// An explicit address wins over a bare port.
fn listen_addr(addr: Option<SocketAddr>, port: Option<u16>) -> SocketAddr {
    addr.unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], port.unwrap_or(DEFAULT_PORT))))
}

fn default_db_path() -> anyhow::Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Cannot determine home directory"))?;
    Ok(home.join(".conduit").join("relay.db"))
}
