use anyhow::Context;
use clap::Parser;
use ingest_server::{
    serve_connection, AdminConsole, BroadcastNotifier, CommandDispatcher, IdleSweeper,
    IngestContext, MemoryStore, ServerConfig, SessionRegistry,
};
use prost::Message;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use tracker_shared::FixUpdate;

/// GPS tracker ingest server
#[derive(Parser, Debug)]
#[command(name = "ingest-server", version)]
struct Args {
    /// Device-facing listen address
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Admin console listen address
    #[arg(long)]
    admin: Option<SocketAddr>,

    /// Seconds of silence before a session is evicted
    #[arg(long)]
    max_idle_secs: Option<u64>,

    /// Seconds between idle sweeps
    #[arg(long)]
    sweep_interval_secs: Option<u64>,

    /// Default log level when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: tracing::Level,
}

impl Args {
    fn apply(&self, config: &mut ServerConfig) {
        if let Some(addr) = self.listen {
            config.listen_addr = addr;
        }
        if let Some(addr) = self.admin {
            config.admin_addr = Some(addr);
        }
        if let Some(secs) = self.max_idle_secs {
            config.max_idle = Duration::from_secs(secs);
        }
        if let Some(secs) = self.sweep_interval_secs.filter(|s| *s > 0) {
            config.sweep_interval = Duration::from_secs(secs);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(args.log_level.into()))
        .init();

    let mut config = ServerConfig::from_env().context("invalid environment configuration")?;
    args.apply(&mut config);

    let registry = Arc::new(SessionRegistry::new());
    let store = Arc::new(MemoryStore::new());
    let notifier = Arc::new(BroadcastNotifier::default());

    spawn_update_logger(&notifier);

    let _sweeper = IdleSweeper::new(registry.clone(), config.max_idle, config.sweep_interval).spawn();
    info!(
        max_idle_secs = config.max_idle.as_secs(),
        interval_secs = config.sweep_interval.as_secs(),
        "Idle sweeper started"
    );

    if let Some(admin_addr) = config.admin_addr {
        let listener = TcpListener::bind(admin_addr)
            .await
            .with_context(|| format!("failed to bind admin console on {admin_addr}"))?;
        let dispatcher = Arc::new(CommandDispatcher::new(registry.clone()));
        let console = Arc::new(AdminConsole::new(registry.clone(), dispatcher));
        tokio::spawn(async move {
            if let Err(e) = console.serve(listener).await {
                error!(error = %e, "Admin console stopped");
            }
        });
    }

    let mut ctx = IngestContext::new(registry.clone(), store.clone(), notifier.clone());
    ctx.sink_capacity = config.sink_capacity;
    ctx.read_buffer_size = config.read_buffer_size;

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, "Tracker server listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((socket, addr)) => {
                    if let Err(e) = socket.set_nodelay(true) {
                        debug!(peer = %addr, error = %e, "Failed to set TCP_NODELAY");
                    }
                    tokio::spawn(serve_connection(socket, addr, ctx.clone()));
                }
                Err(e) => warn!(error = %e, "Accept failed"),
            },
            _ = tokio::signal::ctrl_c() => {
                info!(
                    sessions = registry.count().await,
                    devices = store.device_count().await,
                    locations = store.location_count().await,
                    "Shutting down"
                );
                for (imei, handle) in registry.handles().await {
                    if let Err(e) = handle.shutdown().await {
                        debug!(imei = %imei, error = %e, "Failed to close device transport");
                    }
                }
                break;
            }
        }
    }

    Ok(())
}

/// Log every published fix update at debug level
fn spawn_update_logger(notifier: &BroadcastNotifier) {
    let mut updates = notifier.subscribe();
    tokio::spawn(async move {
        loop {
            match updates.recv().await {
                Ok(n) => match FixUpdate::decode(n.payload) {
                    Ok(update) => debug!(
                        topic = %n.topic,
                        imei = %update.imei,
                        lat = update.latitude,
                        lon = update.longitude,
                        alarm = ?update.alarm,
                        "Fix update"
                    ),
                    Err(e) => warn!(error = %e, "Undecodable fix update"),
                },
                Err(RecvError::Lagged(skipped)) => debug!(skipped, "Update logger lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });
}
