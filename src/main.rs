use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use clap::Parser;
use changerelay::replication::ReplicationSession;
use changerelay::sequence::Sequence;
use changerelay::server::{self, AppState};
use changerelay::storage::{ChangeStore, MemoryStore};
use changerelay::tracker::ChangeTracker;
use changerelay::{Config, Error, Relay, Result};
use tokio::sync::oneshot;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "changerelay")]
#[command(about = "PostgreSQL logical-replication change relay", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
    config: PathBuf,

    #[arg(short, long, help = "Enable JSON output for logs")]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose);

    info!("Starting changerelay");
    info!("Loading configuration from {:?}", args.config);

    let config = match Config::from_file(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(Error::Config(e));
        }
    };

    info!(
        postgres_host = %config.postgres.host,
        postgres_port = %config.postgres.port,
        postgres_database = %config.postgres.database,
        slot_name = %config.postgres.slot_name,
        listen_addr = %config.server.listen_addr,
        "Configuration summary"
    );

    let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
    let tracker = ChangeTracker::new();
    let healthy = Arc::new(AtomicBool::new(true));

    let session = ReplicationSession::start(
        &config.connect_config(),
        &config.postgres.slot_name,
        &config.postgres.output_plugin,
    )
    .await?;
    info!(slot = %config.postgres.slot_name, "replication streaming");

    // The store starts empty, so nothing needs to be skipped on replay.
    let relay = Relay::new(
        session,
        store.clone(),
        tracker.clone(),
        healthy.clone(),
        Sequence::default(),
    );
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let relay_handle = tokio::spawn(relay.run(shutdown_rx));

    let purge_handle = spawn_purge_ticker(store.clone(), &config);

    let state = AppState {
        store,
        tracker,
        healthy,
    };
    let listener = tokio::net::TcpListener::bind(&config.server.listen_addr).await?;
    info!(addr = %config.server.listen_addr, "HTTP server listening");

    axum::serve(listener, server::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down");
    purge_handle.abort();
    let _ = shutdown_tx.send(());
    match relay_handle.await {
        Ok(Ok(())) => info!("Relay stopped cleanly"),
        Ok(Err(e)) => warn!("Relay exited with error: {}", e),
        Err(e) => warn!("Relay task panicked: {}", e),
    }

    Ok(())
}

fn spawn_purge_ticker(store: Arc<MemoryStore>, config: &Config) -> tokio::task::JoinHandle<()> {
    let max_age = Duration::from_secs(config.replication.max_age_secs);
    let interval = Duration::from_secs(config.replication.purge_interval_secs.max(1));
    tokio::spawn(async move {
        if max_age.is_zero() {
            return;
        }
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let oldest = SystemTime::now() - max_age;
            match store.purge_older_than(oldest) {
                Ok(0) => {}
                Ok(purged) => info!(purged, "purged expired changes"),
                Err(e) => warn!("purge failed: {}", e),
            }
        }
    })
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
}

fn init_logging(json: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("changerelay=debug,info")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("changerelay=info,warn"))
    };

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
