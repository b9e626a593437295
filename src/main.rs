use nbsync::config::Config;
use nbsync::error::Result;
use nbsync::features::{self, Features, OPERATIONAL_PORT_STATUS};
use nbsync::journal::cleanup::{CleanupProcessingRows, DeleteCompletedRows};
use nbsync::journal::full_sync::FullSync;
use nbsync::journal::recovery::JournalRecovery;
use nbsync::journal::JournalWorker;
use nbsync::periodic::PeriodicTask;
use nbsync::ports::PortStatusHandler;
use nbsync::resources::PluginRegistry;
use nbsync::transport::{LightweightClient, RestClient, Transport};
use nbsync::websocket::{WebSocketReceiver, NEUTRON_PORTS_PATH};
use nbsync::{db, websocket};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().compact())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("nbsync.toml"));
    let config = Config::load(&config_path)?;

    let pool = db::connect(Path::new(&config.database_path)).await?;
    tracing::info!(path = %config.database_path, "journal database ready");

    let transport: Arc<dyn Transport> = if config.odl.enable_lightweight_testing {
        tracing::warn!("lightweight testing enabled, no controller will be contacted");
        Arc::new(LightweightClient::new())
    } else {
        Arc::new(RestClient::new(&config.odl)?)
    };

    // Drivers register here at startup; an empty registry still drains the
    // journal, it just cannot enumerate resources for full sync or recovery.
    let registry = PluginRegistry::new();

    let (stop_tx, stop_rx) = watch::channel(false);

    let features = Arc::new(Features::new());
    if !config.odl.enable_lightweight_testing {
        let probe_client =
            RestClient::with_base_url(&config.odl, websocket::restconf_base(&config.odl.url)?)?;
        features::negotiate(&features, &config.odl, &probe_client, stop_rx.clone()).await?;
    }

    let worker = Arc::new(JournalWorker::new(
        pool.clone(),
        Arc::clone(&transport),
        &config.odl,
    ));
    let sync_event = worker.sync_handle();

    let mut maintenance = PeriodicTask::new(
        pool.clone(),
        "maintenance",
        config.odl.maintenance_cadence(),
    );
    maintenance.register(Arc::new(DeleteCompletedRows::new(
        pool.clone(),
        config.odl.completed_rows_retention,
    )));
    maintenance.register(Arc::new(CleanupProcessingRows::new(
        pool.clone(),
        config.odl.processing_timeout as i64,
    )));
    maintenance.register(Arc::new(FullSync::new(
        pool.clone(),
        Arc::clone(&transport),
        registry.clone(),
        Arc::clone(&sync_event),
    )));
    maintenance.register(Arc::new(JournalRecovery::new(
        pool.clone(),
        Arc::clone(&transport),
        registry.clone(),
    )));

    let mut tasks = tokio::task::JoinSet::new();

    {
        let worker = Arc::clone(&worker);
        let stop = stop_rx.clone();
        tasks.spawn(async move { worker.run(stop).await });
    }
    {
        let stop = stop_rx.clone();
        tasks.spawn(async move { maintenance.run(stop).await });
    }

    let port_status_enabled = !config.odl.enable_lightweight_testing
        && features.snapshot().has(OPERATIONAL_PORT_STATUS);
    if port_status_enabled {
        let (events_tx, events_rx) = mpsc::channel(256);
        let receiver = WebSocketReceiver::new(&config.odl, NEUTRON_PORTS_PATH, events_tx)?;
        let handler = PortStatusHandler::new(registry.clone(), Arc::clone(&transport));
        let stop = stop_rx.clone();
        tasks.spawn(async move { receiver.run(stop).await });
        tasks.spawn(async move { handler.run(events_rx).await });
    } else {
        tracing::info!("operational port status not advertised, receiver disabled");
    }

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| nbsync::Error::Other(e.into()))?;
    tracing::info!("shutdown requested");
    let _ = stop_tx.send(true);
    sync_event.notify_one();

    while let Some(result) = tasks.join_next().await {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::error!(error = %err, "task exited with error"),
            Err(err) => tracing::error!(error = %err, "task panicked"),
        }
    }

    Ok(())
}
