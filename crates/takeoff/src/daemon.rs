//! The `serve` command: HTTP API plus dispatcher workers over one store.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use miette::Result;
use tokio::sync::watch;
use tracing::{error, info, warn};

use takeoff_scheduler::{
    Dispatcher, HttpNotifier, JobStore, NotificationPlanner, SchedulerConfig, SqliteJobStore,
    spawn_workers,
};

use crate::server::{AppState, create_router};

/// Configuration for the daemon.
pub struct DaemonConfig {
    pub db_path: PathBuf,
    pub notify_url: String,
    pub listen: String,
    pub scheduler: SchedulerConfig,
}

/// Run until Ctrl-C.
pub async fn run(config: DaemonConfig) -> Result<()> {
    config
        .scheduler
        .validate()
        .map_err(|e| miette::miette!("{}", e))?;

    let store = SqliteJobStore::open(&config.db_path)
        .map_err(|e| miette::miette!("failed to open job store: {}", e))?
        .with_visibility_timeout(config.scheduler.visibility_timeout());
    let store = Arc::new(store);

    match store.recover_expired() {
        Ok(0) => {}
        Ok(recovered) => info!(recovered, "requeued jobs with expired claims"),
        Err(e) => warn!(error = %e, "failed to recover expired claims"),
    }

    let notifier = HttpNotifier::new(
        config.notify_url.clone(),
        config.scheduler.executor_timeout(),
        Duration::from_millis(config.scheduler.stale_grace_ms),
    )
    .map_err(|e| miette::miette!("{}", e))?;

    let store_handle: Arc<dyn JobStore> = store.clone();
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&store_handle),
        Arc::new(notifier),
        &config.scheduler,
    ));
    let planner = NotificationPlanner::new(Arc::clone(&store_handle), &config.scheduler);

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Handle shutdown signals
    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("received shutdown signal");
        let _ = shutdown_tx_clone.send(true);
    });

    let workers = spawn_workers(dispatcher, config.scheduler.workers, shutdown_rx.clone());

    let router = create_router(Arc::new(AppState {
        planner,
        store: store_handle,
    }));
    let listener = tokio::net::TcpListener::bind(&config.listen)
        .await
        .map_err(|e| miette::miette!("failed to bind {}: {}", config.listen, e))?;

    info!(
        listen = %config.listen,
        notify_url = %config.notify_url,
        db = %config.db_path.display(),
        workers = config.scheduler.workers,
        "takeoff started"
    );

    let mut server_shutdown = shutdown_rx.clone();
    let served = axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            while !*server_shutdown.borrow() {
                if server_shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await;

    if let Err(e) = &served {
        error!(error = %e, "HTTP server failed");
    }

    // Stop the workers whether the server exited cleanly or not
    let _ = shutdown_tx.send(true);
    for worker in workers {
        if let Err(e) = worker.await {
            error!(error = %e, "dispatcher worker panicked");
        }
    }

    info!("takeoff stopped");
    served.map_err(|e| miette::miette!("HTTP server error: {}", e))
}
