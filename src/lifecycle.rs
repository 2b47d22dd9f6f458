//! Startup wiring, periodic maintenance, and graceful shutdown.
//!
//! `run` owns the whole process lifetime: load configuration and keys, wire
//! the shared components into `AppState`, start the listener plus the
//! background sweeps, and on a shutdown signal stop accepting connections,
//! drain the scheduler, flush, and exit.

use crate::access_log::AccessLog;
use crate::allowlist::Allowlist;
use crate::config::{Cli, Settings};
use crate::keys::KeyStore;
use crate::scheduler::Scheduler;
use crate::staging::{StagingArea, UploadSlots};
use crate::transport::{Upstream, create_hyper_client};
use crate::usage::FileUsageSink;
use crate::{AppState, build_metrics_layer_and_handle, build_router};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Cadence of the staging sweeper and the log-rotation check.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Staged files older than this are orphans and get swept.
const STAGING_MAX_AGE: Duration = Duration::from_secs(10 * 60);

/// Access log size that triggers rotation.
const ACCESS_LOG_MAX_BYTES: u64 = 100 * 1024 * 1024;

/// Rotated access-log backups retained.
const ACCESS_LOG_BACKUPS: usize = 5;

/// How long shutdown waits for queued and running work.
const DRAIN_DEADLINE: Duration = Duration::from_secs(30);

/// Per-principal concurrent multipart upload bound.
const MAX_UPLOADS_PER_PRINCIPAL: usize = 3;

pub async fn run(cli: Cli) -> Result<(), anyhow::Error> {
    let settings = Settings::load(&cli.config)?;
    let upstream_key = settings.resolve_upstream_key()?;

    let keys = KeyStore::load(&cli.keys)?;
    if cli.watch {
        keys.watch()?;
    }

    let allowlist = Arc::new(Allowlist::from_settings(&settings.allowlist));
    let scheduler = Scheduler::new(&settings.rate_limiting);
    let staging = StagingArea::new(cli.staging_dir.clone()).await?;
    let usage = FileUsageSink::spawn(cli.usage_log.clone());
    let access_log = AccessLog::spawn(cli.access_log.clone());

    let upstream = Arc::new(Upstream::new(
        create_hyper_client(),
        cli.upstream.clone(),
        upstream_key,
        &settings.http_client,
    ));

    let (metrics_layer, metrics_handle) = if settings.rate_limiting.metrics_enabled {
        let (layer, handle) = build_metrics_layer_and_handle("tollgate");
        (Some(layer), Some(handle))
    } else {
        (None, None)
    };

    spawn_maintenance(staging.clone(), cli.access_log.clone());

    let state = AppState {
        keys,
        allowlist,
        scheduler: Arc::clone(&scheduler),
        upstream,
        usage,
        access_log,
        staging: staging.clone(),
        upload_slots: UploadSlots::new(MAX_UPLOADS_PER_PRINCIPAL),
        metrics_handle,
    };

    let router = build_router(state);
    let router = match metrics_layer {
        Some(layer) => router.layer(layer),
        None => router,
    };

    let bind_addr = format!("0.0.0.0:{}", cli.port);
    let listener = TcpListener::bind(&bind_addr).await?;
    info!("Tollgate listening on {bind_addr}");

    let drain_trigger = Arc::clone(&scheduler);
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        info!("Shutdown signal received; refusing new admissions");
        drain_trigger.begin_drain();
    })
    .await?;

    if scheduler.wait_idle(DRAIN_DEADLINE).await {
        info!("Scheduler drained");
    } else {
        warn!(
            "Drain deadline of {}s elapsed with work still in flight",
            DRAIN_DEADLINE.as_secs()
        );
    }
    staging.sweep(Duration::ZERO).await;
    info!("Shutdown complete");
    Ok(())
}

fn spawn_maintenance(staging: StagingArea, access_log_path: PathBuf) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(MAINTENANCE_INTERVAL);
        tick.tick().await;
        loop {
            tick.tick().await;
            staging.sweep(STAGING_MAX_AGE).await;
            match AccessLog::rotate_if_needed(
                &access_log_path,
                ACCESS_LOG_MAX_BYTES,
                ACCESS_LOG_BACKUPS,
            )
            .await
            {
                Ok(true) => info!("Rotated access log"),
                Ok(false) => {}
                Err(e) => warn!("Access log rotation failed: {e}"),
            }
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
