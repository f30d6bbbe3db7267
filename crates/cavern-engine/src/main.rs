//! Service binary for the Cavern consensus grid.
//!
//! Wires the durable tier, the engine and the maintenance task together,
//! replays any historical reports piped on stdin, then runs until Ctrl-C.
//!
//! # Startup Sequence
//!
//! 1. Load configuration from `cavern-config.yaml` (or `CAVERN_CONFIG`)
//! 2. Initialize structured logging (tracing)
//! 3. Connect to `PostgreSQL` and run migrations
//! 4. Open the engine, hydrating the active epoch
//! 5. Connect to Dragonfly if configured
//! 6. Replay newline-delimited JSON reports from stdin, when piped
//! 7. Spawn the maintenance task and wait for Ctrl-C
//! 8. Stop maintenance (final flush) and close the pool

mod error;
mod replay;

use std::io::IsTerminal;
use std::sync::Arc;

use cavern_core::{CavernConfig, Engine, NoReplay, SystemClock, maintenance};
use cavern_db::{DragonflyPool, PostgresPool, PostgresStore};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::error::ServiceError;

/// Application entry point for the Cavern service.
///
/// # Errors
///
/// Returns an error if any startup step fails. Failures after startup are
/// logged and retried by the maintenance task instead.
#[tokio::main]
async fn main() -> Result<(), ServiceError> {
    // 1. Load configuration.
    let config = CavernConfig::load()?;

    // 2. Initialize structured logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .with_target(true)
        .init();

    info!(
        width = config.grid.width,
        height = config.grid.height,
        week_starts_on = %config.epoch.week_starts_on,
        flush_interval_secs = config.persistence.flush_interval_secs,
        "cavern-engine starting"
    );

    // 3. Durable tier.
    let pool = PostgresPool::connect(
        &config.infrastructure.postgres_url,
        config.infrastructure.pool_limits(),
    )
    .await?;
    pool.run_migrations().await?;

    // 4. Engine.
    let engine = Arc::new(
        Engine::open(
            PostgresStore::new(pool.clone()),
            config.engine_settings(),
            Arc::new(SystemClock),
            Arc::new(NoReplay),
        )
        .await?,
    );
    info!(epoch = %engine.active_epoch().await, "Engine ready");

    // 5. Optional publication tier.
    let publisher = match &config.infrastructure.dragonfly_url {
        Some(url) => match DragonflyPool::connect(url).await {
            Ok(dragonfly) => Some(dragonfly),
            Err(e) => {
                tracing::warn!(error = %e, "Dragonfly unavailable, publishing disabled");
                None
            }
        },
        None => None,
    };

    // 6. Bulk replay.
    if std::io::stdin().is_terminal() {
        info!("stdin is a terminal, skipping bulk replay");
    } else {
        let stdin = tokio::io::BufReader::new(tokio::io::stdin());
        replay::replay(&*engine, stdin).await?;
    }

    // 7. Maintenance until Ctrl-C.
    let handle = maintenance::spawn(
        Arc::clone(&engine),
        config.maintenance_settings(),
        publisher,
    );
    info!("Running; press Ctrl-C to stop");
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl-C, shutting down");
    }

    // 8. Shutdown.
    info!("Shutting down");
    handle.shutdown().await?;
    pool.close().await;
    info!("cavern-engine stopped");
    Ok(())
}
