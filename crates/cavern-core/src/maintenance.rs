//! Background maintenance: batched flushes and scheduled rotation checks.
//!
//! One tokio task waits on three things at once: the flush interval, the
//! rotation-check interval, and a shutdown notification. Failed flushes are
//! logged and retried wholesale on the next tick. On shutdown the task
//! flushes one last time before exiting.
//!
//! When a [`DragonflyPool`] is supplied, every successful flush and rotation
//! is followed by publishing the grid view and change tokens. A rotation
//! also removes the retired epoch's published view.

use std::sync::Arc;
use std::time::Duration;

use cavern_db::{DragonflyPool, DurableStore};
use cavern_types::EpochKey;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::engine::Engine;

/// Shortest period either timer runs at.
pub const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Cadence of the maintenance task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaintenanceSettings {
    /// Time between batched flushes.
    pub flush_interval: Duration,
    /// Time between rotation checks.
    pub rotation_check: Duration,
}

impl Default for MaintenanceSettings {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(1800),
            rotation_check: Duration::from_secs(60),
        }
    }
}

/// Handle to a running maintenance task.
#[derive(Debug)]
pub struct MaintenanceHandle {
    shutdown: Arc<Notify>,
    task: JoinHandle<()>,
}

impl MaintenanceHandle {
    /// Ask the task to stop, then wait for its final flush.
    ///
    /// # Errors
    ///
    /// Returns the [`tokio::task::JoinError`] if the task panicked.
    pub async fn shutdown(self) -> Result<(), tokio::task::JoinError> {
        self.shutdown.notify_one();
        self.task.await
    }
}

/// Spawn the maintenance task for `engine`.
pub fn spawn<D: DurableStore>(
    engine: Arc<Engine<D>>,
    settings: MaintenanceSettings,
    publisher: Option<DragonflyPool>,
) -> MaintenanceHandle {
    let shutdown = Arc::new(Notify::new());
    let task = tokio::spawn(run(engine, settings, publisher, Arc::clone(&shutdown)));
    MaintenanceHandle { shutdown, task }
}

async fn run<D: DurableStore>(
    engine: Arc<Engine<D>>,
    settings: MaintenanceSettings,
    publisher: Option<DragonflyPool>,
    shutdown: Arc<Notify>,
) {
    let mut flush_timer = timer(settings.flush_interval);
    let mut rotation_timer = timer(settings.rotation_check);

    tracing::info!(
        flush_secs = settings.flush_interval.as_secs(),
        rotation_secs = settings.rotation_check.as_secs(),
        publishing = publisher.is_some(),
        "Maintenance task started"
    );

    loop {
        tokio::select! {
            () = shutdown.notified() => {
                match engine.flush_now().await {
                    Ok(report) => {
                        tracing::info!(epoch = %report.epoch, "Final flush complete");
                        publish(&engine, publisher.as_ref()).await;
                    }
                    Err(e) => tracing::error!(error = %e, "Final flush failed"),
                }
                break;
            }
            _ = flush_timer.tick() => {
                match engine.flush_now().await {
                    Ok(_) => publish(&engine, publisher.as_ref()).await,
                    Err(e) => tracing::warn!(error = %e, "Scheduled flush failed, retrying next tick"),
                }
            }
            _ = rotation_timer.tick() => {
                match engine.rotate_if_due().await {
                    Ok(Some(details)) => {
                        tracing::info!(
                            previous = %details.previous,
                            current = %details.current,
                            "Scheduled rotation complete"
                        );
                        retire(publisher.as_ref(), details.previous).await;
                        publish(&engine, publisher.as_ref()).await;
                    }
                    Ok(None) => {}
                    Err(e) => tracing::warn!(error = %e, "Scheduled rotation failed, retrying next check"),
                }
            }
        }
    }

    tracing::info!("Maintenance task stopped");
}

/// An interval whose first tick is one period away. Periods below
/// [`MIN_PERIOD`] are raised to it; tokio rejects a zero period.
fn timer(period: Duration) -> Interval {
    let period = period.max(MIN_PERIOD);
    let now = Instant::now();
    let mut interval = tokio::time::interval_at(now.checked_add(period).unwrap_or(now), period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn retire(publisher: Option<&DragonflyPool>, epoch: EpochKey) {
    let Some(pool) = publisher else {
        return;
    };
    if let Err(e) = pool.retire_grid_view(epoch).await {
        tracing::warn!(%epoch, error = %e, "Failed to retire published grid view");
    }
}

async fn publish<D: DurableStore>(engine: &Engine<D>, publisher: Option<&DragonflyPool>) {
    let Some(pool) = publisher else {
        return;
    };
    let publication = engine.publication().await;
    if let Err(e) = pool
        .publish_grid(
            publication.epoch,
            &publication.view,
            publication.tokens.iter(),
        )
        .await
    {
        tracing::warn!(error = %e, "Failed to publish grid to Dragonfly");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use cavern_db::MemoryDurableStore;
    use cavern_types::{Coord, ItemType, UserId};
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::engine::EngineSettings;
    use crate::epoch::{Clock, ManualClock, NoReplay};

    async fn engine(
        store: &MemoryDurableStore,
        clock: Arc<ManualClock>,
    ) -> Arc<Engine<MemoryDurableStore>> {
        let clock: Arc<dyn Clock> = clock;
        let engine = Engine::open(
            store.clone(),
            EngineSettings::default(),
            clock,
            Arc::new(NoReplay),
        )
        .await
        .unwrap();
        Arc::new(engine)
    }

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 10, 14, 12, 0, 0).single().unwrap(),
        ))
    }

    #[tokio::test]
    async fn shutdown_performs_a_final_flush() {
        let store = MemoryDurableStore::new();
        let clock = clock();
        let engine = engine(&store, Arc::clone(&clock)).await;
        let handle = spawn(Arc::clone(&engine), MaintenanceSettings::default(), None);

        engine
            .report(UserId(1), Coord::new(1, 1), ItemType::Spider, clock.now())
            .await
            .unwrap();
        handle.shutdown().await.unwrap();

        let epoch = engine.active_epoch().await;
        assert_eq!(store.load_epoch(epoch).await.unwrap().observations.len(), 1);
    }

    #[tokio::test]
    async fn zero_periods_are_clamped_instead_of_panicking() {
        let store = MemoryDurableStore::new();
        let engine = engine(&store, clock()).await;
        let settings = MaintenanceSettings {
            flush_interval: Duration::ZERO,
            rotation_check: Duration::ZERO,
        };
        let handle = spawn(Arc::clone(&engine), settings, None);

        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.shutdown().await.unwrap();
        assert!(store.write_count().await > 0);
    }

    #[tokio::test]
    async fn interval_flush_and_rotation_run_without_traffic() {
        let store = MemoryDurableStore::new();
        let clock = clock();
        let engine = engine(&store, Arc::clone(&clock)).await;
        engine
            .report(UserId(1), Coord::new(1, 1), ItemType::Spider, clock.now())
            .await
            .unwrap();
        let first = engine.active_epoch().await;

        let settings = MaintenanceSettings {
            flush_interval: Duration::from_millis(20),
            rotation_check: Duration::from_millis(20),
        };
        let handle = spawn(Arc::clone(&engine), settings, None);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(store.load_epoch(first).await.unwrap().observations.len(), 1);

        clock.advance(chrono::TimeDelta::days(7));
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(store.epochs().await, vec![first, first.following()]);

        handle.shutdown().await.unwrap();
    }
}
