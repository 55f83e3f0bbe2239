//! Connectivity-aware drainer: replays the sync queue against the remote
//! authority, opportunistically and periodically.
//!
//! Triggers are (a) an offline -> online transition, (b) an interval timer
//! while online, (c) an explicit "sync now". Overlapping triggers coalesce:
//! at most one cycle runs at a time. Within a cycle items are replayed in
//! enqueue order under a bounded per-item timeout; one item's failure never
//! aborts its siblings, and going offline mid-cycle lets the in-flight call
//! finish but prevents further items from starting.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::catalog;
use crate::config::EngineConfig;
use crate::connectivity::{Clock, ConnectivityMonitor, ConnectivityProbe};
use crate::customers;
use crate::db::{self, DbState};
use crate::error::{NetworkError, SyncError};
use crate::inventory;
use crate::orders;
use crate::queue::{self, Domain, QueueItem, Status};
use crate::remote::RemoteAuthority;

/// The subset of engine configuration the drainer needs.
#[derive(Debug, Clone, Copy)]
pub struct DrainerConfig {
    pub drain_interval_secs: u64,
    pub item_timeout_secs: u64,
    pub completed_retention_hours: i64,
}

impl From<&EngineConfig> for DrainerConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            drain_interval_secs: config.drain_interval_secs,
            item_timeout_secs: config.item_timeout_secs,
            completed_retention_hours: config.completed_retention_hours,
        }
    }
}

/// Outcome of one drain cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleStats {
    /// Items offered to the remote this cycle.
    pub attempted: usize,
    pub completed: usize,
    pub failed: usize,
    /// Completed items removed by the retention sweep.
    pub purged: usize,
}

pub struct Drainer {
    db: Arc<DbState>,
    remote: Arc<dyn RemoteAuthority>,
    monitor: Arc<ConnectivityMonitor>,
    clock: Arc<dyn Clock>,
    config: DrainerConfig,
    cycle_running: AtomicBool,
    loop_running: Arc<AtomicBool>,
    last_sync: Mutex<Option<String>>,
}

impl Drainer {
    pub fn new(
        db: Arc<DbState>,
        remote: Arc<dyn RemoteAuthority>,
        monitor: Arc<ConnectivityMonitor>,
        clock: Arc<dyn Clock>,
        config: DrainerConfig,
    ) -> Self {
        Self {
            db,
            remote,
            monitor,
            clock,
            config,
            cycle_running: AtomicBool::new(false),
            loop_running: Arc::new(AtomicBool::new(false)),
            last_sync: Mutex::new(None),
        }
    }

    /// Run one drain cycle. Returns `None` when a cycle was already in
    /// flight — overlapping triggers are a no-op, not an error.
    pub async fn run_cycle(&self) -> Result<Option<CycleStats>, SyncError> {
        if self
            .cycle_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("drain cycle already running; trigger coalesced");
            return Ok(None);
        }

        let result = self.run_cycle_inner().await;
        self.cycle_running.store(false, Ordering::SeqCst);
        result.map(Some)
    }

    async fn run_cycle_inner(&self) -> Result<CycleStats, SyncError> {
        let mut stats = CycleStats::default();
        let candidates = queue::eligible_for_drain(&self.db)?;

        for item in &candidates {
            // Going offline mid-cycle: let the in-flight call finish, but
            // start nothing new.
            if !self.monitor.is_online() {
                info!(
                    remaining = candidates.len() - stats.attempted,
                    "went offline mid-cycle; deferring remaining items"
                );
                break;
            }

            queue::transition(&self.db, &item.id, Status::Processing, None)?;
            stats.attempted += 1;

            let outcome = self.submit_with_timeout(item).await;
            match outcome {
                Ok(()) => {
                    queue::transition(&self.db, &item.id, Status::Completed, None)?;
                    self.on_item_completed(item)?;
                    stats.completed += 1;
                }
                Err(err) => {
                    let message = err.to_string();
                    let updated =
                        queue::transition(&self.db, &item.id, Status::Failed, Some(&message))?;
                    self.on_item_failed(&updated, &message)?;
                    stats.failed += 1;
                    if updated.is_dead_letter() {
                        warn!(
                            queue_id = %item.id,
                            domain = item.domain.as_str(),
                            error = %message,
                            "queue item exhausted retries; dead-lettered"
                        );
                    } else {
                        debug!(queue_id = %item.id, error = %message, "queue item failed; will retry");
                    }
                }
            }
        }

        stats.purged =
            queue::purge_completed(&self.db, self.config.completed_retention_hours, self.clock.now())?;

        if stats.attempted > 0 || stats.purged > 0 {
            debug!(
                attempted = stats.attempted,
                completed = stats.completed,
                failed = stats.failed,
                purged = stats.purged,
                "drain cycle finished"
            );
        }

        self.record_last_sync()?;
        Ok(stats)
    }

    /// One remote call, bounded so a stalled request cannot stall the rest
    /// of the cycle.
    async fn submit_with_timeout(&self, item: &QueueItem) -> Result<(), NetworkError> {
        let budget = Duration::from_secs(self.config.item_timeout_secs);
        match tokio::time::timeout(budget, self.remote.submit(item)).await {
            Ok(result) => result,
            Err(_) => Err(NetworkError::Timeout {
                url: "remote authority".to_string(),
            }),
        }
    }

    /// Propagate an acknowledgment to the domain record behind the item.
    fn on_item_completed(&self, item: &QueueItem) -> Result<(), SyncError> {
        match item.domain {
            Domain::Order => orders::mark_order_synced(&self.db, &item.entity_id),
            Domain::Inventory => inventory::mark_transaction_synced(&self.db, &item.entity_id),
            Domain::Product => catalog::touch_synced(&self.db, &item.entity_id),
            Domain::Customer => customers::touch_synced(&self.db, &item.entity_id),
        }
    }

    /// Record a failed attempt on the domain record behind the item.
    fn on_item_failed(&self, updated: &QueueItem, error: &str) -> Result<(), SyncError> {
        if updated.domain == Domain::Order {
            orders::record_sync_failure(
                &self.db,
                &updated.entity_id,
                error,
                updated.is_dead_letter(),
            )?;
        }
        Ok(())
    }

    fn record_last_sync(&self) -> Result<(), SyncError> {
        let now = self.clock.now().to_rfc3339();
        {
            let conn = self.db.lock()?;
            db::set_setting(&conn, "sync", "last_sync_at", &now)?;
        }
        if let Ok(mut guard) = self.last_sync.lock() {
            *guard = Some(now);
        }
        Ok(())
    }

    /// Timestamp of the last completed drain cycle, surviving restarts via
    /// `local_settings`.
    pub fn last_sync_time(&self) -> Result<Option<String>, SyncError> {
        if let Ok(guard) = self.last_sync.lock() {
            if guard.is_some() {
                return Ok(guard.clone());
            }
        }
        let conn = self.db.lock()?;
        Ok(db::get_setting(&conn, "sync", "last_sync_at"))
    }

    /// Start the background loop: wake on the interval timer or on a
    /// connectivity transition, refresh the monitor from the probe, and
    /// drain while online.
    pub fn start(
        drainer: Arc<Self>,
        probe: Arc<dyn ConnectivityProbe>,
    ) -> tokio::task::JoinHandle<()> {
        drainer.loop_running.store(true, Ordering::SeqCst);

        tokio::spawn(async move {
            info!(
                interval_secs = drainer.config.drain_interval_secs,
                "sync loop started"
            );
            let mut notifications = drainer.monitor.subscribe();

            loop {
                if !drainer.loop_running.load(Ordering::SeqCst) {
                    info!("sync loop stopped");
                    break;
                }

                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(
                        drainer.config.drain_interval_secs,
                    )) => {}
                    changed = notifications.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }

                if !drainer.loop_running.load(Ordering::SeqCst) {
                    info!("sync loop stopped");
                    break;
                }

                let online = probe.check_online().await;
                drainer.monitor.set_online(online);
                if !online {
                    continue;
                }

                match drainer.run_cycle().await {
                    Ok(Some(stats)) if stats.completed > 0 || stats.failed > 0 => {
                        info!(
                            completed = stats.completed,
                            failed = stats.failed,
                            "drain cycle complete"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "drain cycle failed"),
                }
            }
        })
    }

    /// Stop the background loop after its current wake-up.
    pub fn stop(&self) {
        self.loop_running.store(false, Ordering::SeqCst);
    }

    #[cfg(test)]
    fn force_cycle_running_for_test(&self, running: bool) {
        self.cycle_running.store(running, Ordering::SeqCst);
    }
}

// ===========================================================================
// Tests
// ===========================================================================
