//! Engine facade: wires the store, queue, monitor, and drainer together
//! and exposes the contract the presentation layer consumes — action calls
//! that trigger enqueues, and read-only queries for sync-health indicators.

use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use crate::catalog::{self, Product};
use crate::config::EngineConfig;
use crate::connectivity::{Clock, ConnectivityMonitor, ConnectivityProbe, SystemClock};
use crate::customers::{self, Customer};
use crate::db::{self, DbState};
use crate::drainer::{CycleStats, Drainer, DrainerConfig};
use crate::error::{NetworkError, SyncError};
use crate::inventory::{self, InventoryTransaction};
use crate::orders::{self, Order, OrderDraft};
use crate::queue::{self, QueueItem, StatusSummary};
use crate::remote::RemoteAuthority;

/// Outcome of a full mirror resync.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ResyncSummary {
    pub products: usize,
    pub customers: usize,
}

pub struct SyncEngine {
    db: Arc<DbState>,
    config: EngineConfig,
    monitor: Arc<ConnectivityMonitor>,
    drainer: Arc<Drainer>,
    probe: Arc<dyn ConnectivityProbe>,
    remote: Arc<dyn RemoteAuthority>,
}

impl SyncEngine {
    /// Open the local store, recover any in-flight queue items from a
    /// previous run, and assemble the engine. Nothing touches the network
    /// until [`start`](Self::start) or [`sync_now`](Self::sync_now).
    pub fn new(
        config: EngineConfig,
        remote: Arc<dyn RemoteAuthority>,
        probe: Arc<dyn ConnectivityProbe>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, SyncError> {
        let db = Arc::new(db::init(&config.data_dir)?);

        let recovered = queue::recover_stale_processing(&db)?;
        if recovered > 0 {
            info!(recovered, "requeued items stranded by previous shutdown");
        }

        // Terminals start pessimistic: offline until the first probe says
        // otherwise.
        let monitor = Arc::new(ConnectivityMonitor::new(false));
        let drainer = Arc::new(Drainer::new(
            Arc::clone(&db),
            Arc::clone(&remote),
            Arc::clone(&monitor),
            clock,
            DrainerConfig::from(&config),
        ));

        Ok(Self {
            db,
            config,
            monitor,
            drainer,
            probe,
            remote,
        })
    }

    /// [`new`](Self::new) with the system clock.
    pub fn with_system_clock(
        config: EngineConfig,
        remote: Arc<dyn RemoteAuthority>,
        probe: Arc<dyn ConnectivityProbe>,
    ) -> Result<Self, SyncError> {
        Self::new(config, remote, probe, Arc::new(SystemClock))
    }

    /// Start the background sync loop.
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        Drainer::start(Arc::clone(&self.drainer), Arc::clone(&self.probe))
    }

    /// Stop the background sync loop after its current wake-up.
    pub fn stop(&self) {
        self.drainer.stop();
    }

    pub fn db(&self) -> &Arc<DbState> {
        &self.db
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn monitor(&self) -> &Arc<ConnectivityMonitor> {
        &self.monitor
    }

    // -----------------------------------------------------------------
    // Mutations (the offline write path)
    // -----------------------------------------------------------------

    /// Record a sale: durable order + stock decrements + ledger rows +
    /// loyalty update + queue entry, all in one transaction.
    pub fn record_sale(&self, draft: &OrderDraft) -> Result<Order, SyncError> {
        orders::apply_order(&self.db, &self.config, draft)
    }

    /// Manual stock adjustment (shrinkage, cycle count).
    pub fn adjust_stock(
        &self,
        product_id: &str,
        delta: i64,
    ) -> Result<InventoryTransaction, SyncError> {
        inventory::adjust_stock(&self.db, product_id, delta, self.config.max_retries)
    }

    /// Goods-in.
    pub fn restock(
        &self,
        product_id: &str,
        quantity: i64,
    ) -> Result<InventoryTransaction, SyncError> {
        inventory::restock(&self.db, product_id, quantity, self.config.max_retries)
    }

    // -----------------------------------------------------------------
    // Sync control
    // -----------------------------------------------------------------

    /// Explicit "sync now": probe connectivity, then drain. Fails fast with
    /// [`NetworkError::Offline`] when the remote is unreachable. Returns
    /// `None` when a cycle was already running.
    pub async fn sync_now(&self) -> Result<Option<CycleStats>, SyncError> {
        let online = self.probe.check_online().await;
        self.monitor.set_online(online);
        if !online {
            return Err(NetworkError::Offline.into());
        }
        self.drainer.run_cycle().await
    }

    /// Full mirror resync: fetch the authoritative catalog and customer
    /// list and replace the local mirrors, preserving unacknowledged local
    /// deltas.
    pub async fn run_full_resync(&self) -> Result<ResyncSummary, SyncError> {
        let products: Vec<Product> = self.remote.fetch_catalog().await?;
        let customers_snapshot: Vec<Customer> = self.remote.fetch_customers().await?;

        let summary = ResyncSummary {
            products: catalog::replace_catalog(&self.db, &products)?,
            customers: customers::replace_customers(&self.db, &customers_snapshot)?,
        };

        {
            let conn = self.db.lock()?;
            db::set_setting(
                &conn,
                "sync",
                "last_full_resync_at",
                &chrono::Utc::now().to_rfc3339(),
            )?;
        }

        info!(
            products = summary.products,
            customers = summary.customers,
            "full mirror resync complete"
        );
        Ok(summary)
    }

    // -----------------------------------------------------------------
    // Read-only queries for sync-health indicators
    // -----------------------------------------------------------------

    /// Queue items still awaiting remote acknowledgment.
    pub fn pending_count(&self) -> Result<i64, SyncError> {
        queue::pending_count(&self.db)
    }

    /// Timestamp of the last completed drain cycle.
    pub fn last_sync_time(&self) -> Result<Option<String>, SyncError> {
        self.drainer.last_sync_time()
    }

    /// Per-status queue counts.
    pub fn queue_status_summary(&self) -> Result<StatusSummary, SyncError> {
        queue::status_summary(&self.db)
    }

    /// Items that exhausted their retry budget, for operator review.
    pub fn dead_letters(&self) -> Result<Vec<QueueItem>, SyncError> {
        queue::dead_letters(&self.db)
    }

    pub fn is_online(&self) -> bool {
        self.monitor.is_online()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
