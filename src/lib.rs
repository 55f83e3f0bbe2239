//! Tillsync — offline-first synchronization engine for retail POS terminals.
//!
//! A terminal must keep selling, scanning, and adjusting stock with zero
//! network connectivity, then reconcile with the remote system-of-record
//! once connectivity returns. This crate provides the engine behind that:
//! a durable local mutation ledger ([`queue`]), SQLite-backed mirrors of
//! catalog/customer/inventory state ([`db`], [`catalog`], [`customers`],
//! [`inventory`]), and a connectivity-aware drainer ([`drainer`]) that
//! replays queued mutations against a remote authority with bounded
//! retries, FIFO ordering, and per-item failure containment.
//!
//! [`engine::SyncEngine`] is the composition root most callers want.

use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod catalog;
pub mod config;
pub mod connectivity;
pub mod credentials;
pub mod customers;
pub mod db;
pub mod drainer;
pub mod engine;
pub mod error;
pub mod inventory;
pub mod orders;
pub mod queue;
pub mod remote;

pub use config::EngineConfig;
pub use engine::{ResyncSummary, SyncEngine};
pub use error::{NetworkError, StorageError, SyncError, ValidationError};

/// Initialize structured logging: console layer always, plus a daily
/// rolling file appender when `log_dir` is given. Call once at startup.
pub fn init_tracing(log_dir: Option<&std::path::Path>) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,tillsync=debug"));

    let console_layer = fmt::layer().with_target(true);
    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer);

    match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).ok();
            let file_appender = tracing_appender::rolling::daily(dir, "tillsync");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let file_layer = fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true);
            registry.with(file_layer).init();
            // Keep the guard alive for the lifetime of the process —
            // dropping it flushes logs.
            std::mem::forget(guard);
        }
        None => registry.init(),
    }

    info!("tillsync v{} logging initialized", env!("CARGO_PKG_VERSION"));
}
