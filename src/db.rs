//! Local SQLite database layer for the sync engine.
//!
//! Uses rusqlite with WAL mode. Provides schema migrations, settings
//! helpers, and the shared connection state used by every other module.
//! The connection mutex plus SQLite transactions are the only mutual
//! exclusion in the engine; no higher-level component adds its own locks.

use rusqlite::{params, Connection};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, info, warn};

use crate::error::StorageError;

/// Shared state holding the database connection.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

impl DbState {
    /// Lock the connection, mapping a poisoned mutex to a storage error.
    pub fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StorageError> {
        self.conn.lock().map_err(|_| StorageError::Poisoned)
    }
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 4;

/// Initialize the database at `{data_dir}/tillsync.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas,
/// and runs any pending migrations. On corruption or open failure,
/// deletes the file and retries once.
pub fn init(data_dir: &Path) -> Result<DbState, StorageError> {
    fs::create_dir_all(data_dir)
        .map_err(|e| StorageError::Migration(format!("create data dir: {e}")))?;

    let db_path = data_dir.join("tillsync.db");
    info!("Opening database at {}", db_path.display());

    let conn = match open_and_configure(&db_path) {
        Ok(c) => c,
        Err(first_err) => {
            warn!(
                "Database open failed ({}), deleting and retrying once",
                first_err
            );
            if db_path.exists() {
                let _ = fs::remove_file(&db_path);
                // Also remove WAL/SHM files if present
                let wal = db_path.with_extension("db-wal");
                let shm = db_path.with_extension("db-shm");
                let _ = fs::remove_file(&wal);
                let _ = fs::remove_file(&shm);
            }
            open_and_configure(&db_path).map_err(|e| {
                StorageError::Migration(format!("database open failed after retry: {e}"))
            })?
        }
    };

    run_migrations(&conn)?;

    info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> Result<Connection, StorageError> {
    let conn = Connection::open(path)?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;

    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
///
/// Idempotent: calling at the latest version is a no-op.
fn run_migrations(conn: &Connection) -> Result<(), StorageError> {
    // Ensure schema_version table exists first
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| StorageError::Migration(format!("create schema_version: {e}")))?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }
    if current < 3 {
        migrate_v3(conn)?;
    }
    if current < 4 {
        migrate_v4(conn)?;
    }

    Ok(())
}

/// Migration v1: settings, mirrors, orders, and the sync queue.
fn migrate_v1(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(
        "
        -- local_settings (category/key/value store)
        CREATE TABLE IF NOT EXISTS local_settings (
            id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now')),
            UNIQUE(setting_category, setting_key)
        );

        -- products (catalog mirror; stock can never go negative)
        CREATE TABLE IF NOT EXISTS products (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            price REAL NOT NULL DEFAULT 0,
            stock INTEGER NOT NULL DEFAULT 0 CHECK (stock >= 0),
            barcode TEXT,
            sku TEXT,
            category TEXT NOT NULL DEFAULT '',
            last_synced_at TEXT
        );

        -- customers (mirror)
        CREATE TABLE IF NOT EXISTS customers (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            phone TEXT,
            email TEXT,
            loyalty_points INTEGER NOT NULL DEFAULT 0,
            loyalty_tier TEXT NOT NULL DEFAULT 'bronze',
            total_spent REAL NOT NULL DEFAULT 0,
            last_synced_at TEXT
        );

        -- orders (offline sales)
        CREATE TABLE IF NOT EXISTS orders (
            id TEXT PRIMARY KEY,
            order_number TEXT,
            customer_id TEXT,
            cashier_id TEXT,
            line_items TEXT NOT NULL DEFAULT '[]',
            subtotal REAL NOT NULL DEFAULT 0,
            discount_amount REAL NOT NULL DEFAULT 0,
            tax_amount REAL NOT NULL DEFAULT 0,
            excise_amount REAL NOT NULL DEFAULT 0,
            total_amount REAL NOT NULL DEFAULT 0,
            payment_method TEXT,
            payment_data TEXT NOT NULL DEFAULT '{}',
            loyalty_points_earned INTEGER NOT NULL DEFAULT 0,
            loyalty_points_redeemed INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'synced', 'failed')),
            sync_error TEXT,
            sync_retry_count INTEGER NOT NULL DEFAULT 0,
            last_sync_attempt TEXT,
            created_at TEXT NOT NULL,
            synced_at TEXT
        );

        -- sync_queue (durable mutation ledger; id is the client-generated
        -- UUID and doubles as the remote idempotency key)
        CREATE TABLE IF NOT EXISTS sync_queue (
            id TEXT PRIMARY KEY,
            entity_type TEXT NOT NULL
                CHECK (entity_type IN ('order', 'customer', 'product', 'inventory')),
            entity_id TEXT NOT NULL,
            operation TEXT NOT NULL
                CHECK (operation IN ('create', 'update', 'delete')),
            payload TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'processing', 'completed', 'failed')),
            retry_count INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL DEFAULT 3,
            last_error TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        -- Indexes
        CREATE INDEX IF NOT EXISTS idx_orders_status ON orders(status);
        CREATE INDEX IF NOT EXISTS idx_orders_created_at ON orders(created_at);
        CREATE INDEX IF NOT EXISTS idx_sync_queue_status ON sync_queue(status);
        CREATE INDEX IF NOT EXISTS idx_sync_queue_entity ON sync_queue(entity_type, entity_id);
        CREATE INDEX IF NOT EXISTS idx_local_settings_cat_key ON local_settings(setting_category, setting_key);

        -- Record migration
        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| {
        error!("Migration v1 failed: {e}");
        StorageError::Migration(format!("migration v1: {e}"))
    })?;

    info!("Applied migration v1");
    Ok(())
}

/// Migration v2: append-only inventory ledger.
///
/// Every stock mutation is recorded both as a mirror update and as a signed
/// delta here, so the history survives catalog resyncs.
fn migrate_v2(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS inventory_transactions (
            id TEXT PRIMARY KEY,
            product_id TEXT NOT NULL,
            transaction_type TEXT NOT NULL
                CHECK (transaction_type IN ('sale', 'adjustment', 'restock')),
            quantity INTEGER NOT NULL,
            order_id TEXT,
            created_at TEXT NOT NULL,
            synced INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_inventory_txn_product
            ON inventory_transactions(product_id);
        CREATE INDEX IF NOT EXISTS idx_inventory_txn_synced
            ON inventory_transactions(synced);
        CREATE INDEX IF NOT EXISTS idx_inventory_txn_order
            ON inventory_transactions(order_id);

        -- Record migration
        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
    .map_err(|e| {
        error!("Migration v2 failed: {e}");
        StorageError::Migration(format!("migration v2: {e}"))
    })?;

    info!("Applied migration v2 (inventory ledger)");
    Ok(())
}

/// Migration v3: low-stock threshold and lookup indexes on the catalog.
fn migrate_v3(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(
        "
        ALTER TABLE products ADD COLUMN min_stock INTEGER NOT NULL DEFAULT 0;

        CREATE UNIQUE INDEX IF NOT EXISTS idx_products_barcode
            ON products(barcode) WHERE barcode IS NOT NULL;
        CREATE UNIQUE INDEX IF NOT EXISTS idx_products_sku
            ON products(sku) WHERE sku IS NOT NULL;
        CREATE INDEX IF NOT EXISTS idx_customers_phone
            ON customers(phone) WHERE phone IS NOT NULL;

        -- Record migration
        INSERT INTO schema_version (version) VALUES (3);
        ",
    )
    .map_err(|e| {
        error!("Migration v3 failed: {e}");
        StorageError::Migration(format!("migration v3: {e}"))
    })?;

    info!("Applied migration v3 (min_stock + lookup indexes)");
    Ok(())
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool, StorageError> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .map_err(|e| StorageError::Migration(format!("table_info {table}: {e}")))?;
    let mut rows = stmt
        .query([])
        .map_err(|e| StorageError::Migration(format!("table_info query: {e}")))?;
    while let Some(row) = rows
        .next()
        .map_err(|e| StorageError::Migration(format!("table_info next: {e}")))?
    {
        let name: String = row
            .get(1)
            .map_err(|e| StorageError::Migration(format!("table_info name: {e}")))?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Migration v4: retention bookkeeping on the sync queue.
///
/// Adds `completed_at` so the retention sweep can purge completed items a
/// fixed window after acknowledgment instead of immediately.
fn migrate_v4(conn: &Connection) -> Result<(), StorageError> {
    if !column_exists(conn, "sync_queue", "completed_at")? {
        conn.execute_batch("ALTER TABLE sync_queue ADD COLUMN completed_at TEXT;")
            .map_err(|e| StorageError::Migration(format!("migration v4 add completed_at: {e}")))?;
    }

    conn.execute_batch(
        "
        CREATE INDEX IF NOT EXISTS idx_sync_queue_completed_at
            ON sync_queue(status, completed_at);

        INSERT INTO schema_version (version) VALUES (4);
        ",
    )
    .map_err(|e| {
        error!("Migration v4 failed: {e}");
        StorageError::Migration(format!("migration v4: {e}"))
    })?;

    info!("Applied migration v4 (sync queue retention bookkeeping)");
    Ok(())
}

// ---------------------------------------------------------------------------
// Settings helpers
// ---------------------------------------------------------------------------

/// Get a single setting value.
pub fn get_setting(conn: &Connection, category: &str, key: &str) -> Option<String> {
    conn.query_row(
        "SELECT setting_value FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
        |row| row.get(0),
    )
    .ok()
}

/// Insert or update a setting.
pub fn set_setting(
    conn: &Connection,
    category: &str,
    key: &str,
    value: &str,
) -> Result<(), StorageError> {
    conn.execute(
        "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(setting_category, setting_key) DO UPDATE SET
            setting_value = excluded.setting_value,
            updated_at = excluded.updated_at",
        params![category, key, value],
    )?;
    Ok(())
}

/// Run all migrations on the given connection (test helper, not public API).
#[cfg(test)]
pub fn run_migrations_for_test(conn: &Connection) {
    run_migrations(conn).expect("run_migrations should succeed in test");
}

// ===========================================================================
// Tests
// ===========================================================================
