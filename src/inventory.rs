//! Inventory ledger: every stock mutation as an append-only signed delta.
//!
//! The mutable `products.stock` mirror answers "what can I sell right now";
//! this ledger answers "what happened", survives catalog resyncs, and is
//! what the resync merge uses to re-apply unacknowledged local changes.
//! Recorded deltas are post-clamp: the ledger matches what the mirror
//! actually did, not what was requested.

use chrono::Utc;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::catalog;
use crate::db::DbState;
use crate::error::{StorageError, SyncError, ValidationError};
use crate::queue::{self, Action, Domain};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    Sale,
    Adjustment,
    Restock,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Sale => "sale",
            TransactionKind::Adjustment => "adjustment",
            TransactionKind::Restock => "restock",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sale" => Some(TransactionKind::Sale),
            "adjustment" => Some(TransactionKind::Adjustment),
            "restock" => Some(TransactionKind::Restock),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryTransaction {
    pub id: String,
    pub product_id: String,
    #[serde(rename = "type")]
    pub kind: TransactionKind,
    /// Signed, post-clamp stock delta (negative for sales).
    pub quantity: i64,
    pub order_id: Option<String>,
    pub created_at: String,
    pub synced: bool,
}

type RawTxn = (String, String, String, i64, Option<String>, String, i64);

fn read_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawTxn> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn decode_transaction(raw: RawTxn) -> Result<InventoryTransaction, StorageError> {
    let (id, product_id, kind_raw, quantity, order_id, created_at, synced) = raw;
    let kind = TransactionKind::parse(&kind_raw).ok_or_else(|| {
        StorageError::Corrupted(format!("inventory transaction {id}: kind {kind_raw}"))
    })?;
    Ok(InventoryTransaction {
        id,
        product_id,
        kind,
        quantity,
        order_id,
        created_at,
        synced: synced != 0,
    })
}

// ---------------------------------------------------------------------------
// Ledger writes (transaction-scoped, shared with the order applier)
// ---------------------------------------------------------------------------

/// Clamp-apply a stock delta to the product mirror and append the matching
/// ledger row. Returns the transaction with the delta that actually landed.
/// Must run inside the caller's SQLite transaction.
pub(crate) fn apply_stock_delta_on(
    conn: &Connection,
    product_id: &str,
    kind: TransactionKind,
    requested_delta: i64,
    order_id: Option<&str>,
) -> Result<InventoryTransaction, SyncError> {
    let product = catalog::get_on(conn, product_id)?
        .ok_or_else(|| ValidationError::UnknownProduct(product_id.to_string()))?;

    let new_stock = (product.stock + requested_delta).max(0);
    let applied = new_stock - product.stock;

    conn.execute(
        "UPDATE products SET stock = ?1 WHERE id = ?2",
        params![new_stock, product_id],
    )
    .map_err(StorageError::from)?;

    let txn = InventoryTransaction {
        id: Uuid::new_v4().to_string(),
        product_id: product_id.to_string(),
        kind,
        quantity: applied,
        order_id: order_id.map(str::to_string),
        created_at: Utc::now().to_rfc3339(),
        synced: false,
    };

    conn.execute(
        "INSERT INTO inventory_transactions
            (id, product_id, transaction_type, quantity, order_id, created_at, synced)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)",
        params![
            txn.id,
            txn.product_id,
            txn.kind.as_str(),
            txn.quantity,
            txn.order_id,
            txn.created_at,
        ],
    )
    .map_err(StorageError::from)?;

    if applied != requested_delta {
        debug!(
            product_id,
            requested = requested_delta,
            applied,
            "stock delta clamped at zero"
        );
    }

    Ok(txn)
}

// ---------------------------------------------------------------------------
// Standalone stock operations
// ---------------------------------------------------------------------------

/// Manual stock adjustment (e.g. shrinkage, cycle count correction).
/// Mirror update, ledger append, and queue entry commit as one unit.
pub fn adjust_stock(
    db: &DbState,
    product_id: &str,
    delta: i64,
    max_retries: i64,
) -> Result<InventoryTransaction, SyncError> {
    if delta == 0 {
        return Err(ValidationError::ZeroDelta.into());
    }

    let mut conn = db.lock()?;
    let tx = conn.transaction().map_err(StorageError::from)?;

    let txn = apply_stock_delta_on(&tx, product_id, TransactionKind::Adjustment, delta, None)?;
    let payload = serde_json::to_value(&txn)
        .map_err(|e| StorageError::Corrupted(format!("serialize inventory txn: {e}")))?;
    queue::insert_item(&tx, Domain::Inventory, Action::Create, &payload, max_retries)?;

    tx.commit().map_err(StorageError::from)?;
    Ok(txn)
}

/// Goods-in: add received stock to the mirror and ledger.
pub fn restock(
    db: &DbState,
    product_id: &str,
    quantity: i64,
    max_retries: i64,
) -> Result<InventoryTransaction, SyncError> {
    if quantity <= 0 {
        return Err(ValidationError::ZeroDelta.into());
    }

    let mut conn = db.lock()?;
    let tx = conn.transaction().map_err(StorageError::from)?;

    let txn = apply_stock_delta_on(&tx, product_id, TransactionKind::Restock, quantity, None)?;
    let payload = serde_json::to_value(&txn)
        .map_err(|e| StorageError::Corrupted(format!("serialize inventory txn: {e}")))?;
    queue::insert_item(&tx, Domain::Inventory, Action::Create, &payload, max_retries)?;

    tx.commit().map_err(StorageError::from)?;
    Ok(txn)
}

// ---------------------------------------------------------------------------
// Reads and sync bookkeeping
// ---------------------------------------------------------------------------

const TXN_COLUMNS: &str = "id, product_id, transaction_type, quantity, order_id, created_at, synced";

/// Full ledger history for one product, oldest first.
pub fn history(db: &DbState, product_id: &str) -> Result<Vec<InventoryTransaction>, SyncError> {
    let conn = db.lock()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {TXN_COLUMNS} FROM inventory_transactions
         WHERE product_id = ?1
         ORDER BY created_at ASC, rowid ASC"
    ))?;
    let raws: Vec<RawTxn> = stmt
        .query_map(params![product_id], read_raw)?
        .collect::<rusqlite::Result<_>>()
        .map_err(StorageError::from)?;
    raws.into_iter()
        .map(|raw| decode_transaction(raw).map_err(SyncError::from))
        .collect()
}

/// Ledger rows the remote has not acknowledged yet.
pub fn unsynced_count(db: &DbState) -> Result<i64, SyncError> {
    let conn = db.lock()?;
    let count = conn.query_row(
        "SELECT COUNT(*) FROM inventory_transactions WHERE synced = 0",
        [],
        |row| row.get(0),
    )?;
    Ok(count)
}

/// Mark one ledger row acknowledged (its queue item completed).
pub fn mark_transaction_synced(db: &DbState, txn_id: &str) -> Result<(), SyncError> {
    let conn = db.lock()?;
    conn.execute(
        "UPDATE inventory_transactions SET synced = 1 WHERE id = ?1",
        params![txn_id],
    )
    .map_err(StorageError::from)?;
    Ok(())
}

/// Mark every ledger row belonging to an order acknowledged. Called when
/// the order's queue item completes — the remote received the sale, so its
/// stock effects are no longer "local only".
pub fn mark_order_transactions_synced(db: &DbState, order_id: &str) -> Result<usize, SyncError> {
    let conn = db.lock()?;
    let updated = conn
        .execute(
            "UPDATE inventory_transactions SET synced = 1 WHERE order_id = ?1",
            params![order_id],
        )
        .map_err(StorageError::from)?;
    Ok(updated)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{self, Product};
    use crate::db;
    use crate::queue::Status;
    use rusqlite::Connection;

    fn test_db() -> DbState {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        db::run_migrations_for_test(&conn);
        DbState {
            conn: std::sync::Mutex::new(conn),
            db_path: std::path::PathBuf::from(":memory:"),
        }
    }

    fn seed_product(db: &DbState, id: &str, stock: i64) {
        catalog::upsert_product(
            db,
            &Product {
                id: id.to_string(),
                name: format!("Product {id}"),
                price: 3.0,
                stock,
                min_stock: 0,
                barcode: None,
                sku: None,
                category: "grocery".to_string(),
                last_synced_at: None,
            },
        )
        .unwrap();
    }

    #[test]
    fn test_adjust_stock_applies_delta_and_enqueues() {
        let db = test_db();
        seed_product(&db, "p1", 10);

        let txn = adjust_stock(&db, "p1", -4, 3).unwrap();
        assert_eq!(txn.quantity, -4);
        assert_eq!(txn.kind, TransactionKind::Adjustment);

        let product = catalog::get_product(&db, "p1").unwrap().unwrap();
        assert_eq!(product.stock, 6);

        let eligible = queue::eligible_for_drain(&db).unwrap();
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].domain, Domain::Inventory);
        assert_eq!(eligible[0].entity_id, txn.id);
        assert_eq!(eligible[0].status, Status::Pending);
    }

    #[test]
    fn test_adjust_stock_clamps_and_records_applied_delta() {
        let db = test_db();
        seed_product(&db, "p1", 3);

        let txn = adjust_stock(&db, "p1", -10, 3).unwrap();
        assert_eq!(txn.quantity, -3, "ledger records the applied delta");

        let product = catalog::get_product(&db, "p1").unwrap().unwrap();
        assert_eq!(product.stock, 0);
    }

    #[test]
    fn test_adjust_stock_rejects_unknown_product_and_zero_delta() {
        let db = test_db();
        seed_product(&db, "p1", 3);

        let err = adjust_stock(&db, "ghost", -1, 3).unwrap_err();
        assert!(matches!(
            err,
            SyncError::Validation(ValidationError::UnknownProduct(_))
        ));

        let err = adjust_stock(&db, "p1", 0, 3).unwrap_err();
        assert!(matches!(
            err,
            SyncError::Validation(ValidationError::ZeroDelta)
        ));

        // Neither attempt left a ledger row or queue item behind
        assert_eq!(history(&db, "p1").unwrap().len(), 0);
        assert_eq!(queue::pending_count(&db).unwrap(), 0);
    }

    #[test]
    fn test_restock_increases_stock() {
        let db = test_db();
        seed_product(&db, "p1", 2);

        let txn = restock(&db, "p1", 12, 3).unwrap();
        assert_eq!(txn.kind, TransactionKind::Restock);
        assert_eq!(txn.quantity, 12);

        let product = catalog::get_product(&db, "p1").unwrap().unwrap();
        assert_eq!(product.stock, 14);
    }

    #[test]
    fn test_history_in_order_and_sync_marking() {
        let db = test_db();
        seed_product(&db, "p1", 20);

        let first = adjust_stock(&db, "p1", -5, 3).unwrap();
        let second = restock(&db, "p1", 3, 3).unwrap();

        let rows = history(&db, "p1").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id, first.id);
        assert_eq!(rows[1].id, second.id);
        assert!(!rows[0].synced);

        assert_eq!(unsynced_count(&db).unwrap(), 2);
        mark_transaction_synced(&db, &first.id).unwrap();
        assert_eq!(unsynced_count(&db).unwrap(), 1);
    }
}
