//! Catalog mirror: the local, possibly stale, copy of the remote product
//! catalog used for offline reads and optimistic stock decrements.
//!
//! A full resync replaces the table wholesale, but any stock delta from
//! inventory transactions the remote has not yet acknowledged is re-applied
//! on top of the incoming snapshot, so an unsynced offline sale is never
//! silently undone by a resync.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::info;

use crate::db::DbState;
use crate::error::{StorageError, SyncError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    pub name: String,
    pub price: f64,
    pub stock: i64,
    #[serde(default)]
    pub min_stock: i64,
    #[serde(default)]
    pub barcode: Option<String>,
    #[serde(default)]
    pub sku: Option<String>,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub last_synced_at: Option<String>,
}

const PRODUCT_COLUMNS: &str =
    "id, name, price, stock, min_stock, barcode, sku, category, last_synced_at";

fn read_product(row: &rusqlite::Row<'_>) -> rusqlite::Result<Product> {
    Ok(Product {
        id: row.get(0)?,
        name: row.get(1)?,
        price: row.get(2)?,
        stock: row.get(3)?,
        min_stock: row.get(4)?,
        barcode: row.get(5)?,
        sku: row.get(6)?,
        category: row.get(7)?,
        last_synced_at: row.get(8)?,
    })
}

// ---------------------------------------------------------------------------
// Reads
// ---------------------------------------------------------------------------

pub(crate) fn get_on(conn: &Connection, id: &str) -> Result<Option<Product>, StorageError> {
    let product = conn
        .query_row(
            &format!("SELECT {PRODUCT_COLUMNS} FROM products WHERE id = ?1"),
            params![id],
            read_product,
        )
        .optional()?;
    Ok(product)
}

pub fn get_product(db: &DbState, id: &str) -> Result<Option<Product>, SyncError> {
    let conn = db.lock()?;
    Ok(get_on(&conn, id)?)
}

pub fn get_all_products(db: &DbState) -> Result<Vec<Product>, SyncError> {
    let conn = db.lock()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {PRODUCT_COLUMNS} FROM products ORDER BY name ASC"
    ))?;
    let products = stmt
        .query_map([], read_product)?
        .collect::<rusqlite::Result<_>>()
        .map_err(StorageError::from)?;
    Ok(products)
}

/// Barcode lookup for the scanner path.
pub fn find_by_barcode(db: &DbState, barcode: &str) -> Result<Option<Product>, SyncError> {
    let conn = db.lock()?;
    let product = conn
        .query_row(
            &format!("SELECT {PRODUCT_COLUMNS} FROM products WHERE barcode = ?1"),
            params![barcode],
            read_product,
        )
        .optional()
        .map_err(StorageError::from)?;
    Ok(product)
}

pub fn find_by_sku(db: &DbState, sku: &str) -> Result<Option<Product>, SyncError> {
    let conn = db.lock()?;
    let product = conn
        .query_row(
            &format!("SELECT {PRODUCT_COLUMNS} FROM products WHERE sku = ?1"),
            params![sku],
            read_product,
        )
        .optional()
        .map_err(StorageError::from)?;
    Ok(product)
}

/// Products at or below their low-stock threshold.
pub fn low_stock_products(db: &DbState) -> Result<Vec<Product>, SyncError> {
    let conn = db.lock()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {PRODUCT_COLUMNS} FROM products
         WHERE min_stock > 0 AND stock <= min_stock
         ORDER BY stock ASC, name ASC"
    ))?;
    let products = stmt
        .query_map([], read_product)?
        .collect::<rusqlite::Result<_>>()
        .map_err(StorageError::from)?;
    Ok(products)
}

// ---------------------------------------------------------------------------
// Writes
// ---------------------------------------------------------------------------

/// Insert or update one product in the mirror.
pub fn upsert_product(db: &DbState, product: &Product) -> Result<(), SyncError> {
    let conn = db.lock()?;
    upsert_on(&conn, product)?;
    Ok(())
}

fn upsert_on(conn: &Connection, product: &Product) -> Result<(), StorageError> {
    conn.execute(
        "INSERT INTO products (id, name, price, stock, min_stock, barcode, sku, category, last_synced_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            price = excluded.price,
            stock = excluded.stock,
            min_stock = excluded.min_stock,
            barcode = excluded.barcode,
            sku = excluded.sku,
            category = excluded.category,
            last_synced_at = excluded.last_synced_at",
        params![
            product.id,
            product.name,
            product.price,
            product.stock.max(0),
            product.min_stock,
            product.barcode,
            product.sku,
            product.category,
            product.last_synced_at,
        ],
    )?;
    Ok(())
}

/// Remove one product from the mirror. Returns `false` when the id was not
/// present (not an error).
pub fn delete_product(db: &DbState, id: &str) -> Result<bool, SyncError> {
    let conn = db.lock()?;
    let deleted = conn
        .execute("DELETE FROM products WHERE id = ?1", params![id])
        .map_err(StorageError::from)?;
    Ok(deleted > 0)
}

/// Stamp a product as freshly acknowledged by the remote.
pub fn touch_synced(db: &DbState, id: &str) -> Result<(), SyncError> {
    let conn = db.lock()?;
    conn.execute(
        "UPDATE products SET last_synced_at = ?1 WHERE id = ?2",
        params![Utc::now().to_rfc3339(), id],
    )
    .map_err(StorageError::from)?;
    Ok(())
}

/// Sum of unacknowledged stock deltas per product, from the inventory
/// ledger. These are the local changes a resync must not clobber.
fn unsynced_deltas(conn: &Connection) -> Result<HashMap<String, i64>, StorageError> {
    let mut stmt = conn.prepare(
        "SELECT product_id, COALESCE(SUM(quantity), 0)
         FROM inventory_transactions
         WHERE synced = 0
         GROUP BY product_id",
    )?;
    let rows: Vec<(String, i64)> = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<rusqlite::Result<_>>()?;
    Ok(rows.into_iter().collect())
}

/// Full catalog resync: clear and reinsert from the remote snapshot, then
/// re-apply any stock delta the remote has not yet acknowledged (clamped at
/// zero). Runs as one transaction; readers never see an empty catalog.
pub fn replace_catalog(db: &DbState, products: &[Product]) -> Result<usize, SyncError> {
    let mut conn = db.lock()?;
    let tx = conn.transaction().map_err(StorageError::from)?;
    let now = Utc::now().to_rfc3339();

    let deltas = unsynced_deltas(&tx)?;
    let preserved = deltas.len();

    tx.execute("DELETE FROM products", [])
        .map_err(StorageError::from)?;

    for product in products {
        let delta = deltas.get(&product.id).copied().unwrap_or(0);
        let merged = Product {
            stock: (product.stock + delta).max(0),
            last_synced_at: Some(now.clone()),
            ..product.clone()
        };
        upsert_on(&tx, &merged)?;
    }

    tx.commit().map_err(StorageError::from)?;

    info!(
        replaced = products.len(),
        preserved_deltas = preserved,
        "catalog mirror replaced from remote snapshot"
    );
    Ok(products.len())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use rusqlite::Connection;

    fn test_db() -> DbState {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        db::run_migrations_for_test(&conn);
        DbState {
            conn: std::sync::Mutex::new(conn),
            db_path: std::path::PathBuf::from(":memory:"),
        }
    }

    fn product(id: &str, stock: i64) -> Product {
        Product {
            id: id.to_string(),
            name: format!("Product {id}"),
            price: 2.5,
            stock,
            min_stock: 0,
            barcode: None,
            sku: None,
            category: "drinks".to_string(),
            last_synced_at: None,
        }
    }

    fn record_unsynced_sale(db: &DbState, txn_id: &str, product_id: &str, delta: i64) {
        let conn = db.lock().unwrap();
        conn.execute(
            "INSERT INTO inventory_transactions (id, product_id, transaction_type, quantity, created_at, synced)
             VALUES (?1, ?2, 'sale', ?3, ?4, 0)",
            params![txn_id, product_id, delta, Utc::now().to_rfc3339()],
        )
        .unwrap();
    }

    #[test]
    fn test_upsert_and_lookup() {
        let db = test_db();
        let mut p = product("p1", 10);
        p.barcode = Some("5201234567890".to_string());
        upsert_product(&db, &p).unwrap();

        let found = find_by_barcode(&db, "5201234567890").unwrap().unwrap();
        assert_eq!(found.id, "p1");
        assert_eq!(found.stock, 10);

        assert!(find_by_barcode(&db, "0000000000000").unwrap().is_none());

        assert!(delete_product(&db, "p1").unwrap());
        assert!(!delete_product(&db, "p1").unwrap(), "second delete is a no-op");
        assert!(get_product(&db, "p1").unwrap().is_none());
    }

    #[test]
    fn test_replace_catalog_preserves_unsynced_deltas() {
        let db = test_db();
        upsert_product(&db, &product("p1", 5)).unwrap();
        upsert_product(&db, &product("p2", 8)).unwrap();

        // Two unsynced offline sales against p1 (delta -4 total)
        record_unsynced_sale(&db, "t1", "p1", -3);
        record_unsynced_sale(&db, "t2", "p1", -1);

        // Remote snapshot still believes p1 has 5 and p2 has 8
        let snapshot = vec![product("p1", 5), product("p2", 8), product("p3", 2)];
        replace_catalog(&db, &snapshot).unwrap();

        let p1 = get_product(&db, "p1").unwrap().unwrap();
        assert_eq!(p1.stock, 1, "unsynced decrement re-applied over snapshot");
        let p2 = get_product(&db, "p2").unwrap().unwrap();
        assert_eq!(p2.stock, 8, "untouched product takes the snapshot value");
        let p3 = get_product(&db, "p3").unwrap().unwrap();
        assert_eq!(p3.stock, 2, "new product inserted");
        assert!(p1.last_synced_at.is_some());
    }

    #[test]
    fn test_replace_catalog_clamps_merged_stock_at_zero() {
        let db = test_db();
        upsert_product(&db, &product("p1", 2)).unwrap();
        record_unsynced_sale(&db, "t1", "p1", -2);

        // Remote snapshot has less stock than the local delta assumed
        let snapshot = vec![product("p1", 1)];
        replace_catalog(&db, &snapshot).unwrap();

        let p1 = get_product(&db, "p1").unwrap().unwrap();
        assert_eq!(p1.stock, 0, "merge clamps at zero, never negative");
    }

    #[test]
    fn test_replace_catalog_drops_stale_products() {
        let db = test_db();
        upsert_product(&db, &product("gone", 4)).unwrap();
        replace_catalog(&db, &[product("kept", 1)]).unwrap();

        assert!(get_product(&db, "gone").unwrap().is_none());
        assert!(get_product(&db, "kept").unwrap().is_some());
    }

    #[test]
    fn test_low_stock_products() {
        let db = test_db();
        let mut low = product("low", 2);
        low.min_stock = 3;
        let mut ok = product("ok", 10);
        ok.min_stock = 3;
        upsert_product(&db, &low).unwrap();
        upsert_product(&db, &ok).unwrap();

        let flagged = low_stock_products(&db).unwrap();
        assert_eq!(flagged.len(), 1);
        assert_eq!(flagged[0].id, "low");
    }
}
