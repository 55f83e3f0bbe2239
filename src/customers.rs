//! Customer mirror with loyalty bookkeeping.
//!
//! Tier thresholds follow total lifetime spend. A full resync replaces the
//! mirror wholesale, except customers created offline whose `create` queue
//! item has not completed yet — dropping those would orphan the queued
//! mutation that references them.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::db::DbState;
use crate::error::{StorageError, SyncError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Customer {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub loyalty_points: i64,
    #[serde(default = "default_tier")]
    pub loyalty_tier: String,
    #[serde(default)]
    pub total_spent: f64,
    #[serde(default)]
    pub last_synced_at: Option<String>,
}

fn default_tier() -> String {
    "bronze".to_string()
}

/// Loyalty tier for a lifetime spend amount.
pub fn tier_for(total_spent: f64) -> &'static str {
    if total_spent >= 5_000.0 {
        "platinum"
    } else if total_spent >= 1_500.0 {
        "gold"
    } else if total_spent >= 500.0 {
        "silver"
    } else {
        "bronze"
    }
}

const CUSTOMER_COLUMNS: &str =
    "id, name, phone, email, loyalty_points, loyalty_tier, total_spent, last_synced_at";

fn read_customer(row: &rusqlite::Row<'_>) -> rusqlite::Result<Customer> {
    Ok(Customer {
        id: row.get(0)?,
        name: row.get(1)?,
        phone: row.get(2)?,
        email: row.get(3)?,
        loyalty_points: row.get(4)?,
        loyalty_tier: row.get(5)?,
        total_spent: row.get(6)?,
        last_synced_at: row.get(7)?,
    })
}

// ---------------------------------------------------------------------------
// Reads
// ---------------------------------------------------------------------------

pub(crate) fn get_on(conn: &Connection, id: &str) -> Result<Option<Customer>, StorageError> {
    let customer = conn
        .query_row(
            &format!("SELECT {CUSTOMER_COLUMNS} FROM customers WHERE id = ?1"),
            params![id],
            read_customer,
        )
        .optional()?;
    Ok(customer)
}

pub fn get_customer(db: &DbState, id: &str) -> Result<Option<Customer>, SyncError> {
    let conn = db.lock()?;
    Ok(get_on(&conn, id)?)
}

pub fn get_all_customers(db: &DbState) -> Result<Vec<Customer>, SyncError> {
    let conn = db.lock()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {CUSTOMER_COLUMNS} FROM customers ORDER BY name ASC"
    ))?;
    let customers = stmt
        .query_map([], read_customer)?
        .collect::<rusqlite::Result<_>>()
        .map_err(StorageError::from)?;
    Ok(customers)
}

/// Phone lookup used by the checkout screen.
pub fn find_by_phone(db: &DbState, phone: &str) -> Result<Option<Customer>, SyncError> {
    let conn = db.lock()?;
    let customer = conn
        .query_row(
            &format!("SELECT {CUSTOMER_COLUMNS} FROM customers WHERE phone = ?1"),
            params![phone],
            read_customer,
        )
        .optional()
        .map_err(StorageError::from)?;
    Ok(customer)
}

// ---------------------------------------------------------------------------
// Writes
// ---------------------------------------------------------------------------

fn upsert_on(conn: &Connection, customer: &Customer) -> Result<(), StorageError> {
    conn.execute(
        "INSERT INTO customers (id, name, phone, email, loyalty_points, loyalty_tier, total_spent, last_synced_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            phone = excluded.phone,
            email = excluded.email,
            loyalty_points = excluded.loyalty_points,
            loyalty_tier = excluded.loyalty_tier,
            total_spent = excluded.total_spent,
            last_synced_at = excluded.last_synced_at",
        params![
            customer.id,
            customer.name,
            customer.phone,
            customer.email,
            customer.loyalty_points,
            customer.loyalty_tier,
            customer.total_spent,
            customer.last_synced_at,
        ],
    )?;
    Ok(())
}

pub fn upsert_customer(db: &DbState, customer: &Customer) -> Result<(), SyncError> {
    let conn = db.lock()?;
    upsert_on(&conn, customer)?;
    Ok(())
}

/// Apply a sale's loyalty effects to the mirror: points earned minus
/// redeemed (never below zero), spend accumulated, tier recomputed.
/// Called inside the sale's transaction so the mirror and the order agree.
pub(crate) fn record_loyalty_on(
    conn: &Connection,
    customer_id: &str,
    earned: i64,
    redeemed: i64,
    spent: f64,
) -> Result<(), StorageError> {
    let Some(customer) = get_on(conn, customer_id)? else {
        return Ok(());
    };

    let points = (customer.loyalty_points + earned - redeemed).max(0);
    let total_spent = customer.total_spent + spent;
    conn.execute(
        "UPDATE customers SET loyalty_points = ?1, total_spent = ?2, loyalty_tier = ?3
         WHERE id = ?4",
        params![points, total_spent, tier_for(total_spent), customer_id],
    )?;
    Ok(())
}

/// Remove one customer from the mirror. Returns `false` when the id was
/// not present (not an error).
pub fn delete_customer(db: &DbState, id: &str) -> Result<bool, SyncError> {
    let conn = db.lock()?;
    let deleted = conn
        .execute("DELETE FROM customers WHERE id = ?1", params![id])
        .map_err(StorageError::from)?;
    Ok(deleted > 0)
}

/// Stamp a customer as freshly acknowledged by the remote.
pub fn touch_synced(db: &DbState, id: &str) -> Result<(), SyncError> {
    let conn = db.lock()?;
    conn.execute(
        "UPDATE customers SET last_synced_at = ?1 WHERE id = ?2",
        params![Utc::now().to_rfc3339(), id],
    )
    .map_err(StorageError::from)?;
    Ok(())
}

/// Full customer resync: clear and reinsert from the remote snapshot, but
/// keep customers whose own `create` mutation is still in the queue — the
/// remote cannot know about them yet.
pub fn replace_customers(db: &DbState, customers: &[Customer]) -> Result<usize, SyncError> {
    let mut conn = db.lock()?;
    let tx = conn.transaction().map_err(StorageError::from)?;
    let now = Utc::now().to_rfc3339();

    let mut stmt = tx.prepare(
        "SELECT c.id, c.name, c.phone, c.email, c.loyalty_points, c.loyalty_tier,
                c.total_spent, c.last_synced_at
         FROM customers c
         WHERE c.id IN (
             SELECT entity_id FROM sync_queue
             WHERE entity_type = 'customer'
               AND operation = 'create'
               AND status != 'completed'
         )",
    ).map_err(StorageError::from)?;
    let unacknowledged: Vec<Customer> = stmt
        .query_map([], read_customer)
        .map_err(StorageError::from)?
        .collect::<rusqlite::Result<_>>()
        .map_err(StorageError::from)?;
    drop(stmt);

    tx.execute("DELETE FROM customers", [])
        .map_err(StorageError::from)?;

    for customer in customers {
        let merged = Customer {
            last_synced_at: Some(now.clone()),
            ..customer.clone()
        };
        upsert_on(&tx, &merged)?;
    }

    // Locally created, not-yet-synced customers win over the snapshot.
    for local in &unacknowledged {
        upsert_on(&tx, local)?;
    }

    tx.commit().map_err(StorageError::from)?;

    info!(
        replaced = customers.len(),
        preserved_local = unacknowledged.len(),
        "customer mirror replaced from remote snapshot"
    );
    Ok(customers.len())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::queue::{self, Action, Domain};
    use rusqlite::Connection;

    fn test_db() -> DbState {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        db::run_migrations_for_test(&conn);
        DbState {
            conn: std::sync::Mutex::new(conn),
            db_path: std::path::PathBuf::from(":memory:"),
        }
    }

    fn customer(id: &str, name: &str) -> Customer {
        Customer {
            id: id.to_string(),
            name: name.to_string(),
            phone: None,
            email: None,
            loyalty_points: 0,
            loyalty_tier: "bronze".to_string(),
            total_spent: 0.0,
            last_synced_at: None,
        }
    }

    #[test]
    fn test_tier_thresholds() {
        assert_eq!(tier_for(0.0), "bronze");
        assert_eq!(tier_for(499.99), "bronze");
        assert_eq!(tier_for(500.0), "silver");
        assert_eq!(tier_for(1_500.0), "gold");
        assert_eq!(tier_for(5_000.0), "platinum");
    }

    #[test]
    fn test_record_loyalty_updates_points_spend_and_tier() {
        let db = test_db();
        upsert_customer(&db, &customer("c1", "Maria")).unwrap();

        {
            let conn = db.lock().unwrap();
            record_loyalty_on(&conn, "c1", 30, 10, 520.0).unwrap();
        }

        let c = get_customer(&db, "c1").unwrap().unwrap();
        assert_eq!(c.loyalty_points, 20);
        assert!((c.total_spent - 520.0).abs() < f64::EPSILON);
        assert_eq!(c.loyalty_tier, "silver");
    }

    #[test]
    fn test_record_loyalty_never_goes_negative() {
        let db = test_db();
        let mut c = customer("c1", "Maria");
        c.loyalty_points = 5;
        upsert_customer(&db, &c).unwrap();

        {
            let conn = db.lock().unwrap();
            record_loyalty_on(&conn, "c1", 0, 50, 10.0).unwrap();
        }

        let c = get_customer(&db, "c1").unwrap().unwrap();
        assert_eq!(c.loyalty_points, 0);
    }

    #[test]
    fn test_replace_customers_preserves_unsynced_local_creates() {
        let db = test_db();
        upsert_customer(&db, &customer("remote-1", "Remote One")).unwrap();

        // Customer created offline, create mutation still pending
        let local = customer("local-1", "Walk In");
        upsert_customer(&db, &local).unwrap();
        queue::enqueue(
            &db,
            Domain::Customer,
            Action::Create,
            &serde_json::to_value(&local).unwrap(),
            3,
        )
        .unwrap();

        // Remote snapshot knows nothing about local-1
        replace_customers(&db, &[customer("remote-1", "Remote One")]).unwrap();

        assert!(
            get_customer(&db, "local-1").unwrap().is_some(),
            "locally created customer survives the resync"
        );
        assert!(get_customer(&db, "remote-1").unwrap().is_some());
    }

    #[test]
    fn test_replace_customers_drops_acknowledged_locals() {
        let db = test_db();
        let local = customer("local-1", "Walk In");
        upsert_customer(&db, &local).unwrap();
        let qid = queue::enqueue(
            &db,
            Domain::Customer,
            Action::Create,
            &serde_json::to_value(&local).unwrap(),
            3,
        )
        .unwrap();
        queue::transition(&db, &qid, queue::Status::Processing, None).unwrap();
        queue::transition(&db, &qid, queue::Status::Completed, None).unwrap();

        // Snapshot omits the (now remote-known) customer, e.g. deleted upstream
        replace_customers(&db, &[]).unwrap();
        assert!(
            get_customer(&db, "local-1").unwrap().is_none(),
            "acknowledged customers follow the snapshot"
        );
    }

    #[test]
    fn test_find_by_phone() {
        let db = test_db();
        let mut c = customer("c1", "Maria");
        c.phone = Some("+306941234567".to_string());
        upsert_customer(&db, &c).unwrap();

        assert_eq!(
            find_by_phone(&db, "+306941234567").unwrap().unwrap().id,
            "c1"
        );
        assert!(find_by_phone(&db, "+300000000000").unwrap().is_none());
    }
}
