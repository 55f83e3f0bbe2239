//! Offline order path: make a sale durable and locally consistent in one
//! transaction, independent of network state.
//!
//! `apply_order` persists the order, clamp-decrements stock per line item,
//! appends the inventory ledger rows, updates the customer loyalty mirror,
//! and enqueues the replay record — all inside a single SQLite transaction.
//! Totals are always recomputed from line items, discount, and tax rules;
//! they are never accepted from the caller.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::catalog;
use crate::config::EngineConfig;
use crate::customers;
use crate::db::DbState;
use crate::error::{StorageError, SyncError, ValidationError};
use crate::inventory::{self, TransactionKind};
use crate::queue::{self, Action, Domain};

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineItem {
    pub product_id: String,
    pub name: String,
    pub unit_price: f64,
    pub quantity: i64,
    #[serde(default)]
    pub category: String,
}

impl LineItem {
    pub fn total(&self) -> f64 {
        self.unit_price * self.quantity as f64
    }
}

/// Discount applied before tax: a percentage of the subtotal or an
/// absolute amount, both capped at the subtotal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "value")]
pub enum Discount {
    #[default]
    None,
    Percent(f64),
    Absolute(f64),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderDraft {
    #[serde(default)]
    pub customer_id: Option<String>,
    pub cashier_id: String,
    pub line_items: Vec<LineItem>,
    #[serde(default)]
    pub discount: Discount,
    pub payment_method: String,
    #[serde(default)]
    pub payment_data: Value,
    #[serde(default)]
    pub loyalty_points_redeemed: i64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrderTotals {
    pub subtotal: f64,
    pub discount_amount: f64,
    pub tax_amount: f64,
    pub excise_amount: f64,
    pub total: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Synced,
    Failed,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Synced => "synced",
            OrderStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(OrderStatus::Pending),
            "synced" => Some(OrderStatus::Synced),
            "failed" => Some(OrderStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub order_number: String,
    pub customer_id: Option<String>,
    pub cashier_id: String,
    pub line_items: Vec<LineItem>,
    pub subtotal: f64,
    pub discount_amount: f64,
    pub tax_amount: f64,
    pub excise_amount: f64,
    pub total: f64,
    pub payment_method: String,
    pub payment_data: Value,
    pub loyalty_points_earned: i64,
    pub loyalty_points_redeemed: i64,
    pub status: OrderStatus,
    pub sync_error: Option<String>,
    pub sync_retry_count: i64,
    pub last_sync_attempt: Option<String>,
    pub created_at: String,
    pub synced_at: Option<String>,
}

// ---------------------------------------------------------------------------
// Totals
// ---------------------------------------------------------------------------

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Recompute order totals from line items and config:
/// `total = subtotal − discount + tax + excise`. Discount (percent or
/// absolute) applies before tax; tax is a flat rate on the post-discount
/// amount; excise is a flat rate on the post-discount share of excisable
/// categories.
pub fn compute_totals(
    config: &EngineConfig,
    draft: &OrderDraft,
) -> Result<OrderTotals, ValidationError> {
    if draft.line_items.is_empty() {
        return Err(ValidationError::NoLineItems);
    }
    for line in &draft.line_items {
        if line.quantity <= 0 {
            return Err(ValidationError::NonPositiveQuantity {
                product_id: line.product_id.clone(),
                quantity: line.quantity,
            });
        }
        if line.unit_price < 0.0 {
            return Err(ValidationError::NegativePrice {
                product_id: line.product_id.clone(),
            });
        }
    }

    let subtotal: f64 = draft.line_items.iter().map(LineItem::total).sum();

    let discount_amount = match draft.discount {
        Discount::None => 0.0,
        Discount::Percent(pct) => {
            if pct < 0.0 {
                return Err(ValidationError::NegativeDiscount);
            }
            subtotal * (pct / 100.0).min(1.0)
        }
        Discount::Absolute(amount) => {
            if amount < 0.0 {
                return Err(ValidationError::NegativeDiscount);
            }
            amount.min(subtotal)
        }
    };

    let after_discount = subtotal - discount_amount;
    let tax_amount = after_discount * config.tax_rate;

    let excisable: f64 = draft
        .line_items
        .iter()
        .filter(|line| config.excise_categories.contains(&line.category))
        .map(LineItem::total)
        .sum();
    let excise_amount = if subtotal > 0.0 {
        excisable * (after_discount / subtotal) * config.excise_rate
    } else {
        0.0
    };

    Ok(OrderTotals {
        subtotal: round2(subtotal),
        discount_amount: round2(discount_amount),
        tax_amount: round2(tax_amount),
        excise_amount: round2(excise_amount),
        total: round2(after_discount + tax_amount + excise_amount),
    })
}

// ---------------------------------------------------------------------------
// Order number generation
// ---------------------------------------------------------------------------

/// Generate a sequential order number in format ORD-DDMMYYYY-NNNNN.
///
/// Uses `local_settings` (category='orders', key='order_counter') as a
/// persistent counter.
fn next_order_number(conn: &Connection) -> String {
    let date_display = chrono::Local::now().format("%d%m%Y").to_string();

    let current: i64 = conn
        .query_row(
            "SELECT setting_value FROM local_settings \
             WHERE setting_category = 'orders' AND setting_key = 'order_counter'",
            [],
            |row| {
                row.get::<_, String>(0)
                    .map(|v| v.parse::<i64>().unwrap_or(0))
            },
        )
        .unwrap_or(0);

    let next = current + 1;
    let _ = conn.execute(
        "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at) \
         VALUES ('orders', 'order_counter', ?1, datetime('now')) \
         ON CONFLICT(setting_category, setting_key) DO UPDATE SET \
            setting_value = excluded.setting_value, updated_at = excluded.updated_at",
        params![next.to_string()],
    );

    format!("ORD-{}-{:05}", date_display, next)
}

// ---------------------------------------------------------------------------
// Apply (the offline write path)
// ---------------------------------------------------------------------------

/// Record an offline sale. On return the order, its stock effects, its
/// ledger rows, the loyalty update, and the replay queue item have all been
/// committed together; any failure rolls the whole unit back.
pub fn apply_order(
    db: &DbState,
    config: &EngineConfig,
    draft: &OrderDraft,
) -> Result<Order, SyncError> {
    let totals = compute_totals(config, draft)?;

    let mut conn = db.lock()?;
    let tx = conn.transaction().map_err(StorageError::from)?;

    // Reject unknown products before any write lands.
    for line in &draft.line_items {
        if catalog::get_on(&tx, &line.product_id)?.is_none() {
            return Err(ValidationError::UnknownProduct(line.product_id.clone()).into());
        }
    }

    let order_id = Uuid::new_v4().to_string();
    let order_number = next_order_number(&tx);
    let now = Utc::now().to_rfc3339();

    let after_discount = totals.subtotal - totals.discount_amount;
    let earned = if draft.customer_id.is_some() {
        (after_discount * config.loyalty_points_per_unit).floor() as i64
    } else {
        0
    };

    let line_items_json = serde_json::to_string(&draft.line_items)
        .map_err(|e| StorageError::Corrupted(format!("serialize line items: {e}")))?;
    let payment_data_json = serde_json::to_string(&draft.payment_data)
        .map_err(|e| StorageError::Corrupted(format!("serialize payment data: {e}")))?;

    tx.execute(
        "INSERT INTO orders (
            id, order_number, customer_id, cashier_id, line_items,
            subtotal, discount_amount, tax_amount, excise_amount, total_amount,
            payment_method, payment_data, loyalty_points_earned, loyalty_points_redeemed,
            status, created_at
        ) VALUES (
            ?1, ?2, ?3, ?4, ?5,
            ?6, ?7, ?8, ?9, ?10,
            ?11, ?12, ?13, ?14,
            'pending', ?15
        )",
        params![
            order_id,
            order_number,
            draft.customer_id,
            draft.cashier_id,
            line_items_json,
            totals.subtotal,
            totals.discount_amount,
            totals.tax_amount,
            totals.excise_amount,
            totals.total,
            draft.payment_method,
            payment_data_json,
            earned,
            draft.loyalty_points_redeemed,
            now,
        ],
    )
    .map_err(StorageError::from)?;

    // Optimistic stock decrement per line, clamped at zero, with one
    // ledger row each.
    for line in &draft.line_items {
        inventory::apply_stock_delta_on(
            &tx,
            &line.product_id,
            TransactionKind::Sale,
            -line.quantity,
            Some(&order_id),
        )?;
    }

    if let Some(customer_id) = draft.customer_id.as_deref() {
        customers::record_loyalty_on(
            &tx,
            customer_id,
            earned,
            draft.loyalty_points_redeemed,
            totals.total,
        )?;
    }

    let order = Order {
        id: order_id.clone(),
        order_number: order_number.clone(),
        customer_id: draft.customer_id.clone(),
        cashier_id: draft.cashier_id.clone(),
        line_items: draft.line_items.clone(),
        subtotal: totals.subtotal,
        discount_amount: totals.discount_amount,
        tax_amount: totals.tax_amount,
        excise_amount: totals.excise_amount,
        total: totals.total,
        payment_method: draft.payment_method.clone(),
        payment_data: draft.payment_data.clone(),
        loyalty_points_earned: earned,
        loyalty_points_redeemed: draft.loyalty_points_redeemed,
        status: OrderStatus::Pending,
        sync_error: None,
        sync_retry_count: 0,
        last_sync_attempt: None,
        created_at: now,
        synced_at: None,
    };

    let payload = serde_json::to_value(&order)
        .map_err(|e| StorageError::Corrupted(format!("serialize order: {e}")))?;
    queue::insert_item(&tx, Domain::Order, Action::Create, &payload, config.max_retries)?;

    tx.commit().map_err(StorageError::from)?;

    info!(
        order_id = %order_id,
        order_number = %order_number,
        total = totals.total,
        "offline sale recorded and queued for sync"
    );

    Ok(order)
}

// ---------------------------------------------------------------------------
// Sync bookkeeping
// ---------------------------------------------------------------------------

/// The remote acknowledged the order: flip it to `synced` and mark its
/// inventory ledger rows acknowledged too.
pub fn mark_order_synced(db: &DbState, order_id: &str) -> Result<(), SyncError> {
    let conn = db.lock()?;
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE orders SET status = 'synced', synced_at = ?1, sync_error = NULL
         WHERE id = ?2",
        params![now, order_id],
    )
    .map_err(StorageError::from)?;
    conn.execute(
        "UPDATE inventory_transactions SET synced = 1 WHERE order_id = ?1",
        params![order_id],
    )
    .map_err(StorageError::from)?;
    Ok(())
}

/// A replay attempt failed: record the error and, once the retry budget is
/// gone, move the order to `failed` for operator review.
pub fn record_sync_failure(
    db: &DbState,
    order_id: &str,
    error: &str,
    dead_letter: bool,
) -> Result<(), SyncError> {
    let conn = db.lock()?;
    let now = Utc::now().to_rfc3339();
    let status = if dead_letter { "failed" } else { "pending" };
    conn.execute(
        "UPDATE orders SET status = ?1, sync_error = ?2,
                sync_retry_count = sync_retry_count + 1, last_sync_attempt = ?3
         WHERE id = ?4",
        params![status, error, now, order_id],
    )
    .map_err(StorageError::from)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

struct RawOrder {
    id: String,
    order_number: String,
    customer_id: Option<String>,
    cashier_id: String,
    line_items: String,
    subtotal: f64,
    discount_amount: f64,
    tax_amount: f64,
    excise_amount: f64,
    total: f64,
    payment_method: String,
    payment_data: String,
    loyalty_points_earned: i64,
    loyalty_points_redeemed: i64,
    status: String,
    sync_error: Option<String>,
    sync_retry_count: i64,
    last_sync_attempt: Option<String>,
    created_at: String,
    synced_at: Option<String>,
}

const ORDER_COLUMNS: &str = "id, order_number, customer_id, cashier_id, line_items, \
     subtotal, discount_amount, tax_amount, excise_amount, total_amount, \
     payment_method, payment_data, loyalty_points_earned, loyalty_points_redeemed, \
     status, sync_error, sync_retry_count, last_sync_attempt, created_at, synced_at";

fn read_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawOrder> {
    Ok(RawOrder {
        id: row.get(0)?,
        order_number: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
        customer_id: row.get(2)?,
        cashier_id: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
        line_items: row.get(4)?,
        subtotal: row.get(5)?,
        discount_amount: row.get(6)?,
        tax_amount: row.get(7)?,
        excise_amount: row.get(8)?,
        total: row.get(9)?,
        payment_method: row.get::<_, Option<String>>(10)?.unwrap_or_default(),
        payment_data: row.get(11)?,
        loyalty_points_earned: row.get(12)?,
        loyalty_points_redeemed: row.get(13)?,
        status: row.get(14)?,
        sync_error: row.get(15)?,
        sync_retry_count: row.get(16)?,
        last_sync_attempt: row.get(17)?,
        created_at: row.get(18)?,
        synced_at: row.get(19)?,
    })
}

fn decode_order(raw: RawOrder) -> Result<Order, StorageError> {
    let status = OrderStatus::parse(&raw.status)
        .ok_or_else(|| StorageError::Corrupted(format!("order {}: status {}", raw.id, raw.status)))?;
    let line_items: Vec<LineItem> = serde_json::from_str(&raw.line_items)
        .map_err(|e| StorageError::Corrupted(format!("order {}: line items: {e}", raw.id)))?;
    let payment_data: Value = serde_json::from_str(&raw.payment_data)
        .map_err(|e| StorageError::Corrupted(format!("order {}: payment data: {e}", raw.id)))?;

    Ok(Order {
        id: raw.id,
        order_number: raw.order_number,
        customer_id: raw.customer_id,
        cashier_id: raw.cashier_id,
        line_items,
        subtotal: raw.subtotal,
        discount_amount: raw.discount_amount,
        tax_amount: raw.tax_amount,
        excise_amount: raw.excise_amount,
        total: raw.total,
        payment_method: raw.payment_method,
        payment_data,
        loyalty_points_earned: raw.loyalty_points_earned,
        loyalty_points_redeemed: raw.loyalty_points_redeemed,
        status,
        sync_error: raw.sync_error,
        sync_retry_count: raw.sync_retry_count,
        last_sync_attempt: raw.last_sync_attempt,
        created_at: raw.created_at,
        synced_at: raw.synced_at,
    })
}

pub fn get_order(db: &DbState, id: &str) -> Result<Option<Order>, SyncError> {
    let conn = db.lock()?;
    let raw = conn
        .query_row(
            &format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = ?1"),
            params![id],
            read_raw,
        )
        .optional()
        .map_err(StorageError::from)?;
    Ok(raw.map(decode_order).transpose()?)
}

/// All orders, most recent first.
pub fn get_all_orders(db: &DbState) -> Result<Vec<Order>, SyncError> {
    let conn = db.lock()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {ORDER_COLUMNS} FROM orders ORDER BY created_at DESC, rowid DESC"
    ))?;
    let raws: Vec<RawOrder> = stmt
        .query_map([], read_raw)?
        .collect::<rusqlite::Result<_>>()
        .map_err(StorageError::from)?;
    raws.into_iter()
        .map(|raw| decode_order(raw).map_err(SyncError::from))
        .collect()
}

/// Orders still awaiting remote acknowledgment.
pub fn pending_orders(db: &DbState) -> Result<Vec<Order>, SyncError> {
    let conn = db.lock()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {ORDER_COLUMNS} FROM orders WHERE status = 'pending'
         ORDER BY created_at ASC, rowid ASC"
    ))?;
    let raws: Vec<RawOrder> = stmt
        .query_map([], read_raw)?
        .collect::<rusqlite::Result<_>>()
        .map_err(StorageError::from)?;
    raws.into_iter()
        .map(|raw| decode_order(raw).map_err(SyncError::from))
        .collect()
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{self, Product};
    use crate::customers::{self, Customer};
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

    fn test_config() -> EngineConfig {
        EngineConfig {
            tax_rate: 0.10,
            excise_rate: 0.25,
            excise_categories: vec!["spirits".to_string()],
            loyalty_points_per_unit: 1.0,
            ..EngineConfig::default()
        }
    }

    fn seed_product(db: &DbState, id: &str, price: f64, stock: i64) {
        catalog::upsert_product(
            db,
            &Product {
                id: id.to_string(),
                name: format!("Product {id}"),
                price,
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

    fn line(product_id: &str, unit_price: f64, quantity: i64) -> LineItem {
        LineItem {
            product_id: product_id.to_string(),
            name: format!("Product {product_id}"),
            unit_price,
            quantity,
            category: "grocery".to_string(),
        }
    }

    fn draft(lines: Vec<LineItem>) -> OrderDraft {
        OrderDraft {
            customer_id: None,
            cashier_id: "cashier-1".to_string(),
            line_items: lines,
            discount: Discount::None,
            payment_method: "cash".to_string(),
            payment_data: serde_json::json!({}),
            loyalty_points_redeemed: 0,
        }
    }

    // ------------------------------------------------------------------
    // Totals
    // ------------------------------------------------------------------

    #[test]
    fn test_totals_percent_discount_before_tax() {
        let config = test_config();
        let mut d = draft(vec![line("a", 10.0, 2), line("b", 5.0, 1)]);
        d.discount = Discount::Percent(10.0);

        let totals = compute_totals(&config, &d).unwrap();
        assert_eq!(totals.subtotal, 25.0);
        assert_eq!(totals.discount_amount, 2.5);
        assert_eq!(totals.tax_amount, 2.25, "tax on the post-discount amount");
        assert_eq!(totals.excise_amount, 0.0);
        assert_eq!(totals.total, 24.75);
    }

    #[test]
    fn test_totals_absolute_discount_capped_at_subtotal() {
        let config = test_config();
        let mut d = draft(vec![line("a", 4.0, 1)]);
        d.discount = Discount::Absolute(10.0);

        let totals = compute_totals(&config, &d).unwrap();
        assert_eq!(totals.discount_amount, 4.0);
        assert_eq!(totals.total, 0.0);
    }

    #[test]
    fn test_totals_excise_on_excisable_share() {
        let config = test_config();
        let mut spirits = line("ouzo", 20.0, 1);
        spirits.category = "spirits".to_string();
        let d = draft(vec![spirits, line("bread", 5.0, 2)]);

        // subtotal 30, no discount; excisable share 20 -> excise 5.0
        let totals = compute_totals(&config, &d).unwrap();
        assert_eq!(totals.excise_amount, 5.0);
        assert_eq!(totals.tax_amount, 3.0);
        assert_eq!(totals.total, 38.0);
    }

    #[test]
    fn test_totals_validation_errors() {
        let config = test_config();

        let err = compute_totals(&config, &draft(vec![])).unwrap_err();
        assert!(matches!(err, ValidationError::NoLineItems));

        let err = compute_totals(&config, &draft(vec![line("a", 1.0, 0)])).unwrap_err();
        assert!(matches!(err, ValidationError::NonPositiveQuantity { .. }));

        let err = compute_totals(&config, &draft(vec![line("a", -1.0, 1)])).unwrap_err();
        assert!(matches!(err, ValidationError::NegativePrice { .. }));

        let mut d = draft(vec![line("a", 1.0, 1)]);
        d.discount = Discount::Percent(-5.0);
        let err = compute_totals(&config, &d).unwrap_err();
        assert!(matches!(err, ValidationError::NegativeDiscount));
    }

    // ------------------------------------------------------------------
    // Apply
    // ------------------------------------------------------------------

    #[test]
    fn test_apply_order_persists_decrements_and_enqueues() {
        let db = test_db();
        let config = test_config();
        seed_product(&db, "a", 10.0, 5);

        let order = apply_order(&db, &config, &draft(vec![line("a", 10.0, 2)])).unwrap();
        assert_eq!(order.status, OrderStatus::Pending);
        assert!(order.order_number.starts_with("ORD-"));
        assert_eq!(order.total, 22.0, "2 x 10.0 + 10% tax");

        // Stock decremented
        let product = catalog::get_product(&db, "a").unwrap().unwrap();
        assert_eq!(product.stock, 3);

        // One pending queue item referencing the order
        let eligible = queue::eligible_for_drain(&db).unwrap();
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].domain, Domain::Order);
        assert_eq!(eligible[0].entity_id, order.id);
        assert_eq!(eligible[0].status, Status::Pending);

        // Order readable back with intact line items
        let stored = get_order(&db, &order.id).unwrap().unwrap();
        assert_eq!(stored.line_items.len(), 1);
        assert_eq!(stored.line_items[0].quantity, 2);
    }

    #[test]
    fn test_order_numbers_are_sequential() {
        let db = test_db();
        let config = test_config();
        seed_product(&db, "a", 2.0, 100);

        let first = apply_order(&db, &config, &draft(vec![line("a", 2.0, 1)])).unwrap();
        let second = apply_order(&db, &config, &draft(vec![line("a", 2.0, 1)])).unwrap();

        assert!(first.order_number.ends_with("-00001"));
        assert!(second.order_number.ends_with("-00002"));
    }

    #[test]
    fn test_stock_clamps_at_zero_with_full_ledger() {
        let db = test_db();
        let config = test_config();
        seed_product(&db, "a", 10.0, 5);

        // Three sequential offline sales of quantity 2 against stock 5
        for _ in 0..3 {
            apply_order(&db, &config, &draft(vec![line("a", 10.0, 2)])).unwrap();
        }

        let product = catalog::get_product(&db, "a").unwrap().unwrap();
        assert_eq!(product.stock, 0, "clamped at zero, never negative");

        let ledger = inventory::history(&db, "a").unwrap();
        assert_eq!(ledger.len(), 3, "every sale leaves a ledger row");
        let deltas: Vec<i64> = ledger.iter().map(|t| t.quantity).collect();
        assert_eq!(deltas, vec![-2, -2, -1], "third decrement clamped");
    }

    #[test]
    fn test_apply_order_unknown_product_leaves_no_partial_state() {
        let db = test_db();
        let config = test_config();
        seed_product(&db, "a", 10.0, 5);

        let err = apply_order(
            &db,
            &config,
            &draft(vec![line("a", 10.0, 1), line("ghost", 1.0, 1)]),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            SyncError::Validation(ValidationError::UnknownProduct(_))
        ));

        // Rollback left nothing behind
        assert_eq!(catalog::get_product(&db, "a").unwrap().unwrap().stock, 5);
        assert_eq!(get_all_orders(&db).unwrap().len(), 0);
        assert_eq!(queue::pending_count(&db).unwrap(), 0);
        assert_eq!(inventory::history(&db, "a").unwrap().len(), 0);
    }

    #[test]
    fn test_apply_order_accrues_loyalty() {
        let db = test_db();
        let config = test_config();
        seed_product(&db, "a", 100.0, 10);
        customers::upsert_customer(
            &db,
            &Customer {
                id: "c1".to_string(),
                name: "Maria".to_string(),
                phone: None,
                email: None,
                loyalty_points: 10,
                loyalty_tier: "bronze".to_string(),
                total_spent: 0.0,
                last_synced_at: None,
            },
        )
        .unwrap();

        let mut d = draft(vec![line("a", 100.0, 1)]);
        d.customer_id = Some("c1".to_string());
        d.loyalty_points_redeemed = 5;

        let order = apply_order(&db, &config, &d).unwrap();
        assert_eq!(order.loyalty_points_earned, 100);

        let customer = customers::get_customer(&db, "c1").unwrap().unwrap();
        assert_eq!(customer.loyalty_points, 105, "10 + 100 earned - 5 redeemed");
        assert!((customer.total_spent - order.total).abs() < 1e-9);
    }

    // ------------------------------------------------------------------
    // Sync bookkeeping
    // ------------------------------------------------------------------

    #[test]
    fn test_mark_order_synced_flips_order_and_ledger() {
        let db = test_db();
        let config = test_config();
        seed_product(&db, "a", 10.0, 5);
        let order = apply_order(&db, &config, &draft(vec![line("a", 10.0, 1)])).unwrap();

        mark_order_synced(&db, &order.id).unwrap();

        let stored = get_order(&db, &order.id).unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Synced);
        assert!(stored.synced_at.is_some());

        let ledger = inventory::history(&db, "a").unwrap();
        assert!(ledger.iter().all(|t| t.synced));
    }

    #[test]
    fn test_record_sync_failure_dead_letter_fails_order() {
        let db = test_db();
        let config = test_config();
        seed_product(&db, "a", 10.0, 5);
        let order = apply_order(&db, &config, &draft(vec![line("a", 10.0, 1)])).unwrap();

        record_sync_failure(&db, &order.id, "HTTP 500", false).unwrap();
        let stored = get_order(&db, &order.id).unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Pending);
        assert_eq!(stored.sync_retry_count, 1);
        assert_eq!(stored.sync_error.as_deref(), Some("HTTP 500"));

        record_sync_failure(&db, &order.id, "HTTP 500", true).unwrap();
        let stored = get_order(&db, &order.id).unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Failed);
    }
}
