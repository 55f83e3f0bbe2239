//! Durable sync queue: the mutation ledger.
//!
//! Every offline mutation is recorded here before any network attempt is
//! made. Items move through a strict state machine
//! (pending -> processing -> completed | failed) and failed items re-enter
//! processing only while their retry budget lasts. Completed items are kept
//! for a retention window for audit, then swept. An item's UUID doubles as
//! the idempotency key sent to the remote authority, so a replay of the
//! same item is deduplicated server-side.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use crate::db::DbState;
use crate::error::{StorageError, SyncError, ValidationError};

/// Default retry budget before an item is dead-lettered.
pub const DEFAULT_MAX_RETRIES: i64 = 3;

// ---------------------------------------------------------------------------
// Queue item model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    Order,
    Customer,
    Product,
    Inventory,
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Order => "order",
            Domain::Customer => "customer",
            Domain::Product => "product",
            Domain::Inventory => "inventory",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "order" => Some(Domain::Order),
            "customer" => Some(Domain::Customer),
            "product" => Some(Domain::Product),
            "inventory" => Some(Domain::Inventory),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Create,
    Update,
    Delete,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Update => "update",
            Action::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(Action::Create),
            "update" => Some(Action::Update),
            "delete" => Some(Action::Delete),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Processing => "processing",
            Status::Completed => "completed",
            Status::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Status::Pending),
            "processing" => Some(Status::Processing),
            "completed" => Some(Status::Completed),
            "failed" => Some(Status::Failed),
            _ => None,
        }
    }
}

/// One durable record of a mutation awaiting remote acknowledgment.
#[derive(Debug, Clone, Serialize)]
pub struct QueueItem {
    pub id: String,
    pub domain: Domain,
    pub entity_id: String,
    pub action: Action,
    pub payload: Value,
    pub status: Status,
    pub retry_count: i64,
    pub max_retries: i64,
    pub last_error: Option<String>,
    pub enqueued_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
}

impl QueueItem {
    /// A failed item that has exhausted its retry budget. Never retried
    /// automatically again; surfaced for operator review instead.
    pub fn is_dead_letter(&self) -> bool {
        self.status == Status::Failed && self.retry_count >= self.max_retries
    }
}

/// Per-status counts used by the presentation layer's sync-health indicator.
/// `failed` counts retryable failures only; exhausted items show up under
/// `dead_letter`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusSummary {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub dead_letter: i64,
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

const ITEM_COLUMNS: &str = "id, entity_type, entity_id, operation, payload, status, \
     retry_count, max_retries, last_error, created_at, updated_at, completed_at";

type RawItem = (
    String,
    String,
    String,
    String,
    String,
    String,
    i64,
    i64,
    Option<String>,
    String,
    String,
    Option<String>,
);

fn read_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawItem> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
    ))
}

fn decode_item(raw: RawItem) -> Result<QueueItem, StorageError> {
    let (
        id,
        entity_type,
        entity_id,
        operation,
        payload,
        status,
        retry_count,
        max_retries,
        last_error,
        enqueued_at,
        updated_at,
        completed_at,
    ) = raw;

    let domain = Domain::parse(&entity_type)
        .ok_or_else(|| StorageError::Corrupted(format!("queue item {id}: domain {entity_type}")))?;
    let action = Action::parse(&operation)
        .ok_or_else(|| StorageError::Corrupted(format!("queue item {id}: action {operation}")))?;
    let status = Status::parse(&status)
        .ok_or_else(|| StorageError::Corrupted(format!("queue item {id}: status {status}")))?;
    let payload: Value = serde_json::from_str(&payload)
        .map_err(|e| StorageError::Corrupted(format!("queue item {id}: payload: {e}")))?;

    Ok(QueueItem {
        id,
        domain,
        entity_id,
        action,
        payload,
        status,
        retry_count,
        max_retries,
        last_error,
        enqueued_at,
        updated_at,
        completed_at,
    })
}

// ---------------------------------------------------------------------------
// Enqueue
// ---------------------------------------------------------------------------

/// Validate a mutation payload before anything is written: it must be a
/// JSON object carrying a non-empty string `id` for the target record.
fn validate_payload(payload: &Value) -> Result<String, ValidationError> {
    let obj = payload.as_object().ok_or(ValidationError::PayloadNotObject)?;
    let entity_id = obj
        .get("id")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(ValidationError::MissingRecordId)?;
    Ok(entity_id.to_string())
}

/// Insert a queue item on an existing connection or transaction. Used by
/// the mutation applier so the domain write and the queue entry commit as
/// one unit.
pub(crate) fn insert_item(
    conn: &Connection,
    domain: Domain,
    action: Action,
    payload: &Value,
    max_retries: i64,
) -> Result<String, SyncError> {
    let entity_id = validate_payload(payload)?;
    let id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();
    let payload_text = serde_json::to_string(payload)
        .map_err(|e| StorageError::Corrupted(format!("serialize payload: {e}")))?;

    conn.execute(
        "INSERT INTO sync_queue (id, entity_type, entity_id, operation, payload,
                                 status, retry_count, max_retries, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 'pending', 0, ?6, ?7, ?7)",
        params![
            id,
            domain.as_str(),
            entity_id,
            action.as_str(),
            payload_text,
            max_retries,
            now
        ],
    )
    .map_err(StorageError::from)?;

    debug!(queue_id = %id, domain = domain.as_str(), action = action.as_str(), "mutation enqueued");
    Ok(id)
}

/// Durably record a mutation with `status = pending`. Returns the item's
/// id only after the record has been committed — no mutation is ever
/// attempted against the network without first surviving here.
pub fn enqueue(
    db: &DbState,
    domain: Domain,
    action: Action,
    payload: &Value,
    max_retries: i64,
) -> Result<String, SyncError> {
    let conn = db.lock()?;
    insert_item(&conn, domain, action, payload, max_retries)
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

fn get_on(conn: &Connection, id: &str) -> Result<Option<QueueItem>, StorageError> {
    let raw = conn
        .query_row(
            &format!("SELECT {ITEM_COLUMNS} FROM sync_queue WHERE id = ?1"),
            params![id],
            read_raw,
        )
        .optional()?;
    raw.map(decode_item).transpose()
}

pub fn get(db: &DbState, id: &str) -> Result<Option<QueueItem>, SyncError> {
    let conn = db.lock()?;
    Ok(get_on(&conn, id)?)
}

fn collect_items(conn: &Connection, sql: &str) -> Result<Vec<QueueItem>, StorageError> {
    let mut stmt = conn.prepare(sql)?;
    let raws: Vec<RawItem> = stmt
        .query_map([], read_raw)?
        .collect::<rusqlite::Result<_>>()?;
    raws.into_iter().map(decode_item).collect()
}

/// All items currently in `status`, oldest first.
pub fn list_by_status(db: &DbState, status: Status) -> Result<Vec<QueueItem>, SyncError> {
    let conn = db.lock()?;
    let sql = format!(
        "SELECT {ITEM_COLUMNS} FROM sync_queue WHERE status = '{}'
         ORDER BY created_at ASC, rowid ASC",
        status.as_str()
    );
    Ok(collect_items(&conn, &sql)?)
}

/// The candidate set for one drain cycle: pending items plus failed items
/// with retry budget remaining, in enqueue order. Dead letters are excluded.
pub fn eligible_for_drain(db: &DbState) -> Result<Vec<QueueItem>, SyncError> {
    let conn = db.lock()?;
    let sql = format!(
        "SELECT {ITEM_COLUMNS} FROM sync_queue
         WHERE status = 'pending'
            OR (status = 'failed' AND retry_count < max_retries)
         ORDER BY created_at ASC, rowid ASC"
    );
    Ok(collect_items(&conn, &sql)?)
}

/// Failed items whose retry budget is exhausted, for operator review.
pub fn dead_letters(db: &DbState) -> Result<Vec<QueueItem>, SyncError> {
    let conn = db.lock()?;
    let sql = format!(
        "SELECT {ITEM_COLUMNS} FROM sync_queue
         WHERE status = 'failed' AND retry_count >= max_retries
         ORDER BY created_at ASC, rowid ASC"
    );
    Ok(collect_items(&conn, &sql)?)
}

/// Items still awaiting remote acknowledgment (pending or in flight).
pub fn pending_count(db: &DbState) -> Result<i64, SyncError> {
    let conn = db.lock()?;
    let count = conn.query_row(
        "SELECT COUNT(*) FROM sync_queue WHERE status IN ('pending', 'processing')",
        [],
        |row| row.get(0),
    )?;
    Ok(count)
}

/// Per-status counts for the sync-health indicator.
pub fn status_summary(db: &DbState) -> Result<StatusSummary, SyncError> {
    let conn = db.lock()?;
    let mut summary = StatusSummary::default();

    let mut stmt = conn.prepare(
        "SELECT status, CASE WHEN status = 'failed' AND retry_count >= max_retries
                             THEN 1 ELSE 0 END AS dead, COUNT(*)
         FROM sync_queue GROUP BY status, dead",
    )?;
    let rows: Vec<(String, i64, i64)> = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
        .collect::<rusqlite::Result<_>>()?;

    for (status, dead, count) in rows {
        match (status.as_str(), dead) {
            ("pending", _) => summary.pending += count,
            ("processing", _) => summary.processing += count,
            ("completed", _) => summary.completed += count,
            ("failed", 1) => summary.dead_letter += count,
            ("failed", _) => summary.failed += count,
            _ => {}
        }
    }

    Ok(summary)
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

/// Move an item to `new_status`, enforcing the queue state machine:
///
/// - pending -> processing
/// - processing -> completed (stamps `completed_at`)
/// - processing -> failed (increments `retry_count`, records `error`)
/// - failed -> processing, only while `retry_count < max_retries`
///
/// Everything else is an illegal transition. Returns the updated item.
pub fn transition(
    db: &DbState,
    id: &str,
    new_status: Status,
    error: Option<&str>,
) -> Result<QueueItem, SyncError> {
    let conn = db.lock()?;
    let item = get_on(&conn, id)?
        .ok_or_else(|| ValidationError::UnknownQueueItem(id.to_string()))?;
    let now = Utc::now().to_rfc3339();

    match (item.status, new_status) {
        (Status::Pending, Status::Processing) => {
            conn.execute(
                "UPDATE sync_queue SET status = 'processing', updated_at = ?1 WHERE id = ?2",
                params![now, id],
            )
            .map_err(StorageError::from)?;
        }
        (Status::Failed, Status::Processing) => {
            if item.retry_count >= item.max_retries {
                return Err(ValidationError::RetriesExhausted(id.to_string()).into());
            }
            conn.execute(
                "UPDATE sync_queue SET status = 'processing', updated_at = ?1 WHERE id = ?2",
                params![now, id],
            )
            .map_err(StorageError::from)?;
        }
        (Status::Processing, Status::Completed) => {
            conn.execute(
                "UPDATE sync_queue SET status = 'completed', completed_at = ?1,
                        last_error = NULL, updated_at = ?1
                 WHERE id = ?2",
                params![now, id],
            )
            .map_err(StorageError::from)?;
        }
        (Status::Processing, Status::Failed) => {
            conn.execute(
                "UPDATE sync_queue SET status = 'failed', retry_count = retry_count + 1,
                        last_error = ?1, updated_at = ?2
                 WHERE id = ?3",
                params![error, now, id],
            )
            .map_err(StorageError::from)?;
        }
        (from, to) => {
            return Err(ValidationError::IllegalTransition {
                from: from.as_str().to_string(),
                to: to.as_str().to_string(),
            }
            .into());
        }
    }

    let updated = get_on(&conn, id)?
        .ok_or_else(|| ValidationError::UnknownQueueItem(id.to_string()))?;
    if updated.is_dead_letter() {
        info!(queue_id = %id, retries = updated.retry_count, "queue item dead-lettered");
    }
    Ok(updated)
}

// ---------------------------------------------------------------------------
// Maintenance
// ---------------------------------------------------------------------------

/// Delete completed items older than the retention window. `now` is passed
/// in so the sweep is deterministic under an injected clock.
pub fn purge_completed(
    db: &DbState,
    retention_hours: i64,
    now: DateTime<Utc>,
) -> Result<usize, SyncError> {
    let cutoff = (now - ChronoDuration::hours(retention_hours)).to_rfc3339();
    let conn = db.lock()?;
    let purged = conn
        .execute(
            "DELETE FROM sync_queue
             WHERE status = 'completed'
               AND completed_at IS NOT NULL
               AND julianday(completed_at) <= julianday(?1)",
            params![cutoff],
        )
        .map_err(StorageError::from)?;
    if purged > 0 {
        debug!(purged, "retention sweep removed completed queue items");
    }
    Ok(purged)
}

/// Crash recovery: items stranded in `processing` by an interrupted drain
/// cycle go back to `pending` so a restart never loses a mutation. Run once
/// at engine start, before the first drain.
pub fn recover_stale_processing(db: &DbState) -> Result<usize, SyncError> {
    let conn = db.lock()?;
    let now = Utc::now().to_rfc3339();
    let recovered = conn
        .execute(
            "UPDATE sync_queue SET status = 'pending', updated_at = ?1
             WHERE status = 'processing'",
            params![now],
        )
        .map_err(StorageError::from)?;
    if recovered > 0 {
        info!(recovered, "recovered in-flight queue items from previous run");
    }
    Ok(recovered)
}

// ===========================================================================
// Tests
// ===========================================================================
