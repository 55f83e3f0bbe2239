//! Error taxonomy for the sync engine.
//!
//! Three families: storage faults (local SQLite), network faults (remote
//! authority), and validation faults (rejected before anything is written).
//! "Record not found" is never an error — readers return `Option`/empty
//! collections — but quota exhaustion, corruption, and migration failures
//! always propagate.

use thiserror::Error;

/// Faults raised by the local durable store.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The database or its filesystem ran out of space. Distinct from every
    /// other storage fault so callers can surface it to the operator.
    #[error("local storage quota exceeded: {0}")]
    QuotaExceeded(String),

    /// A schema migration failed. The store is unusable until resolved.
    #[error("schema migration failed: {0}")]
    Migration(String),

    /// A stored record could not be decoded back into its domain type.
    #[error("corrupted record in local store: {0}")]
    Corrupted(String),

    /// The connection mutex was poisoned by a panicking thread.
    #[error("local store lock poisoned")]
    Poisoned,

    /// Any other SQLite-level failure.
    #[error("storage failure: {0}")]
    Sqlite(rusqlite::Error),
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(inner, _)
                if inner.code == rusqlite::ErrorCode::DiskFull =>
            {
                StorageError::QuotaExceeded(err.to_string())
            }
            _ => StorageError::Sqlite(err),
        }
    }
}

/// Faults raised while talking to the remote authority. Every variant is
/// retryable from the engine's perspective; classification exists for
/// operator-facing messages, not for retry policy.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("connection to {url} timed out")]
    Timeout { url: String },

    #[error("cannot reach remote authority at {url}: {detail}")]
    Unreachable { url: String, detail: String },

    #[error("terminal is offline")]
    Offline,

    #[error("remote authority rejected the request (HTTP {status}): {message}")]
    Status { status: u16, message: String },

    #[error("invalid response from remote authority: {0}")]
    InvalidResponse(String),

    #[error("failed to build HTTP client: {0}")]
    Client(String),
}

/// A mutation rejected before anything was written. Validation always
/// happens before enqueue so a bad payload can never occupy the ledger.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("mutation payload must be a JSON object")]
    PayloadNotObject,

    #[error("mutation payload is missing a record id")]
    MissingRecordId,

    #[error("order draft has no line items")]
    NoLineItems,

    #[error("line item {product_id} has non-positive quantity {quantity}")]
    NonPositiveQuantity { product_id: String, quantity: i64 },

    #[error("line item {product_id} has negative unit price")]
    NegativePrice { product_id: String },

    #[error("discount cannot be negative")]
    NegativeDiscount,

    #[error("product {0} not found in local catalog")]
    UnknownProduct(String),

    #[error("queue item {0} not found")]
    UnknownQueueItem(String),

    #[error("illegal queue transition {from} -> {to}")]
    IllegalTransition { from: String, to: String },

    #[error("queue item {0} has exhausted its retry budget")]
    RetriesExhausted(String),

    #[error("stock delta must be non-zero")]
    ZeroDelta,
}

/// Crate-level error: the sum of the three families.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

impl From<rusqlite::Error> for SyncError {
    fn from(err: rusqlite::Error) -> Self {
        SyncError::Storage(err.into())
    }
}
