//! Engine configuration.
//!
//! Defaults match the shipped terminal build; individual values can be
//! overridden at construction time or persisted to `local_settings` so a
//! terminal keeps its tuning across restarts.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::db::{self, DbState};
use crate::error::StorageError;

/// Settings category used for persisted engine overrides.
const SETTINGS_CATEGORY: &str = "engine";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory holding the SQLite database.
    pub data_dir: PathBuf,

    /// Seconds between drain attempts while online.
    pub drain_interval_secs: u64,

    /// Bound on a single remote call inside a drain cycle. A stalled call
    /// fails the item instead of stalling the rest of the cycle.
    pub item_timeout_secs: u64,

    /// Retry budget per queue item before dead-lettering.
    pub max_retries: i64,

    /// How long completed queue items are kept for audit before the
    /// retention sweep deletes them.
    pub completed_retention_hours: i64,

    /// Flat tax rate applied to the post-discount subtotal (0.24 = 24%).
    pub tax_rate: f64,

    /// Flat excise rate applied to the post-discount share of excisable
    /// line items.
    pub excise_rate: f64,

    /// Product categories subject to excise.
    pub excise_categories: Vec<String>,

    /// Loyalty points accrued per currency unit of post-discount spend.
    pub loyalty_points_per_unit: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("."),
            drain_interval_secs: 30,
            item_timeout_secs: 30,
            max_retries: 3,
            completed_retention_hours: 24,
            tax_rate: 0.0,
            excise_rate: 0.0,
            excise_categories: Vec::new(),
            loyalty_points_per_unit: 1.0,
        }
    }
}

impl EngineConfig {
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Apply any overrides persisted in `local_settings` on top of `self`.
    /// Unparseable stored values are ignored in favor of the current value.
    pub fn load_overrides(mut self, db: &DbState) -> Result<Self, StorageError> {
        let conn = db.lock()?;

        if let Some(v) = db::get_setting(&conn, SETTINGS_CATEGORY, "drain_interval_secs") {
            if let Ok(parsed) = v.parse() {
                self.drain_interval_secs = parsed;
            }
        }
        if let Some(v) = db::get_setting(&conn, SETTINGS_CATEGORY, "item_timeout_secs") {
            if let Ok(parsed) = v.parse() {
                self.item_timeout_secs = parsed;
            }
        }
        if let Some(v) = db::get_setting(&conn, SETTINGS_CATEGORY, "max_retries") {
            if let Ok(parsed) = v.parse() {
                self.max_retries = parsed;
            }
        }
        if let Some(v) = db::get_setting(&conn, SETTINGS_CATEGORY, "completed_retention_hours") {
            if let Ok(parsed) = v.parse() {
                self.completed_retention_hours = parsed;
            }
        }
        if let Some(v) = db::get_setting(&conn, SETTINGS_CATEGORY, "tax_rate") {
            if let Ok(parsed) = v.parse() {
                self.tax_rate = parsed;
            }
        }
        if let Some(v) = db::get_setting(&conn, SETTINGS_CATEGORY, "excise_rate") {
            if let Ok(parsed) = v.parse() {
                self.excise_rate = parsed;
            }
        }
        if let Some(v) = db::get_setting(&conn, SETTINGS_CATEGORY, "excise_categories") {
            if let Ok(parsed) = serde_json::from_str(&v) {
                self.excise_categories = parsed;
            }
        }
        if let Some(v) = db::get_setting(&conn, SETTINGS_CATEGORY, "loyalty_points_per_unit") {
            if let Ok(parsed) = v.parse() {
                self.loyalty_points_per_unit = parsed;
            }
        }

        Ok(self)
    }

    /// Persist the tunable values to `local_settings`.
    pub fn persist(&self, db: &DbState) -> Result<(), StorageError> {
        let conn = db.lock()?;
        db::set_setting(
            &conn,
            SETTINGS_CATEGORY,
            "drain_interval_secs",
            &self.drain_interval_secs.to_string(),
        )?;
        db::set_setting(
            &conn,
            SETTINGS_CATEGORY,
            "item_timeout_secs",
            &self.item_timeout_secs.to_string(),
        )?;
        db::set_setting(
            &conn,
            SETTINGS_CATEGORY,
            "max_retries",
            &self.max_retries.to_string(),
        )?;
        db::set_setting(
            &conn,
            SETTINGS_CATEGORY,
            "completed_retention_hours",
            &self.completed_retention_hours.to_string(),
        )?;
        db::set_setting(&conn, SETTINGS_CATEGORY, "tax_rate", &self.tax_rate.to_string())?;
        db::set_setting(
            &conn,
            SETTINGS_CATEGORY,
            "excise_rate",
            &self.excise_rate.to_string(),
        )?;
        let categories =
            serde_json::to_string(&self.excise_categories).unwrap_or_else(|_| "[]".to_string());
        db::set_setting(&conn, SETTINGS_CATEGORY, "excise_categories", &categories)?;
        db::set_setting(
            &conn,
            SETTINGS_CATEGORY,
            "loyalty_points_per_unit",
            &self.loyalty_points_per_unit.to_string(),
        )?;
        Ok(())
    }
}

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
            db_path: PathBuf::from(":memory:"),
        }
    }

    #[test]
    fn test_persist_and_load_overrides_roundtrip() {
        let db = test_db();
        let mut config = EngineConfig::default();
        config.drain_interval_secs = 12;
        config.max_retries = 5;
        config.tax_rate = 0.24;
        config.excise_categories = vec!["spirits".to_string()];
        config.persist(&db).expect("persist");

        let loaded = EngineConfig::default().load_overrides(&db).expect("load");
        assert_eq!(loaded.drain_interval_secs, 12);
        assert_eq!(loaded.max_retries, 5);
        assert!((loaded.tax_rate - 0.24).abs() < f64::EPSILON);
        assert_eq!(loaded.excise_categories, vec!["spirits".to_string()]);
    }

    #[test]
    fn test_load_overrides_ignores_garbage() {
        let db = test_db();
        {
            let conn = db.lock().unwrap();
            db::set_setting(&conn, "engine", "max_retries", "not-a-number").unwrap();
        }
        let loaded = EngineConfig::default().load_overrides(&db).expect("load");
        assert_eq!(loaded.max_retries, 3, "garbage override falls back to default");
    }
}
