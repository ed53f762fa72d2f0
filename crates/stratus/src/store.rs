//! SQLite persistence layer — cache entries, quotas, weights, forecast
//! ledger, verification records.
//!
//! One database file (default `~/.stratus/stratus.db`) holds every
//! durable table. Higher-level components own the semantics; this
//! module owns the schema and the queries.

use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

use crate::provider::{DailyExtremes, SourceSnapshot};

/// Errors from persistence operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown provider: {0}")]
    UnknownProvider(String),
    #[error("store lock poisoned: {0}")]
    LockPoisoned(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// SQLite-backed store.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) the database at the given path.
    ///
    /// Creates all tables if they don't exist. Sets WAL journal mode
    /// and file permissions to 0600 (owner read/write only).
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        // WAL mode for better concurrent read performance
        conn.pragma_update(None, "journal_mode", "WAL")?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS cache_entries (
                provider    TEXT PRIMARY KEY,
                fetched_at  INTEGER NOT NULL,
                snapshot    TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS quota_counters (
                provider    TEXT PRIMARY KEY,
                day_index   INTEGER NOT NULL,
                calls_used  INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS weights (
                provider     TEXT PRIMARY KEY,
                weight       REAL NOT NULL,
                updated_day  INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS forecasts (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                provider    TEXT NOT NULL,
                run_day     INTEGER NOT NULL,
                target_day  INTEGER NOT NULL,
                temp_high   REAL NOT NULL,
                temp_low    REAL NOT NULL,
                UNIQUE(provider, run_day, target_day)
            );
            CREATE INDEX IF NOT EXISTS idx_forecasts_lookup
                ON forecasts(run_day, target_day);

            CREATE TABLE IF NOT EXISTS observations (
                day          INTEGER PRIMARY KEY,
                actual_high  REAL NOT NULL,
                actual_low   REAL NOT NULL
            );

            CREATE TABLE IF NOT EXISTS runs (
                run_day     INTEGER PRIMARY KEY,
                run_id      TEXT NOT NULL,
                created_at  INTEGER NOT NULL,
                artifact    TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS verification_records (
                day             INTEGER PRIMARY KEY,
                schema_version  INTEGER NOT NULL,
                record          TEXT NOT NULL
            );",
        )?;

        // Set file permissions to 0600 (owner read/write only)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if path.exists() {
                let perms = std::fs::Permissions::from_mode(0o600);
                std::fs::set_permissions(path, perms)?;
            }
        }

        Ok(Self { conn })
    }

    // ── Cache entries ───────────────────────────────────────────────

    /// Overwrite the provider's last-known-good snapshot.
    pub fn save_lkg(&self, provider: &str, fetched_at: i64, snapshot: &SourceSnapshot) -> Result<()> {
        let payload = serde_json::to_string(snapshot)?;
        self.conn.execute(
            "INSERT INTO cache_entries (provider, fetched_at, snapshot) \
             VALUES (?1, ?2, ?3) \
             ON CONFLICT(provider) DO UPDATE SET \
                fetched_at = excluded.fetched_at, \
                snapshot = excluded.snapshot",
            params![provider, fetched_at, payload],
        )?;
        Ok(())
    }

    /// Load the provider's last-known-good snapshot and its fetch time.
    pub fn load_lkg(&self, provider: &str) -> Result<Option<(i64, SourceSnapshot)>> {
        let row: Option<(i64, String)> = self
            .conn
            .query_row(
                "SELECT fetched_at, snapshot FROM cache_entries WHERE provider = ?1",
                params![provider],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match row {
            Some((fetched_at, payload)) => {
                let snapshot: SourceSnapshot = serde_json::from_str(&payload)?;
                Ok(Some((fetched_at, snapshot)))
            }
            None => Ok(None),
        }
    }

    // ── Quota counters ──────────────────────────────────────────────

    pub fn quota_counter(&self, provider: &str) -> Result<Option<(i64, u32)>> {
        Ok(self
            .conn
            .query_row(
                "SELECT day_index, calls_used FROM quota_counters WHERE provider = ?1",
                params![provider],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?)
    }

    pub fn set_quota_counter(&self, provider: &str, day_index: i64, calls_used: u32) -> Result<()> {
        self.conn.execute(
            "INSERT INTO quota_counters (provider, day_index, calls_used) \
             VALUES (?1, ?2, ?3) \
             ON CONFLICT(provider) DO UPDATE SET \
                day_index = excluded.day_index, \
                calls_used = excluded.calls_used",
            params![provider, day_index, calls_used],
        )?;
        Ok(())
    }

    // ── Weights ─────────────────────────────────────────────────────

    pub fn load_weights(&self) -> Result<Vec<(String, f64)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT provider, weight FROM weights ORDER BY provider")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::from)
    }

    pub fn save_weight(&self, provider: &str, weight: f64, updated_day: i64) -> Result<()> {
        self.conn.execute(
            "INSERT INTO weights (provider, weight, updated_day) \
             VALUES (?1, ?2, ?3) \
             ON CONFLICT(provider) DO UPDATE SET \
                weight = excluded.weight, \
                updated_day = excluded.updated_day",
            params![provider, weight, updated_day],
        )?;
        Ok(())
    }

    // ── Forecast ledger ─────────────────────────────────────────────

    /// Record what a provider predicted for a target day.
    ///
    /// Write-once per (provider, run_day, target_day); returns false if
    /// a record already existed.
    pub fn log_forecast(
        &self,
        provider: &str,
        run_day: i64,
        target_day: i64,
        extremes: DailyExtremes,
    ) -> Result<bool> {
        let n = self.conn.execute(
            "INSERT OR IGNORE INTO forecasts \
             (provider, run_day, target_day, temp_high, temp_low) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![provider, run_day, target_day, extremes.high, extremes.low],
        )?;
        Ok(n > 0)
    }

    /// One provider's prediction from `run_day` for `target_day`.
    pub fn forecast_for(
        &self,
        provider: &str,
        run_day: i64,
        target_day: i64,
    ) -> Result<Option<DailyExtremes>> {
        Ok(self
            .conn
            .query_row(
                "SELECT temp_high, temp_low FROM forecasts \
                 WHERE provider = ?1 AND run_day = ?2 AND target_day = ?3",
                params![provider, run_day, target_day],
                |row| {
                    Ok(DailyExtremes {
                        high: row.get(0)?,
                        low: row.get(1)?,
                    })
                },
            )
            .optional()?)
    }

    /// All providers' predictions from `run_day` for `target_day`.
    pub fn forecasts_run_on(
        &self,
        run_day: i64,
        target_day: i64,
    ) -> Result<Vec<(String, DailyExtremes)>> {
        let mut stmt = self.conn.prepare(
            "SELECT provider, temp_high, temp_low FROM forecasts \
             WHERE run_day = ?1 AND target_day = ?2 ORDER BY provider",
        )?;
        let rows = stmt.query_map(params![run_day, target_day], |row| {
            Ok((
                row.get(0)?,
                DailyExtremes {
                    high: row.get(1)?,
                    low: row.get(2)?,
                },
            ))
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::from)
    }

    // ── Observations ────────────────────────────────────────────────

    /// Record the observed high/low for a day (replaces on re-ingest).
    pub fn ingest_observation(&self, day: i64, extremes: DailyExtremes) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO observations (day, actual_high, actual_low) \
             VALUES (?1, ?2, ?3)",
            params![day, extremes.high, extremes.low],
        )?;
        Ok(())
    }

    pub fn observation(&self, day: i64) -> Result<Option<DailyExtremes>> {
        Ok(self
            .conn
            .query_row(
                "SELECT actual_high, actual_low FROM observations WHERE day = ?1",
                params![day],
                |row| {
                    Ok(DailyExtremes {
                        high: row.get(0)?,
                        low: row.get(1)?,
                    })
                },
            )
            .optional()?)
    }

    // ── Run artifacts ───────────────────────────────────────────────

    /// Persist a run artifact, write-once per generation day.
    ///
    /// Returns false if a run for the day was already recorded (the
    /// existing artifact wins; supersession is a new day, not an edit).
    pub fn save_run(&self, run_day: i64, run_id: &str, created_at: i64, artifact: &str) -> Result<bool> {
        let n = self.conn.execute(
            "INSERT OR IGNORE INTO runs (run_day, run_id, created_at, artifact) \
             VALUES (?1, ?2, ?3, ?4)",
            params![run_day, run_id, created_at, artifact],
        )?;
        Ok(n > 0)
    }

    pub fn load_run(&self, run_day: i64) -> Result<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT artifact FROM runs WHERE run_day = ?1",
                params![run_day],
                |row| row.get(0),
            )
            .optional()?)
    }

    // ── Verification ledger ─────────────────────────────────────────

    /// Append a verification record; write-once per day.
    pub fn append_verification(&self, day: i64, schema_version: u32, record: &str) -> Result<bool> {
        let n = self.conn.execute(
            "INSERT OR IGNORE INTO verification_records (day, schema_version, record) \
             VALUES (?1, ?2, ?3)",
            params![day, schema_version, record],
        )?;
        Ok(n > 0)
    }

    pub fn load_verification(&self, day: i64) -> Result<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT record FROM verification_records WHERE day = ?1",
                params![day],
                |row| row.get(0),
            )
            .optional()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{Metric, Reading, TrustTier};
    use tempfile::tempdir;

    /// Helper: create an in-tempdir Store instance.
    /// Returns (Store, TempDir) so the tempdir stays alive.
    fn test_store() -> (Store, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = Store::open(&dir.path().join("test.db")).unwrap();
        (store, dir)
    }

    fn sample_snapshot(provider: &str, fetched_at: i64) -> SourceSnapshot {
        SourceSnapshot {
            provider: provider.into(),
            readings: vec![
                Reading::new(provider, fetched_at, Metric::Temperature, 7.5),
                Reading::new(provider, fetched_at, Metric::WindSpeed, 3.0),
            ],
            fetched_at,
            trust_tier: TrustTier::Fresh,
            is_synthesized: false,
        }
    }

    #[test]
    fn open_twice_idempotent() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        Store::open(&db_path).unwrap();
        Store::open(&db_path).unwrap(); // should not error
    }

    #[test]
    fn lkg_roundtrip_and_overwrite() {
        let (store, _dir) = test_store();
        assert!(store.load_lkg("nws").unwrap().is_none());

        store.save_lkg("nws", 1_000, &sample_snapshot("nws", 1_000)).unwrap();
        let (at, snap) = store.load_lkg("nws").unwrap().unwrap();
        assert_eq!(at, 1_000);
        assert_eq!(snap.readings.len(), 2);

        // Overwrite, never cleared
        store.save_lkg("nws", 2_000, &sample_snapshot("nws", 2_000)).unwrap();
        let (at, _) = store.load_lkg("nws").unwrap().unwrap();
        assert_eq!(at, 2_000);
    }

    #[test]
    fn quota_counter_roundtrip() {
        let (store, _dir) = test_store();
        assert!(store.quota_counter("accuweather").unwrap().is_none());
        store.set_quota_counter("accuweather", 19_700, 41).unwrap();
        assert_eq!(store.quota_counter("accuweather").unwrap(), Some((19_700, 41)));
        store.set_quota_counter("accuweather", 19_701, 0).unwrap();
        assert_eq!(store.quota_counter("accuweather").unwrap(), Some((19_701, 0)));
    }

    #[test]
    fn weights_roundtrip() {
        let (store, _dir) = test_store();
        store.save_weight("nws", 3.5, 19_700).unwrap();
        store.save_weight("met_no", 2.0, 19_700).unwrap();
        let rows = store.load_weights().unwrap();
        assert_eq!(rows, vec![("met_no".into(), 2.0), ("nws".into(), 3.5)]);
    }

    #[test]
    fn forecast_write_once() {
        let (store, _dir) = test_store();
        let ext = DailyExtremes { high: 21.0, low: 8.0 };
        assert!(store.log_forecast("nws", 100, 102, ext).unwrap());
        // Duplicate is ignored
        let ext2 = DailyExtremes { high: 25.0, low: 9.0 };
        assert!(!store.log_forecast("nws", 100, 102, ext2).unwrap());
        let stored = store.forecast_for("nws", 100, 102).unwrap().unwrap();
        assert_eq!(stored.high, 21.0);
    }

    #[test]
    fn forecasts_run_on_filters() {
        let (store, _dir) = test_store();
        let ext = DailyExtremes { high: 20.0, low: 10.0 };
        store.log_forecast("a", 100, 102, ext).unwrap();
        store.log_forecast("b", 100, 102, ext).unwrap();
        store.log_forecast("a", 101, 102, ext).unwrap();
        let rows = store.forecasts_run_on(100, 102).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].0, "a");
        assert_eq!(rows[1].0, "b");
    }

    #[test]
    fn observation_replaces() {
        let (store, _dir) = test_store();
        store.ingest_observation(102, DailyExtremes { high: 19.0, low: 7.0 }).unwrap();
        store.ingest_observation(102, DailyExtremes { high: 19.5, low: 7.0 }).unwrap();
        let obs = store.observation(102).unwrap().unwrap();
        assert_eq!(obs.high, 19.5);
    }

    #[test]
    fn run_artifact_write_once() {
        let (store, _dir) = test_store();
        assert!(store.save_run(102, "run-1", 1_000, "{\"points\":[]}").unwrap());
        assert!(!store.save_run(102, "run-2", 2_000, "{}").unwrap());
        assert_eq!(store.load_run(102).unwrap().unwrap(), "{\"points\":[]}");
    }

    #[test]
    fn verification_append_once() {
        let (store, _dir) = test_store();
        assert!(store.append_verification(102, 1, "{}").unwrap());
        assert!(!store.append_verification(102, 1, "{\"v\":2}").unwrap());
        assert_eq!(store.load_verification(102).unwrap().unwrap(), "{}");
        assert!(store.load_verification(103).unwrap().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn file_permissions_0600() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("secure.db");
        Store::open(&db_path).unwrap();
        let perms = std::fs::metadata(&db_path).unwrap().permissions();
        assert_eq!(perms.mode() & 0o777, 0o600);
    }
}
