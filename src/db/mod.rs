// src/db/mod.rs

//! Database engine core
//!
//! This module owns the SQLite connection and everything hanging off it:
//! - Opening a database and applying pragmas
//! - Transaction handling with bounded retry on lock contention
//! - The `__settings` key/value store
//! - The per-database HLC clock and stream registry
//!
//! All SQL access is serialized through one connection guarded by a mutex;
//! public mutations run as one transaction each unless the caller batches
//! them with [`Database::transaction`]. Change notifications are emitted
//! once per committed transaction with the union of affected tables.

pub mod diff;
pub mod introspect;
pub mod lww;
pub mod migrate;
pub mod outbox;
pub mod query;
pub mod records;
pub mod streams;
pub mod sync;

use crate::error::{Category, DbError, Error, Operation, Result};
use crate::files::FileRepository;
use crate::hlc::{Hlc, HlcClock};
use crate::schema::Schema;
use rusqlite::Connection;
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// `__settings` key holding the node id assigned on first open
const SETTING_NODE_ID: &str = "hlc_node_id";
/// `__settings` key holding the persisted clock state (`ms:counter`)
const SETTING_HLC_STATE: &str = "hlc_state";
/// `__settings` key holding the fingerprint of the last migrated schema
pub(crate) const SETTING_SCHEMA_HASH: &str = "schema_hash";

/// Retry budget for lock contention inside mutating operations
const MAX_LOCK_RETRIES: u32 = 5;
const LOCK_RETRY_BASE_MS: u64 = 50;

/// A local-first database: one SQLite file plus the declarative schema,
/// clock, outbox, stream registry, and optional file repository
pub struct Database {
    conn: Mutex<Connection>,
    schema: Schema,
    clock: Mutex<HlcClock>,
    streams: streams::StreamRegistry,
    repository: Option<Arc<dyn FileRepository>>,
}

impl Database {
    /// Open (or create) a database at the given path
    ///
    /// Applies pragmas, creates the system tables, and restores the HLC
    /// clock. The declarative schema is not applied until
    /// [`Database::migrate`] runs.
    pub fn open(db_path: impl AsRef<Path>, schema: Schema) -> Result<Self> {
        let db_path = db_path.as_ref();
        debug!("Opening database at: {}", db_path.display());

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| Error::from(e).during(Operation::Connection))?;
            }
        }

        let conn =
            Connection::open(db_path).map_err(|e| Error::from(e).during(Operation::Connection))?;

        // Pragmas for durability and concurrent readers
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA busy_timeout = 5000;
            ",
        )?;

        Self::bootstrap(conn, schema)
    }

    /// Open a private in-memory database, for tests
    pub fn open_in_memory(schema: Schema) -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::from(e).during(Operation::Connection))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Self::bootstrap(conn, schema)
    }

    /// Attach a blob repository for fileset columns
    pub fn with_repository(mut self, repository: Arc<dyn FileRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    fn bootstrap(conn: Connection, schema: Schema) -> Result<Self> {
        migrate::ensure_system_tables(&conn)?;

        let node_id = match get_setting(&conn, SETTING_NODE_ID)? {
            Some(id) => id,
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                put_setting(&conn, SETTING_NODE_ID, &id)?;
                info!("Assigned node id {}", id);
                id
            }
        };

        let clock = match get_setting(&conn, SETTING_HLC_STATE)? {
            Some(state) => {
                let (ms, counter) = parse_clock_state(&state)?;
                HlcClock::restore(node_id, ms, counter)
            }
            None => HlcClock::new(node_id),
        };

        Ok(Self {
            conn: Mutex::new(conn),
            schema,
            clock: Mutex::new(clock),
            streams: streams::StreamRegistry::new(),
            repository: None,
        })
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub(crate) fn repository(&self) -> Result<&Arc<dyn FileRepository>> {
        self.repository
            .as_ref()
            .ok_or_else(|| Error::invalid_data("no file repository configured for this database"))
    }

    pub(crate) fn streams(&self) -> &streams::StreamRegistry {
        &self.streams
    }

    pub(crate) fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| {
            Error::Db(
                DbError::new(Category::ConcurrencyConflict, Operation::Connection)
                    .with_context("connection mutex poisoned"),
            )
        })
    }

    pub(crate) fn lock_clock(&self) -> Result<std::sync::MutexGuard<'_, HlcClock>> {
        self.clock.lock().map_err(|_| {
            Error::Db(
                DbError::new(Category::ConcurrencyConflict, Operation::Connection)
                    .with_context("clock mutex poisoned"),
            )
        })
    }

    /// Emit the next local HLC timestamp
    pub fn now(&self) -> Result<Hlc> {
        Ok(self.lock_clock()?.now())
    }

    /// Advance the clock past a remotely observed timestamp
    pub(crate) fn observe(&self, remote: &Hlc) -> Result<Hlc> {
        Ok(self.lock_clock()?.update(remote))
    }

    /// Run a batch of operations in one transaction
    ///
    /// Everything inside commits or rolls back together; stream
    /// notifications carry the union of affected tables and fire once,
    /// after commit. Lock contention is retried with bounded exponential
    /// backoff, so the closure may run more than once.
    pub fn transaction<T>(&self, mut f: impl FnMut(&mut Session<'_>) -> Result<T>) -> Result<T> {
        let mut attempt = 0;
        loop {
            match self.run_transaction(&mut f) {
                Ok((value, affected)) => {
                    if !affected.is_empty() {
                        self.streams.notify(self, &affected);
                    }
                    return Ok(value);
                }
                Err(e) if e.is_locked() && attempt < MAX_LOCK_RETRIES => {
                    attempt += 1;
                    let delay = LOCK_RETRY_BASE_MS << attempt;
                    warn!("Database locked, retry {} in {}ms", attempt, delay);
                    std::thread::sleep(Duration::from_millis(delay));
                }
                Err(e) => return Err(e.during(Operation::Transaction)),
            }
        }
    }

    fn run_transaction<T>(
        &self,
        f: &mut impl FnMut(&mut Session<'_>) -> Result<T>,
    ) -> Result<(T, HashSet<String>)> {
        let conn = self.lock_conn()?;
        let tx = conn.unchecked_transaction()?;

        let (value, affected) = {
            let mut session = Session {
                conn: &tx,
                db: self,
                affected: HashSet::new(),
            };
            let value = f(&mut session)?;
            (value, session.affected)
        };

        if !affected.is_empty() {
            let (ms, counter) = self.lock_clock()?.state();
            put_setting(&tx, SETTING_HLC_STATE, &format!("{}:{}", ms, counter))?;
        }

        tx.commit()?;
        Ok((value, affected))
    }
}

/// One open transaction on the database
///
/// All mutation APIs live here; [`Database`] convenience wrappers open a
/// single-operation transaction around them. The session records which
/// tables the batch touched so the registry can wake the right streams
/// after commit.
pub struct Session<'a> {
    pub(crate) conn: &'a Connection,
    pub(crate) db: &'a Database,
    pub(crate) affected: HashSet<String>,
}

impl<'a> Session<'a> {
    pub fn schema(&self) -> &Schema {
        self.db.schema()
    }

    /// Record that a table changed in this transaction
    pub(crate) fn touch(&mut self, table: &str) {
        self.affected.insert(table.to_string());
    }

    pub(crate) fn now(&self) -> Result<Hlc> {
        self.db.now()
    }

    pub(crate) fn observe(&self, remote: &Hlc) -> Result<Hlc> {
        self.db.observe(remote)
    }

    /// The declared table, or an InvalidData error naming it
    pub(crate) fn require_table(&self, table: &str) -> Result<&crate::schema::Table> {
        self.db
            .schema()
            .table(table)
            .ok_or_else(|| Error::invalid_data(format!("unknown table '{}'", table)))
    }
}

fn parse_clock_state(state: &str) -> Result<(i64, u32)> {
    let mut parts = state.splitn(2, ':');
    let (ms, counter) = match (parts.next(), parts.next()) {
        (Some(ms), Some(counter)) => (ms, counter),
        _ => return Err(Error::corruption(format!("malformed clock state '{}'", state))),
    };
    let ms = ms
        .parse()
        .map_err(|_| Error::corruption(format!("malformed clock state '{}'", state)))?;
    let counter = counter
        .parse()
        .map_err(|_| Error::corruption(format!("malformed clock state '{}'", state)))?;
    Ok((ms, counter))
}

/// Read a value from `__settings`
pub(crate) fn get_setting(conn: &Connection, key: &str) -> Result<Option<String>> {
    use rusqlite::OptionalExtension;
    let value = conn
        .query_row("SELECT value FROM __settings WHERE key = ?1", [key], |row| {
            row.get(0)
        })
        .optional()?;
    Ok(value)
}

/// Write a value into `__settings`, replacing any existing one
pub(crate) fn put_setting(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO __settings (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        [key, value],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnBuilder, SchemaBuilder, TableBuilder};
    use tempfile::TempDir;

    fn sample_schema() -> Schema {
        SchemaBuilder::new()
            .table(
                TableBuilder::new("users")
                    .column(ColumnBuilder::text("id"))
                    .column(ColumnBuilder::text("name").not_null().default(""))
                    .primary_key(["id"]),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn test_open_creates_database_and_parent_dirs() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("nested/path/store.db");

        let db = Database::open(&db_path, sample_schema());
        assert!(db.is_ok());
        assert!(db_path.exists());
    }

    #[test]
    fn test_open_sets_pragmas() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("store.db");
        let db = Database::open(&db_path, sample_schema()).unwrap();

        let conn = db.lock_conn().unwrap();
        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(journal_mode.to_lowercase(), "wal");
    }

    #[test]
    fn test_node_id_is_stable_across_reopens() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("store.db");

        let first = {
            let db = Database::open(&db_path, sample_schema()).unwrap();
            let conn = db.lock_conn().unwrap();
            get_setting(&conn, SETTING_NODE_ID).unwrap().unwrap()
        };
        let second = {
            let db = Database::open(&db_path, sample_schema()).unwrap();
            let conn = db.lock_conn().unwrap();
            get_setting(&conn, SETTING_NODE_ID).unwrap().unwrap()
        };
        assert_eq!(first, second);
    }

    #[test]
    fn test_settings_round_trip() {
        let db = Database::open_in_memory(sample_schema()).unwrap();
        let conn = db.lock_conn().unwrap();

        assert_eq!(get_setting(&conn, "missing").unwrap(), None);
        put_setting(&conn, "k", "v1").unwrap();
        assert_eq!(get_setting(&conn, "k").unwrap().as_deref(), Some("v1"));
        put_setting(&conn, "k", "v2").unwrap();
        assert_eq!(get_setting(&conn, "k").unwrap().as_deref(), Some("v2"));
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let db = Database::open_in_memory(sample_schema()).unwrap();

        let result: Result<()> = db.transaction(|session| {
            put_setting(session.conn, "doomed", "value")?;
            Err(Error::invalid_data("abort"))
        });
        assert!(result.is_err());

        let conn = db.lock_conn().unwrap();
        assert_eq!(get_setting(&conn, "doomed").unwrap(), None);
    }

    #[test]
    fn test_parse_clock_state() {
        assert_eq!(parse_clock_state("123:7").unwrap(), (123, 7));
        assert!(parse_clock_state("garbage").is_err());
    }
}
