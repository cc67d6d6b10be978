// src/db/sync.rs

//! Inbound merge and the sync round-trip
//!
//! The engine never talks to the network. The application fetches remote
//! rows and hands them to [`Database::apply_server_changes`]; it serializes
//! pending outbox entries through [`Database::sync_once`]'s `on_send`
//! callback and the engine acknowledges them with the lock-free tuple
//! removal.
//!
//! Merge rules per remote row:
//! - unknown `system_id`: the row is inserted whole
//! - LWW columns: applied through the if-newer check, losing silently
//! - non-LWW columns: applied only when the row has no pending local
//!   changes, so local edits are never clobbered mid-sync
//! - the table's server watermark advances to the max observed timestamp

use crate::db::outbox::DirtyRow;
use crate::db::{get_setting, put_setting, Database, Session};
use crate::error::{Error, Result};
use crate::hlc::Hlc;
use crate::schema::{SYSTEM_CREATED_AT, SYSTEM_ID, SYSTEM_VERSION};
use crate::value::Value;
use rusqlite::OptionalExtension;
use std::collections::HashMap;
use tracing::{debug, info};

/// One column of a remote row; LWW columns carry their own timestamp
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteColumn {
    pub name: String,
    pub value: Value,
    pub hlc: Option<Hlc>,
}

/// One row received from the server
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRow {
    pub table: String,
    pub system_id: String,
    /// Server timestamp for the row; also the watermark candidate
    pub hlc: Hlc,
    pub columns: Vec<RemoteColumn>,
}

/// Outcome of one sync round-trip
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncReport {
    /// Outbox entries acknowledged by the server
    pub sent: usize,
}

fn watermark_key(table: &str) -> String {
    format!("watermark_{}", table)
}

impl Database {
    /// Apply a batch of remote rows under LWW semantics
    ///
    /// Single-row conflicts never fail the batch; a malformed payload
    /// (unknown table or column, timestamp on a non-LWW column) raises
    /// `InvalidData` and rolls the whole batch back. Returns the number of
    /// rows processed.
    pub fn apply_server_changes(&self, rows: &[RemoteRow]) -> Result<usize> {
        self.validate_payload(rows)?;
        self.transaction(|session| {
            let mut watermarks: HashMap<String, Hlc> = HashMap::new();
            for row in rows {
                session.merge_remote_row(row)?;
                let mark = watermarks.entry(row.table.clone()).or_insert_with(Hlc::zero);
                if row.hlc > *mark {
                    *mark = row.hlc.clone();
                }
            }
            for (table, mark) in &watermarks {
                let key = watermark_key(table);
                let stored = get_setting(session.conn, &key)?
                    .map(|s| s.parse::<Hlc>())
                    .transpose()?
                    .unwrap_or_else(Hlc::zero);
                if *mark > stored {
                    put_setting(session.conn, &key, &mark.to_string())?;
                }
            }
            info!("applied {} remote row(s)", rows.len());
            Ok(rows.len())
        })
    }

    fn validate_payload(&self, rows: &[RemoteRow]) -> Result<()> {
        for row in rows {
            let table = self.schema().table(&row.table).ok_or_else(|| {
                Error::invalid_data(format!("remote payload names unknown table '{}'", row.table))
            })?;
            if row.system_id.is_empty() {
                return Err(Error::invalid_data(format!(
                    "remote row for '{}' is missing its system id",
                    row.table
                )));
            }
            for column in &row.columns {
                let declared = table.column(&column.name).ok_or_else(|| {
                    Error::invalid_data(format!(
                        "remote payload names unknown column '{}.{}'",
                        row.table, column.name
                    ))
                })?;
                if declared.is_engine_managed() {
                    return Err(Error::invalid_data(format!(
                        "remote payload writes engine-managed column '{}.{}'",
                        row.table, column.name
                    )));
                }
                if column.hlc.is_some() && !declared.is_lww {
                    return Err(Error::invalid_data(format!(
                        "remote payload timestamps non-LWW column '{}.{}'",
                        row.table, column.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// The last server watermark per declared table
    pub fn table_watermarks(&self) -> Result<HashMap<String, Hlc>> {
        let conn = self.lock_conn()?;
        let mut marks = HashMap::new();
        for table in &self.schema().tables {
            let mark = get_setting(&conn, &watermark_key(&table.name))?
                .map(|s| s.parse::<Hlc>())
                .transpose()?
                .unwrap_or_else(Hlc::zero);
            marks.insert(table.name.clone(), mark);
        }
        Ok(marks)
    }

    /// One full sync round-trip
    ///
    /// `on_fetch` receives the database and the per-table watermarks and is
    /// expected to pull remote rows and call `apply_server_changes`.
    /// `on_send` receives the pending outbox snapshot and returns whether
    /// the server accepted it; on success exactly that snapshot is removed,
    /// so rows modified during the round-trip stay pending.
    pub fn sync_once<F, S>(&self, on_fetch: F, on_send: S) -> Result<SyncReport>
    where
        F: FnOnce(&Database, &HashMap<String, Hlc>) -> Result<()>,
        S: FnOnce(&[DirtyRow]) -> Result<bool>,
    {
        let watermarks = self.table_watermarks()?;
        on_fetch(self, &watermarks)?;

        let pending = self.get_all_dirty()?;
        if pending.is_empty() {
            return Ok(SyncReport::default());
        }

        if on_send(&pending)? {
            self.remove_dirty(&pending)?;
            Ok(SyncReport {
                sent: pending.len(),
            })
        } else {
            debug!("server rejected {} pending change(s), keeping outbox", pending.len());
            Ok(SyncReport::default())
        }
    }
}

impl Session<'_> {
    fn merge_remote_row(&mut self, row: &RemoteRow) -> Result<()> {
        self.observe(&row.hlc)?;

        let exists = self
            .conn
            .query_row(
                &format!(
                    "SELECT 1 FROM \"{}\" WHERE \"{}\" = ?1",
                    row.table, SYSTEM_ID
                ),
                [&row.system_id],
                |_| Ok(()),
            )
            .optional()?
            .is_some();

        if !exists {
            return self.insert_remote_row(row);
        }

        for column in &row.columns {
            let declared = self
                .require_table(&row.table)?
                .column(&column.name)
                .cloned()
                .ok_or_else(|| {
                    Error::invalid_data(format!(
                        "unknown column '{}.{}'",
                        row.table, column.name
                    ))
                })?;
            if declared.is_lww {
                let stamp = column.hlc.clone().unwrap_or_else(|| row.hlc.clone());
                self.update_lww_if_newer(&row.table, &row.system_id, &column.name, &column.value, &stamp)?;
            }
        }

        // Non-LWW columns would clobber unsynced local edits; skip them
        // while the row sits in the outbox
        let locally_modified = self
            .conn
            .query_row(
                "SELECT 1 FROM __dirty_rows WHERE table_name = ?1 AND row_id = ?2",
                [&row.table, &row.system_id],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if locally_modified {
            debug!(
                "row '{}' in '{}' has pending local changes, non-LWW fields skipped",
                row.system_id, row.table
            );
            return Ok(());
        }

        let table_def = self.require_table(&row.table)?.clone();
        let mut sets = Vec::new();
        let mut args: Vec<Value> = Vec::new();
        for column in &row.columns {
            let declared = table_def.column(&column.name).ok_or_else(|| {
                Error::invalid_data(format!("unknown column '{}.{}'", row.table, column.name))
            })?;
            if declared.is_lww {
                continue;
            }
            args.push(column.value.clone());
            sets.push(format!("\"{}\" = ?{}", column.name, args.len()));
        }
        if sets.is_empty() {
            return Ok(());
        }
        args.push(Value::Text(row.hlc.to_string()));
        sets.push(format!("\"{}\" = ?{}", SYSTEM_VERSION, args.len()));
        args.push(Value::Text(row.system_id.clone()));
        self.conn.execute(
            &format!(
                "UPDATE \"{}\" SET {} WHERE \"{}\" = ?{}",
                row.table,
                sets.join(", "),
                SYSTEM_ID,
                args.len()
            ),
            rusqlite::params_from_iter(args.iter()),
        )?;
        self.touch(&row.table);
        Ok(())
    }

    /// A row we have never seen: insert it whole, remote values first,
    /// declared defaults for the rest
    fn insert_remote_row(&mut self, row: &RemoteRow) -> Result<()> {
        let table_def = self.require_table(&row.table)?.clone();
        let hlc_text = row.hlc.to_string();

        let mut provided: HashMap<&str, &RemoteColumn> = HashMap::new();
        for column in &row.columns {
            provided.insert(column.name.as_str(), column);
        }

        let mut columns = Vec::with_capacity(table_def.columns.len());
        let mut args: Vec<Value> = Vec::with_capacity(table_def.columns.len());
        for declared in &table_def.columns {
            let value = match declared.name.as_str() {
                SYSTEM_ID => Value::Text(row.system_id.clone()),
                SYSTEM_VERSION | SYSTEM_CREATED_AT => Value::Text(hlc_text.clone()),
                name => {
                    if let Some(base) = name.strip_suffix(crate::schema::HLC_SUFFIX) {
                        match provided.get(base).and_then(|c| c.hlc.clone()) {
                            Some(stamp) => Value::Text(stamp.to_string()),
                            None => Value::Text(hlc_text.clone()),
                        }
                    } else if let Some(remote) = provided.get(name) {
                        remote.value.clone()
                    } else if let Some(default) = &declared.default {
                        default.resolve()
                    } else {
                        Value::Null
                    }
                }
            };
            columns.push(format!("\"{}\"", declared.name));
            args.push(value);
        }

        let placeholders: Vec<String> = (1..=args.len()).map(|i| format!("?{}", i)).collect();
        self.conn.execute(
            &format!(
                "INSERT INTO \"{}\" ({}) VALUES ({})",
                row.table,
                columns.join(", "),
                placeholders.join(", ")
            ),
            rusqlite::params_from_iter(args.iter()),
        )?;
        self.touch(&row.table);
        Ok(())
    }
}
