// src/db/outbox.rs

//! Dirty-row outbox
//!
//! Every locally originated write records `(table, row_id, hlc, is_full_row)`
//! in `__dirty_rows`, upserting on `(table, row_id)`. Removal after a server
//! ack matches the exact recorded tuple, so a row modified again during the
//! sync round-trip keeps its newer dirty record. Callers never hold a lock
//! across the sync; the tuple match is the whole concurrency discipline.

use crate::db::{Database, Session};
use crate::error::{Operation, Result};
use crate::hlc::Hlc;
use rusqlite::{params, Connection, Row};

/// One pending outbound change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirtyRow {
    pub table: String,
    pub row_id: String,
    pub hlc: Hlc,
    /// True when the whole row must be sent (insert/update/delete), false
    /// for field-level LWW writes
    pub is_full_row: bool,
}

impl DirtyRow {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let hlc_text: String = row.get(2)?;
        let hlc = hlc_text.parse::<Hlc>().map_err(|_| {
            rusqlite::Error::FromSqlConversionFailure(
                2,
                rusqlite::types::Type::Text,
                format!("malformed hlc '{}'", hlc_text).into(),
            )
        })?;
        Ok(Self {
            table: row.get(0)?,
            row_id: row.get(1)?,
            hlc,
            is_full_row: row.get::<_, i64>(3)? != 0,
        })
    }
}

const SELECT: &str =
    "SELECT table_name, row_id, hlc, is_full_row FROM __dirty_rows";

impl Session<'_> {
    /// Record a pending change; newer writes upsert. A full-row flag is
    /// sticky: once a row needs full sync, field-level writes cannot
    /// downgrade it.
    pub(crate) fn mark_dirty(
        &mut self,
        table: &str,
        row_id: &str,
        hlc: &Hlc,
        is_full_row: bool,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO __dirty_rows (table_name, row_id, hlc, is_full_row)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(table_name, row_id) DO UPDATE SET
                 hlc = excluded.hlc,
                 is_full_row = max(__dirty_rows.is_full_row, excluded.is_full_row)",
            params![table, row_id, hlc.to_string(), is_full_row as i64],
        )?;
        self.touch("__dirty_rows");
        Ok(())
    }
}

fn query_dirty(conn: &Connection, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<DirtyRow>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(args, DirtyRow::from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

impl Database {
    /// Record a pending change outside a batch
    pub fn mark_dirty(&self, table: &str, row_id: &str, hlc: &Hlc, is_full_row: bool) -> Result<()> {
        self.transaction(|session| session.mark_dirty(table, row_id, hlc, is_full_row))
    }

    /// All pending changes, oldest first
    pub fn get_all_dirty(&self) -> Result<Vec<DirtyRow>> {
        let conn = self.lock_conn()?;
        query_dirty(&conn, &format!("{} ORDER BY hlc ASC", SELECT), &[])
    }

    /// Pending changes for one table, oldest first
    pub fn get_dirty_for_table(&self, table: &str) -> Result<Vec<DirtyRow>> {
        let conn = self.lock_conn()?;
        query_dirty(
            &conn,
            &format!("{} WHERE table_name = ?1 ORDER BY hlc ASC", SELECT),
            &[&table],
        )
    }

    /// Acknowledge synced entries
    ///
    /// Deletes only rows matching the full `(table, row_id, hlc,
    /// is_full_row)` tuple; an entry upserted with a newer hlc since the
    /// snapshot was taken survives untouched.
    pub fn remove_dirty(&self, entries: &[DirtyRow]) -> Result<()> {
        self.transaction(|session| {
            for entry in entries {
                session
                    .conn
                    .execute(
                        "DELETE FROM __dirty_rows
                         WHERE table_name = ?1 AND row_id = ?2 AND hlc = ?3 AND is_full_row = ?4",
                        params![
                            entry.table,
                            entry.row_id,
                            entry.hlc.to_string(),
                            entry.is_full_row as i64
                        ],
                    )
                    .map_err(|e| crate::error::Error::from(e).during(Operation::Delete))?;
            }
            session.touch("__dirty_rows");
            Ok(())
        })
    }
}
