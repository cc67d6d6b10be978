// src/db/lww.rs

//! Last-writer-wins column operations
//!
//! Every LWW column carries a companion `__hlc` timestamp column. Local
//! writes stamp value and timestamp in one UPDATE and record the rows in
//! the outbox; remote writes only land when their timestamp beats the
//! stored one. The clock is advanced past every received timestamp whether
//! or not the value wins.

use crate::db::{Database, Session};
use crate::error::{Error, Operation, Result};
use crate::hlc::Hlc;
use crate::schema::{hlc_column, SYSTEM_ID, SYSTEM_VERSION};
use crate::value::Value;
use rusqlite::OptionalExtension;
use tracing::debug;

/// Pick the winning candidate per the LWW rule: greatest timestamp wins
pub fn merge_candidates(candidates: &[(Value, Hlc)]) -> Option<&(Value, Hlc)> {
    candidates.iter().max_by(|a, b| a.1.cmp(&b.1))
}

impl Session<'_> {
    /// Write LWW columns locally
    ///
    /// Sets each column and its companion timestamp in a single UPDATE over
    /// the rows matching `where_clause` (all rows when None) and records
    /// every touched row in the outbox as a field-level change. Returns the
    /// number of rows updated.
    pub fn update_lww(
        &mut self,
        table: &str,
        values: &[(&str, Value)],
        where_clause: Option<&str>,
        where_args: &[Value],
    ) -> Result<usize> {
        let table_def = self.require_table(table)?.clone();
        if values.is_empty() {
            return Ok(0);
        }
        for (name, value) in values {
            let column = table_def
                .column(name)
                .ok_or_else(|| Error::invalid_data(format!("unknown column '{}.{}'", table, name)))?;
            if !column.is_lww {
                return Err(Error::invalid_data(format!(
                    "column '{}.{}' is not declared LWW",
                    table, name
                )));
            }
            crate::db::records::validate_value(table, column, value)?;
        }

        let hlc = self.now()?;
        let hlc_text = hlc.to_string();
        let where_sql = where_clause
            .map(|w| format!(" WHERE {}", w))
            .unwrap_or_default();

        // Snapshot the affected row ids before mutating so the outbox gets
        // exactly the rows this statement touches
        let select_sql = format!("SELECT \"{}\" FROM \"{}\"{}", SYSTEM_ID, table, where_sql);
        let mut stmt = self.conn.prepare(&select_sql)?;
        let row_ids: Vec<String> = stmt
            .query_map(rusqlite::params_from_iter(where_args.iter()), |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        drop(stmt);
        if row_ids.is_empty() {
            return Ok(0);
        }

        let mut sets = Vec::new();
        let mut args: Vec<Value> = Vec::new();
        for (name, value) in values {
            args.push(value.clone());
            sets.push(format!("\"{}\" = ?{}", name, args.len()));
            args.push(Value::Text(hlc_text.clone()));
            sets.push(format!("\"{}\" = ?{}", hlc_column(name), args.len()));
        }
        args.push(Value::Text(hlc_text.clone()));
        sets.push(format!("\"{}\" = ?{}", SYSTEM_VERSION, args.len()));
        let offset = args.len();
        args.extend(where_args.iter().cloned());

        // Re-number the caller's placeholders after ours
        let where_sql = where_clause
            .map(|w| format!(" WHERE {}", renumber_placeholders(w, offset)))
            .unwrap_or_default();
        let sql = format!("UPDATE \"{}\" SET {}{}", table, sets.join(", "), where_sql);
        let updated = self
            .conn
            .execute(&sql, rusqlite::params_from_iter(args.iter()))
            .map_err(|e| Error::from(e).during(Operation::Update).on_table(table))?;

        for row_id in &row_ids {
            self.mark_dirty(table, row_id, &hlc, false)?;
        }
        self.touch(table);
        Ok(updated)
    }

    /// Apply a remotely written LWW value if it is newer than ours
    ///
    /// Returns true when the incoming value won. The clock is advanced past
    /// the incoming timestamp either way. Missing rows lose silently; the
    /// inbound merge inserts unknown rows through its own path.
    pub fn update_lww_if_newer(
        &mut self,
        table: &str,
        row_id: &str,
        column: &str,
        value: &Value,
        incoming: &Hlc,
    ) -> Result<bool> {
        self.observe(incoming)?;

        let table_def = self.require_table(table)?.clone();
        let column_def = table_def
            .column(column)
            .ok_or_else(|| Error::invalid_data(format!("unknown column '{}.{}'", table, column)))?;
        if !column_def.is_lww {
            return Err(Error::invalid_data(format!(
                "column '{}.{}' is not declared LWW",
                table, column
            )));
        }

        let companion = hlc_column(column);
        let current: Option<Option<String>> = self
            .conn
            .query_row(
                &format!(
                    "SELECT \"{}\" FROM \"{}\" WHERE \"{}\" = ?1",
                    companion, table, SYSTEM_ID
                ),
                [row_id],
                |row| row.get(0),
            )
            .optional()?;

        let Some(current) = current else {
            debug!("lww write to unknown row '{}' in '{}', skipped", row_id, table);
            return Ok(false);
        };

        let newer = match current {
            None => true,
            Some(stored) => incoming > &stored.parse::<Hlc>()?,
        };
        if !newer {
            return Ok(false);
        }

        self.conn.execute(
            &format!(
                "UPDATE \"{}\" SET \"{}\" = ?1, \"{}\" = ?2, \"{}\" = ?2 WHERE \"{}\" = ?3",
                table, column, companion, SYSTEM_VERSION, SYSTEM_ID
            ),
            rusqlite::params![value, incoming.to_string(), row_id],
        )?;
        self.touch(table);
        Ok(true)
    }
}

/// Shift `?N` placeholders in a where clause by `offset`
fn renumber_placeholders(clause: &str, offset: usize) -> String {
    let mut out = String::with_capacity(clause.len());
    let mut chars = clause.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '?' {
            let mut digits = String::new();
            while let Some(&d) = chars.peek() {
                if !d.is_ascii_digit() {
                    break;
                }
                digits.push(d);
                chars.next();
            }
            match digits.parse::<usize>() {
                Ok(n) => out.push_str(&format!("?{}", n + offset)),
                Err(_) => out.push('?'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

impl Database {
    /// [`Session::update_lww`] in its own transaction
    pub fn update_lww(
        &self,
        table: &str,
        values: &[(&str, Value)],
        where_clause: Option<&str>,
        where_args: &[Value],
    ) -> Result<usize> {
        self.transaction(|session| session.update_lww(table, values, where_clause, where_args))
    }

    /// [`Session::update_lww_if_newer`] in its own transaction
    pub fn update_lww_if_newer(
        &self,
        table: &str,
        row_id: &str,
        column: &str,
        value: &Value,
        incoming: &Hlc,
    ) -> Result<bool> {
        self.transaction(|session| session.update_lww_if_newer(table, row_id, column, value, incoming))
    }
}
