// src/db/records.rs

//! Row records
//!
//! A record is a snapshot of one row plus the set of fields modified since
//! it was loaded. Saving issues the minimal UPDATE covering the dirty set;
//! inserting fills defaults, sequences, system columns and LWW companions.
//! Records carry no connection; they resolve their table through the
//! database on each operation.

use crate::db::{Database, Session};
use crate::error::{Error, Operation, Result};
use crate::schema::{hlc_column, Column, Table, SYSTEM_CREATED_AT, SYSTEM_ID, SYSTEM_VERSION};
use crate::value::Value;
use rusqlite::OptionalExtension;
use std::collections::{HashMap, HashSet};

/// A snapshot of one row and its locally modified fields
#[derive(Debug, Clone)]
pub struct Record {
    table: String,
    system_id: String,
    values: HashMap<String, Value>,
    dirty: HashSet<String>,
}

impl Record {
    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn system_id(&self) -> &str {
        &self.system_id
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.values.get(column)
    }

    /// Stage a new value; the change is written on the next `save`
    pub fn set(&mut self, column: &str, value: impl Into<Value>) {
        self.values.insert(column.to_string(), value.into());
        self.dirty.insert(column.to_string());
    }

    pub fn is_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    pub fn dirty_columns(&self) -> impl Iterator<Item = &str> {
        self.dirty.iter().map(String::as_str)
    }
}

/// Reject values the declared constraints don't allow
pub(crate) fn validate_value(table: &str, column: &Column, value: &Value) -> Result<()> {
    if column.not_null && value.is_null() {
        return Err(Error::invalid_data(format!(
            "column '{}.{}' is NOT NULL",
            table, column.name
        )));
    }
    if let (Some(min), Some(v)) = (column.min_value, value.as_real()) {
        if v < min {
            return Err(Error::invalid_data(format!(
                "column '{}.{}' below minimum {}",
                table, column.name, min
            )));
        }
    }
    if let (Some(max), Some(text)) = (column.max_length, value.as_text()) {
        if text.chars().count() > max {
            return Err(Error::invalid_data(format!(
                "column '{}.{}' exceeds max length {}",
                table, column.name, max
            )));
        }
    }
    Ok(())
}

impl Session<'_> {
    /// Insert a row; unsupplied columns take their declared defaults,
    /// sequence columns their next value
    pub fn insert(&mut self, table: &str, values: Vec<(String, Value)>) -> Result<Record> {
        let table_def = self.require_table(table)?.clone();
        let hlc = self.now()?;

        let mut row: HashMap<String, Value> = HashMap::new();
        for (name, value) in values {
            let column = table_def
                .column(&name)
                .ok_or_else(|| Error::invalid_data(format!("unknown column '{}.{}'", table, name)))?;
            if column.is_engine_managed() {
                return Err(Error::invalid_data(format!(
                    "column '{}.{}' is engine-managed",
                    table, name
                )));
            }
            validate_value(table, column, &value)?;
            row.insert(name, value);
        }

        // Defaults first so sequence scoping can see the parent value
        for column in &table_def.columns {
            if column.is_engine_managed() || column.is_sequence || row.contains_key(&column.name) {
                continue;
            }
            match &column.default {
                Some(default) => {
                    row.insert(column.name.clone(), default.resolve());
                }
                None if column.not_null => {
                    return Err(Error::invalid_data(format!(
                        "missing value for NOT NULL column '{}.{}'",
                        table, column.name
                    )));
                }
                None => {
                    row.insert(column.name.clone(), Value::Null);
                }
            }
        }
        for column in &table_def.columns {
            if column.is_sequence && !row.contains_key(&column.name) {
                let next = self.next_sequence(&table_def, column, &row)?;
                row.insert(column.name.clone(), Value::Integer(next));
            }
        }

        let system_id = uuid::Uuid::new_v4().to_string();
        let hlc_text = hlc.to_string();

        let mut columns = Vec::with_capacity(table_def.columns.len());
        let mut args: Vec<Value> = Vec::with_capacity(table_def.columns.len());
        for column in &table_def.columns {
            let value = match column.name.as_str() {
                SYSTEM_ID => Value::Text(system_id.clone()),
                SYSTEM_VERSION | SYSTEM_CREATED_AT => Value::Text(hlc_text.clone()),
                name if name.ends_with(crate::schema::HLC_SUFFIX) => Value::Text(hlc_text.clone()),
                name => row.get(name).cloned().unwrap_or(Value::Null),
            };
            columns.push(format!("\"{}\"", column.name));
            args.push(value);
        }
        let placeholders: Vec<String> = (1..=args.len()).map(|i| format!("?{}", i)).collect();
        let sql = format!(
            "INSERT INTO \"{}\" ({}) VALUES ({})",
            table,
            columns.join(", "),
            placeholders.join(", ")
        );
        self.conn
            .execute(&sql, rusqlite::params_from_iter(args.iter()))
            .map_err(|e| Error::from(e).during(Operation::Create).on_table(table))?;

        self.mark_dirty(table, &system_id, &hlc, true)?;
        self.touch(table);

        let mut values = row;
        values.insert(SYSTEM_ID.to_string(), Value::Text(system_id.clone()));
        values.insert(SYSTEM_VERSION.to_string(), Value::Text(hlc_text.clone()));
        values.insert(SYSTEM_CREATED_AT.to_string(), Value::Text(hlc_text));
        Ok(Record {
            table: table.to_string(),
            system_id,
            values,
            dirty: HashSet::new(),
        })
    }

    fn next_sequence(&self, table: &Table, column: &Column, row: &HashMap<String, Value>) -> Result<i64> {
        let next: i64 = if column.sequence_per_parent {
            let parent = table.parent_column().ok_or_else(|| {
                Error::invalid_data(format!(
                    "sequence column '{}.{}' has no parent column",
                    table.name, column.name
                ))
            })?;
            let parent_value = row.get(&parent.name).cloned().unwrap_or(Value::Null);
            self.conn.query_row(
                &format!(
                    "SELECT COALESCE(MAX(\"{}\"), 0) + 1 FROM \"{}\" WHERE \"{}\" IS ?1",
                    column.name, table.name, parent.name
                ),
                [&parent_value],
                |r| r.get(0),
            )?
        } else {
            self.conn.query_row(
                &format!(
                    "SELECT COALESCE(MAX(\"{}\"), 0) + 1 FROM \"{}\"",
                    column.name, table.name
                ),
                [],
                |r| r.get(0),
            )?
        };
        Ok(next)
    }

    /// Write the dirty fields back as one minimal UPDATE
    pub fn save(&mut self, record: &mut Record) -> Result<()> {
        if record.dirty.is_empty() {
            return Ok(());
        }
        let table_def = self.require_table(&record.table)?.clone();
        let hlc = self.now()?;
        let hlc_text = hlc.to_string();

        let mut sets = Vec::new();
        let mut args: Vec<Value> = Vec::new();
        // Walk the declaration so the statement shape is deterministic
        for column in &table_def.columns {
            if !record.dirty.contains(&column.name) {
                continue;
            }
            if column.is_engine_managed() {
                return Err(Error::invalid_data(format!(
                    "column '{}.{}' is engine-managed",
                    record.table, column.name
                )));
            }
            let value = record.values.get(&column.name).cloned().unwrap_or(Value::Null);
            validate_value(&record.table, column, &value)?;
            args.push(value);
            sets.push(format!("\"{}\" = ?{}", column.name, args.len()));
            if column.is_lww {
                args.push(Value::Text(hlc_text.clone()));
                sets.push(format!("\"{}\" = ?{}", hlc_column(&column.name), args.len()));
            }
        }
        args.push(Value::Text(hlc_text.clone()));
        sets.push(format!("\"{}\" = ?{}", SYSTEM_VERSION, args.len()));
        args.push(Value::Text(record.system_id.clone()));
        let sql = format!(
            "UPDATE \"{}\" SET {} WHERE \"{}\" = ?{}",
            record.table,
            sets.join(", "),
            SYSTEM_ID,
            args.len()
        );

        let updated = self
            .conn
            .execute(&sql, rusqlite::params_from_iter(args.iter()))
            .map_err(|e| Error::from(e).during(Operation::Update).on_table(&record.table))?;
        if updated == 0 {
            return Err(Error::not_found(
                record.table.clone(),
                format!("row '{}' no longer exists", record.system_id),
            ));
        }

        let table = record.table.clone();
        self.mark_dirty(&table, &record.system_id, &hlc, true)?;
        self.touch(&table);
        record.values.insert(SYSTEM_VERSION.to_string(), Value::Text(hlc_text));
        record.dirty.clear();
        Ok(())
    }

    /// Remove the row; the deletion is recorded in the outbox
    pub fn delete(&mut self, record: Record) -> Result<()> {
        self.require_table(&record.table)?;
        let hlc = self.now()?;

        let deleted = self
            .conn
            .execute(
                &format!("DELETE FROM \"{}\" WHERE \"{}\" = ?1", record.table, SYSTEM_ID),
                [&record.system_id],
            )
            .map_err(|e| Error::from(e).during(Operation::Delete).on_table(&record.table))?;
        if deleted == 0 {
            return Err(Error::not_found(
                record.table.clone(),
                format!("row '{}' no longer exists", record.system_id),
            ));
        }

        self.mark_dirty(&record.table, &record.system_id, &hlc, true)?;
        self.touch(&record.table);
        Ok(())
    }

    /// Load one row by its system id
    pub fn load(&self, table: &str, system_id: &str) -> Result<Option<Record>> {
        self.require_table(table)?;
        load_record(self.conn, table, system_id)
    }
}

pub(crate) fn load_record(
    conn: &rusqlite::Connection,
    table: &str,
    system_id: &str,
) -> Result<Option<Record>> {
    let sql = format!("SELECT * FROM \"{}\" WHERE \"{}\" = ?1", table, SYSTEM_ID);
    let mut stmt = conn.prepare(&sql)?;
    let column_names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();

    let row = stmt
        .query_row([system_id], |row| {
            let mut values = HashMap::with_capacity(column_names.len());
            for (i, name) in column_names.iter().enumerate() {
                values.insert(name.clone(), row.get::<_, Value>(i)?);
            }
            Ok(values)
        })
        .optional()?;

    Ok(row.map(|values| Record {
        table: table.to_string(),
        system_id: system_id.to_string(),
        values,
        dirty: HashSet::new(),
    }))
}

impl Database {
    /// Insert one row in its own transaction
    pub fn insert(&self, table: &str, values: Vec<(String, Value)>) -> Result<Record> {
        self.transaction(|session| session.insert(table, values.clone()))
    }

    /// Save a record's dirty fields in its own transaction
    pub fn save(&self, record: &mut Record) -> Result<()> {
        self.transaction(|session| session.save(record))
    }

    /// Delete a record's row in its own transaction
    pub fn delete(&self, record: Record) -> Result<()> {
        self.transaction(|session| session.delete(record.clone()))
    }

    /// Load one row by its system id
    pub fn load(&self, table: &str, system_id: &str) -> Result<Option<Record>> {
        self.schema()
            .table(table)
            .ok_or_else(|| Error::invalid_data(format!("unknown table '{}'", table)))?;
        let conn = self.lock_conn()?;
        load_record(&conn, table, system_id)
    }
}
