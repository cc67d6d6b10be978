// src/db/introspect.rs

//! Live schema introspection
//!
//! Reads what is physically in the database through SQLite's metadata
//! pragmas: `PRAGMA table_info` for columns, `PRAGMA index_list` /
//! `PRAGMA index_info` for indexes, and `sqlite_master` for view
//! definitions. The result only exists during migration planning.

use crate::error::Result;
use crate::schema::{hlc_column, HLC_SUFFIX};
use rusqlite::Connection;

/// A column as reported by `PRAGMA table_info`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveColumn {
    pub name: String,
    pub declared_type: String,
    pub not_null: bool,
    pub default: Option<String>,
    /// 1-based position within the primary key, None if not part of it
    pub pk_ordinal: Option<u32>,
}

/// An index as reported by `PRAGMA index_list` / `PRAGMA index_info`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveIndex {
    pub name: String,
    pub unique: bool,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveTable {
    pub name: String,
    pub columns: Vec<LiveColumn>,
    pub indexes: Vec<LiveIndex>,
}

impl LiveTable {
    pub fn column(&self, name: &str) -> Option<&LiveColumn> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Primary key column names in key order
    pub fn primary_key_columns(&self) -> Vec<String> {
        let mut pk: Vec<&LiveColumn> = self.columns.iter().filter(|c| c.pk_ordinal.is_some()).collect();
        pk.sort_by_key(|c| c.pk_ordinal);
        pk.iter().map(|c| c.name.clone()).collect()
    }

    /// A column is LWW on disk iff its companion timestamp column exists
    pub fn is_lww_column(&self, name: &str) -> bool {
        !name.ends_with(HLC_SUFFIX) && self.column(&hlc_column(name)).is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveView {
    pub name: String,
    /// The stored CREATE VIEW statement text
    pub sql: String,
}

/// Everything currently in the database
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveSchema {
    pub tables: Vec<LiveTable>,
    pub views: Vec<LiveView>,
}

impl LiveSchema {
    pub fn table(&self, name: &str) -> Option<&LiveTable> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub fn view(&self, name: &str) -> Option<&LiveView> {
        self.views.iter().find(|v| v.name == name)
    }
}

/// Read the current physical schema
pub fn introspect(conn: &Connection) -> Result<LiveSchema> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master
         WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
         ORDER BY name",
    )?;
    let names: Vec<String> = stmt
        .query_map([], |row| row.get(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut tables = Vec::with_capacity(names.len());
    for name in names {
        tables.push(introspect_table(conn, &name)?);
    }

    let mut stmt = conn.prepare(
        "SELECT name, sql FROM sqlite_master WHERE type = 'view' ORDER BY name",
    )?;
    let views: Vec<LiveView> = stmt
        .query_map([], |row| {
            Ok(LiveView {
                name: row.get(0)?,
                sql: row.get(1)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(LiveSchema { tables, views })
}

fn introspect_table(conn: &Connection, table: &str) -> Result<LiveTable> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info(\"{}\")", table))?;
    let columns: Vec<LiveColumn> = stmt
        .query_map([], |row| {
            let pk: u32 = row.get(5)?;
            Ok(LiveColumn {
                name: row.get(1)?,
                declared_type: row.get(2)?,
                not_null: row.get::<_, i64>(3)? != 0,
                default: row.get(4)?,
                pk_ordinal: (pk > 0).then_some(pk),
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut stmt = conn.prepare(&format!("PRAGMA index_list(\"{}\")", table))?;
    let index_heads: Vec<(String, bool, String)> = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)? != 0,
                row.get::<_, String>(3)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut indexes = Vec::new();
    for (name, unique, origin) in index_heads {
        // Engine-internal indexes backing primary keys and inline UNIQUE
        // constraints are not part of the declared key set
        if origin == "pk" || name.starts_with("sqlite_autoindex_") {
            continue;
        }
        let mut stmt = conn.prepare(&format!("PRAGMA index_info(\"{}\")", name))?;
        let columns: Vec<String> = stmt
            .query_map([], |row| row.get::<_, Option<String>>(2))?
            .collect::<std::result::Result<Vec<_>, _>>()?
            .into_iter()
            .flatten()
            .collect();
        indexes.push(LiveIndex {
            name,
            unique,
            columns,
        });
    }

    Ok(LiveTable {
        name: table.to_string(),
        columns,
        indexes,
    })
}
