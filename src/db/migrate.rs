// src/db/migrate.rs

//! Migration planning and execution
//!
//! Turns a schema diff into an ordered list of steps and runs them inside a
//! single transaction: dropped tables first, then alterations (plain ADD
//! COLUMN / index changes where possible, safe recreation otherwise), then
//! new tables, then views. On success the schema fingerprint is written to
//! `__settings`.
//!
//! Safe recreation builds a staging table from the declarative definition,
//! copies the intersection of old and new columns across, drops the old
//! table, renames the staging table into place, and recreates the indexes
//! under their canonical names. Added NOT NULL columns with generator
//! defaults are backfilled row by row.

use crate::db::diff::{diff_schemas, ColumnOp, KeyOp, SchemaChange};
use crate::db::introspect::{introspect, LiveSchema};
use crate::db::{put_setting, Database, SETTING_SCHEMA_HASH};
use crate::error::{Category, Error, Operation, Result};
use crate::schema::{hlc_column, DefaultValue, Schema, Table};
use crate::value::Value;
use rusqlite::Connection;
use std::collections::HashSet;
use tracing::{debug, info};

/// One step of a migration plan
#[derive(Debug, Clone, PartialEq)]
pub enum MigrationStep {
    /// Plain DDL
    Execute { sql: String },
    /// Copy rows from `table` into its staging replacement. `preserved`
    /// columns are carried over; `generated` columns are filled per row
    /// from their declared generator defaults.
    CopyRows {
        table: String,
        staging: String,
        preserved: Vec<String>,
        generated: Vec<String>,
    },
}

impl MigrationStep {
    /// Human-readable form for plan previews
    pub fn describe(&self) -> String {
        match self {
            MigrationStep::Execute { sql } => sql.clone(),
            MigrationStep::CopyRows {
                table,
                staging,
                preserved,
                generated,
            } => format!(
                "COPY {} -> {} ({} preserved, {} generated)",
                table,
                staging,
                preserved.len(),
                generated.len()
            ),
        }
    }
}

/// Create the engine-managed tables; idempotent
pub fn ensure_system_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS __settings (
            key TEXT PRIMARY KEY,
            value TEXT
        );

        CREATE TABLE IF NOT EXISTS __files (
            id TEXT PRIMARY KEY,
            fileset TEXT NOT NULL,
            name TEXT NOT NULL,
            size INTEGER NOT NULL,
            mime TEXT,
            created_at TEXT NOT NULL,
            modified_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx___files_fileset ON __files(fileset);

        CREATE TABLE IF NOT EXISTS __dirty_rows (
            table_name TEXT NOT NULL,
            row_id TEXT NOT NULL,
            hlc TEXT NOT NULL,
            is_full_row INTEGER NOT NULL,
            PRIMARY KEY (table_name, row_id)
        );
        ",
    )?;
    Ok(())
}

fn staging_name(table: &str) -> String {
    format!("__new_{}", table)
}

/// Produce the ordered step list for a set of changes
pub fn plan(schema: &Schema, changes: &[SchemaChange], live: &LiveSchema) -> Result<Vec<MigrationStep>> {
    let mut steps = Vec::new();

    for change in changes {
        if let SchemaChange::DropTable { table } = change {
            steps.push(MigrationStep::Execute {
                sql: format!("DROP TABLE \"{}\"", table),
            });
        }
    }

    for change in changes {
        if let SchemaChange::AlterTable {
            table,
            column_ops,
            key_ops,
            requires_recreate,
        } = change
        {
            let declared = schema
                .table(table)
                .ok_or_else(|| Error::schema_mismatch(format!("no declaration for '{}'", table)))?;

            // ADD COLUMN cannot attach a generator default, so NOT NULL
            // generated columns force the recreate path
            let generated_adds: Vec<&str> = column_ops
                .iter()
                .filter_map(|op| match op {
                    ColumnOp::Add(c)
                        if c.not_null
                            && matches!(c.default, Some(DefaultValue::Generated(_))) =>
                    {
                        Some(c.name.as_str())
                    }
                    _ => None,
                })
                .collect();

            if *requires_recreate || !generated_adds.is_empty() {
                plan_recreate(declared, live, &generated_adds, &mut steps)?;
            } else {
                for op in column_ops {
                    if let ColumnOp::Add(column) = op {
                        steps.push(MigrationStep::Execute {
                            sql: format!(
                                "ALTER TABLE \"{}\" ADD COLUMN {}",
                                table,
                                column.to_column_sql()
                            ),
                        });
                        if column.is_lww {
                            let companion = declared
                                .column(&hlc_column(&column.name))
                                .ok_or_else(|| {
                                    Error::schema_mismatch(format!(
                                        "missing companion for '{}'",
                                        column.name
                                    ))
                                })?;
                            steps.push(MigrationStep::Execute {
                                sql: format!(
                                    "ALTER TABLE \"{}\" ADD COLUMN {}",
                                    table,
                                    companion.to_column_sql()
                                ),
                            });
                        }
                    }
                }
                for op in key_ops {
                    match op {
                        KeyOp::DropKey(name) => steps.push(MigrationStep::Execute {
                            sql: format!("DROP INDEX \"{}\"", name),
                        }),
                        KeyOp::AddKey(key) => {
                            if let Some(sql) = key.create_index_sql(table) {
                                steps.push(MigrationStep::Execute { sql });
                            }
                        }
                    }
                }
            }
        }
    }

    for change in changes {
        if let SchemaChange::CreateTable { table } = change {
            let declared = schema
                .table(table)
                .ok_or_else(|| Error::schema_mismatch(format!("no declaration for '{}'", table)))?;
            steps.push(MigrationStep::Execute {
                sql: declared.create_table_sql(None),
            });
            for key in declared.secondary_keys() {
                if let Some(sql) = key.create_index_sql(table) {
                    steps.push(MigrationStep::Execute { sql });
                }
            }
        }
    }

    // Views follow tables
    for change in changes {
        match change {
            SchemaChange::DropView { view } => steps.push(MigrationStep::Execute {
                sql: format!("DROP VIEW \"{}\"", view),
            }),
            SchemaChange::AlterView { view } => {
                let declared = schema
                    .view(view)
                    .ok_or_else(|| Error::schema_mismatch(format!("no declaration for view '{}'", view)))?;
                steps.push(MigrationStep::Execute {
                    sql: format!("DROP VIEW \"{}\"", view),
                });
                steps.push(MigrationStep::Execute {
                    sql: declared.create_view_sql(),
                });
            }
            SchemaChange::CreateView { view } => {
                let declared = schema
                    .view(view)
                    .ok_or_else(|| Error::schema_mismatch(format!("no declaration for view '{}'", view)))?;
                steps.push(MigrationStep::Execute {
                    sql: declared.create_view_sql(),
                });
            }
            _ => {}
        }
    }

    Ok(steps)
}

/// The canonical safe-recreate sequence for one table
fn plan_recreate(
    declared: &Table,
    live: &LiveSchema,
    generated_adds: &[&str],
    steps: &mut Vec<MigrationStep>,
) -> Result<()> {
    let staging = staging_name(&declared.name);
    let live_table = live
        .table(&declared.name)
        .ok_or_else(|| Error::schema_mismatch(format!("table '{}' vanished", declared.name)))?;

    // Columns present in both old and new keep their values
    let preserved: Vec<String> = declared
        .columns
        .iter()
        .filter(|c| live_table.column(&c.name).is_some())
        .map(|c| c.name.clone())
        .collect();

    steps.push(MigrationStep::Execute {
        sql: format!("DROP TABLE IF EXISTS \"{}\"", staging),
    });
    steps.push(MigrationStep::Execute {
        sql: declared.create_table_sql(Some(&staging)),
    });
    steps.push(MigrationStep::CopyRows {
        table: declared.name.clone(),
        staging: staging.clone(),
        preserved,
        generated: generated_adds.iter().map(|s| s.to_string()).collect(),
    });
    steps.push(MigrationStep::Execute {
        sql: format!("DROP TABLE \"{}\"", declared.name),
    });
    steps.push(MigrationStep::Execute {
        sql: format!("ALTER TABLE \"{}\" RENAME TO \"{}\"", staging, declared.name),
    });
    for key in declared.secondary_keys() {
        if let Some(sql) = key.create_index_sql(&declared.name) {
            steps.push(MigrationStep::Execute { sql });
        }
    }
    Ok(())
}

/// Run a plan against a connection (the caller supplies the transaction)
pub fn execute(conn: &Connection, schema: &Schema, steps: &[MigrationStep]) -> Result<()> {
    for step in steps {
        debug!("migration step: {}", step.describe());
        match step {
            MigrationStep::Execute { sql } => {
                conn.execute_batch(sql).map_err(|e| classify(e, sql))?;
            }
            MigrationStep::CopyRows {
                table,
                staging,
                preserved,
                generated,
            } => copy_rows(conn, schema, table, staging, preserved, generated)?,
        }
    }
    Ok(())
}

fn copy_rows(
    conn: &Connection,
    schema: &Schema,
    table: &str,
    staging: &str,
    preserved: &[String],
    generated: &[String],
) -> Result<()> {
    if preserved.is_empty() {
        return Ok(());
    }
    let quoted: Vec<String> = preserved.iter().map(|c| format!("\"{}\"", c)).collect();

    if generated.is_empty() {
        let sql = format!(
            "INSERT INTO \"{}\" ({}) SELECT {} FROM \"{}\"",
            staging,
            quoted.join(", "),
            quoted.join(", "),
            table
        );
        conn.execute(&sql, []).map_err(|e| classify(e, &sql))?;
        return Ok(());
    }

    // Generator defaults are resolved once per inserted row
    let declared = schema
        .table(table)
        .ok_or_else(|| Error::schema_mismatch(format!("no declaration for '{}'", table)))?;
    let select_sql = format!("SELECT {} FROM \"{}\"", quoted.join(", "), table);
    let mut all_columns = quoted.clone();
    all_columns.extend(generated.iter().map(|c| format!("\"{}\"", c)));
    let placeholders: Vec<String> = (1..=preserved.len() + generated.len())
        .map(|i| format!("?{}", i))
        .collect();
    let insert_sql = format!(
        "INSERT INTO \"{}\" ({}) VALUES ({})",
        staging,
        all_columns.join(", "),
        placeholders.join(", ")
    );

    let mut select = conn.prepare(&select_sql)?;
    let mut insert = conn.prepare(&insert_sql)?;
    let mut rows = select.query([])?;
    while let Some(row) = rows.next()? {
        let mut values: Vec<Value> = Vec::with_capacity(preserved.len() + generated.len());
        for i in 0..preserved.len() {
            values.push(row.get(i)?);
        }
        for name in generated {
            let column = declared.column(name).ok_or_else(|| {
                Error::schema_mismatch(format!("no declaration for column '{}'", name))
            })?;
            let default = column
                .default
                .as_ref()
                .ok_or_else(|| Error::schema_mismatch(format!("column '{}' has no default", name)))?;
            values.push(default.resolve());
        }
        insert.execute(rusqlite::params_from_iter(values.iter()))?;
    }
    Ok(())
}

/// Keep lock and corruption categories; everything else a failed DDL step
/// means the declaration and the database disagree
fn classify(e: rusqlite::Error, sql: &str) -> Error {
    let err = Error::from(e);
    match err.category() {
        Some(Category::DatabaseLocked) | Some(Category::Corruption) => {
            err.during(Operation::Migration)
        }
        _ => Error::schema_mismatch(format!("migration step failed: {}", sql)),
    }
}

impl Database {
    /// Compute the migration plan without executing it
    pub fn plan_migration(&self) -> Result<Vec<MigrationStep>> {
        let conn = self.lock_conn()?;
        let live = introspect(&conn)?;
        let changes = diff_schemas(self.schema(), &live);
        plan(self.schema(), &changes, &live)
    }

    /// Reconcile the database with the declarative schema
    ///
    /// Runs the whole plan in one transaction; on any failure the database
    /// is left in its prior state. Affected tables are announced to the
    /// stream registry after commit.
    pub fn migrate(&self) -> Result<()> {
        let affected: HashSet<String>;
        {
            let conn = self.lock_conn()?;
            let tx = conn.unchecked_transaction()?;

            ensure_system_tables(&tx)?;
            let live = introspect(&tx)?;
            let changes = diff_schemas(self.schema(), &live);

            if changes.is_empty() {
                debug!("schema is up to date");
                put_setting(&tx, SETTING_SCHEMA_HASH, self.schema().fingerprint())?;
                tx.commit()?;
                return Ok(());
            }

            info!("applying {} schema change(s)", changes.len());
            let steps = plan(self.schema(), &changes, &live)?;
            execute(&tx, self.schema(), &steps)?;
            put_setting(&tx, SETTING_SCHEMA_HASH, self.schema().fingerprint())?;
            tx.commit()?;

            affected = changes
                .iter()
                .map(|c| c.affected_name().to_string())
                .collect();
            info!("migration complete ({} steps)", steps.len());
        }
        self.streams().notify(self, &affected);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnBuilder, SchemaBuilder, TableBuilder};

    fn base_schema() -> Schema {
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
    fn test_migrate_creates_tables_and_fingerprint() {
        let db = Database::open_in_memory(base_schema()).unwrap();
        db.migrate().unwrap();

        let conn = db.lock_conn().unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type='table' AND name='users'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);

        let hash = crate::db::get_setting(&conn, SETTING_SCHEMA_HASH)
            .unwrap()
            .unwrap();
        assert_eq!(hash, db.schema().fingerprint());
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let db = Database::open_in_memory(base_schema()).unwrap();
        db.migrate().unwrap();
        assert!(db.plan_migration().unwrap().is_empty());
        db.migrate().unwrap();
        assert!(db.plan_migration().unwrap().is_empty());
    }

    #[test]
    fn test_plan_preview_does_not_execute() {
        let db = Database::open_in_memory(base_schema()).unwrap();
        let steps = db.plan_migration().unwrap();
        assert!(!steps.is_empty());

        let conn = db.lock_conn().unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type='table' AND name='users'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_recreate_preserves_rows() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("store.db");

        {
            let schema = SchemaBuilder::new()
                .table(
                    TableBuilder::new("users")
                        .column(ColumnBuilder::text("id"))
                        .column(ColumnBuilder::text("name").not_null().default(""))
                        .column(ColumnBuilder::integer("age").not_null().default(0))
                        .column(ColumnBuilder::text("legacy"))
                        .primary_key(["id"]),
                )
                .build()
                .unwrap();
            let db = Database::open(&path, schema).unwrap();
            db.migrate().unwrap();
            let conn = db.lock_conn().unwrap();
            conn.execute(
                "INSERT INTO users (id, name, age, legacy, system_id, system_version, system_created_at)
                 VALUES ('u1', 'A', 10, 'x', 's1', 'h', 'h')",
                [],
            )
            .unwrap();
        }

        // Same table without `legacy`: forces the recreate path
        let narrowed = SchemaBuilder::new()
            .table(
                TableBuilder::new("users")
                    .column(ColumnBuilder::text("id"))
                    .column(ColumnBuilder::text("name").not_null().default(""))
                    .column(ColumnBuilder::integer("age").not_null().default(0))
                    .primary_key(["id"]),
            )
            .build()
            .unwrap();
        let db = Database::open(&path, narrowed).unwrap();
        db.migrate().unwrap();

        let conn = db.lock_conn().unwrap();
        let (name, age): (String, i64) = conn
            .query_row("SELECT name, age FROM users WHERE id = 'u1'", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .unwrap();
        assert_eq!(name, "A");
        assert_eq!(age, 10);

        let legacy = conn.query_row("SELECT legacy FROM users", [], |row| row.get::<_, String>(0));
        assert!(legacy.is_err());
    }

    #[test]
    fn test_generator_backfill_fills_each_row() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("store.db");

        {
            let db = Database::open(&path, base_schema()).unwrap();
            db.migrate().unwrap();
            let conn = db.lock_conn().unwrap();
            for i in 0..3 {
                conn.execute(
                    "INSERT INTO users (id, name, system_id, system_version, system_created_at)
                     VALUES (?1, 'x', ?1, 'h', 'h')",
                    [format!("u{}", i)],
                )
                .unwrap();
            }
        }

        let widened = SchemaBuilder::new()
            .table(
                TableBuilder::new("users")
                    .column(ColumnBuilder::text("id"))
                    .column(ColumnBuilder::text("name").not_null().default(""))
                    .column(
                        ColumnBuilder::guid("token")
                            .not_null()
                            .default_fn(|| Value::Text(uuid::Uuid::new_v4().to_string())),
                    )
                    .primary_key(["id"]),
            )
            .build()
            .unwrap();
        let db = Database::open(&path, widened).unwrap();
        db.migrate().unwrap();

        let conn = db.lock_conn().unwrap();
        let tokens: Vec<String> = conn
            .prepare("SELECT token FROM users")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(tokens.len(), 3);
        // Each row got its own generated value
        let distinct: HashSet<&String> = tokens.iter().collect();
        assert_eq!(distinct.len(), 3);
    }

    #[test]
    fn test_failed_migration_rolls_back() {
        let db = Database::open_in_memory(base_schema()).unwrap();
        db.migrate().unwrap();

        // A bogus plan step must leave the database untouched
        let conn = db.lock_conn().unwrap();
        let tx = conn.unchecked_transaction().unwrap();
        let result = execute(
            &tx,
            db.schema(),
            &[
                MigrationStep::Execute {
                    sql: "ALTER TABLE \"users\" ADD COLUMN \"extra\" TEXT".into(),
                },
                MigrationStep::Execute {
                    sql: "ALTER TABLE \"missing\" ADD COLUMN \"x\" TEXT".into(),
                },
            ],
        );
        assert!(result.is_err());
        drop(tx); // rollback

        let extra = conn.query_row("SELECT extra FROM users", [], |row| row.get::<_, Option<String>>(0));
        assert!(extra.is_err());
    }
}
