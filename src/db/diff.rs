// src/db/diff.rs

//! Diff computation between the declarative schema and the live database
//!
//! Produces a list of tagged changes the migration planner turns into DDL.
//! Column equality is physical: GUID and DATE fold to TEXT, generator
//! defaults have no DDL literal, and application-level constraints
//! (max_length, min_value, fileset bounds) never force a migration.

use crate::db::introspect::{LiveColumn, LiveSchema, LiveTable};
use crate::schema::{is_system_table, Column, Key, PhysicalType, Schema, Table, HLC_SUFFIX};
use crate::schema::view::normalize_sql;

/// A column-level change on an existing table
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnOp {
    Add(Column),
    Drop(String),
    Modify { old: NormalColumn, new: NormalColumn },
}

/// A key-level change on an existing table
#[derive(Debug, Clone, PartialEq)]
pub enum KeyOp {
    AddKey(Key),
    DropKey(String),
}

/// One change needed to reconcile the database with the declaration
#[derive(Debug, Clone, PartialEq)]
pub enum SchemaChange {
    CreateTable {
        table: String,
    },
    DropTable {
        table: String,
    },
    AlterTable {
        table: String,
        column_ops: Vec<ColumnOp>,
        key_ops: Vec<KeyOp>,
        /// Dropped or modified columns and primary-key changes cannot be
        /// expressed as ALTER TABLE; the table is rebuilt
        requires_recreate: bool,
    },
    CreateView {
        view: String,
    },
    DropView {
        view: String,
    },
    AlterView {
        view: String,
    },
}

impl SchemaChange {
    /// The table or view this change touches
    pub fn affected_name(&self) -> &str {
        match self {
            SchemaChange::CreateTable { table }
            | SchemaChange::DropTable { table }
            | SchemaChange::AlterTable { table, .. } => table,
            SchemaChange::CreateView { view }
            | SchemaChange::DropView { view }
            | SchemaChange::AlterView { view } => view,
        }
    }
}

/// A column reduced to the fields that participate in physical equality
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalColumn {
    pub name: String,
    pub physical: PhysicalType,
    pub not_null: bool,
    pub default: Option<String>,
    pub is_lww: bool,
}

fn normalize_declared(column: &Column) -> NormalColumn {
    NormalColumn {
        name: column.name.clone(),
        physical: column.physical_type(),
        not_null: column.not_null,
        default: column
            .default
            .as_ref()
            .and_then(|d| d.scalar())
            .map(|v| v.to_sql_literal())
            .filter(|literal| literal != "NULL"),
        is_lww: column.is_lww,
    }
}

fn normalize_live(table: &LiveTable, column: &LiveColumn) -> NormalColumn {
    NormalColumn {
        name: column.name.clone(),
        physical: PhysicalType::from_declared(&column.declared_type),
        not_null: column.not_null,
        default: column
            .default
            .as_ref()
            .map(|d| d.trim().to_string())
            .filter(|d| !d.eq_ignore_ascii_case("NULL")),
        is_lww: table.is_lww_column(&column.name),
    }
}

/// Companion timestamp columns follow their base column through the diff;
/// they are only compared standalone when the base is gone
fn is_tracked_companion(name: &str, base_exists: impl Fn(&str) -> bool) -> bool {
    name.strip_suffix(HLC_SUFFIX).is_some_and(|base| base_exists(base))
}

/// Compute the changes needed to reconcile `live` with `schema`
pub fn diff_schemas(schema: &Schema, live: &LiveSchema) -> Vec<SchemaChange> {
    let mut changes = Vec::new();

    // Dropped tables first, so name reuse is safe
    for table in &live.tables {
        if is_system_table(&table.name) {
            continue;
        }
        if schema.table(&table.name).is_none() {
            changes.push(SchemaChange::DropTable {
                table: table.name.clone(),
            });
        }
    }

    for table in &schema.tables {
        match live.table(&table.name) {
            None => changes.push(SchemaChange::CreateTable {
                table: table.name.clone(),
            }),
            Some(live_table) => {
                if let Some(change) = diff_table(table, live_table) {
                    changes.push(change);
                }
            }
        }
    }

    for view in &live.views {
        if schema.view(&view.name).is_none() {
            changes.push(SchemaChange::DropView {
                view: view.name.clone(),
            });
        }
    }
    for view in &schema.views {
        match live.view(&view.name) {
            None => changes.push(SchemaChange::CreateView {
                view: view.name.clone(),
            }),
            Some(live_view) => {
                if normalize_sql(&live_view.sql) != normalize_sql(&view.create_view_sql()) {
                    changes.push(SchemaChange::AlterView {
                        view: view.name.clone(),
                    });
                }
            }
        }
    }

    changes
}

fn diff_table(declared: &Table, live: &LiveTable) -> Option<SchemaChange> {
    let mut column_ops = Vec::new();

    let declared_base = |name: &str| declared.column(name).is_some();
    let live_base = |name: &str| live.column(name).is_some();

    for column in &declared.columns {
        if is_tracked_companion(&column.name, declared_base) {
            continue;
        }
        match live.column(&column.name) {
            None => column_ops.push(ColumnOp::Add(column.clone())),
            Some(live_column) => {
                let new = normalize_declared(column);
                let old = normalize_live(live, live_column);
                if new != old {
                    column_ops.push(ColumnOp::Modify { old, new });
                }
            }
        }
    }

    for live_column in &live.columns {
        if is_tracked_companion(&live_column.name, live_base) {
            continue;
        }
        if declared.column(&live_column.name).is_none() {
            column_ops.push(ColumnOp::Drop(live_column.name.clone()));
        }
    }

    let mut key_ops = Vec::new();
    for key in declared.secondary_keys() {
        let name = key.index_name(&declared.name);
        let unique = key.kind == crate::schema::KeyKind::Unique;
        match live.indexes.iter().find(|i| i.name == name) {
            None => key_ops.push(KeyOp::AddKey(key.clone())),
            Some(live_index) => {
                if live_index.unique != unique || live_index.columns != key.columns {
                    key_ops.push(KeyOp::DropKey(name));
                    key_ops.push(KeyOp::AddKey(key.clone()));
                }
            }
        }
    }
    for live_index in &live.indexes {
        let declared_names: Vec<String> = declared
            .secondary_keys()
            .map(|k| k.index_name(&declared.name))
            .collect();
        if !declared_names.contains(&live_index.name) {
            key_ops.push(KeyOp::DropKey(live_index.name.clone()));
        }
    }

    let pk_changed = declared.primary_key().columns != live.primary_key_columns();

    let requires_recreate = pk_changed
        || column_ops
            .iter()
            .any(|op| matches!(op, ColumnOp::Drop(_) | ColumnOp::Modify { .. }));

    if column_ops.is_empty() && key_ops.is_empty() && !pk_changed {
        return None;
    }

    Some(SchemaChange::AlterTable {
        table: declared.name.clone(),
        column_ops,
        key_ops,
        requires_recreate,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::introspect::introspect;
    use crate::db::migrate;
    use crate::schema::{ColumnBuilder, SchemaBuilder, TableBuilder, ViewBuilder};
    use rusqlite::Connection;

    fn users_schema(extra: impl FnOnce(TableBuilder) -> TableBuilder) -> Schema {
        SchemaBuilder::new()
            .table(extra(
                TableBuilder::new("users")
                    .column(ColumnBuilder::text("id"))
                    .column(ColumnBuilder::text("name").not_null().default(""))
                    .primary_key(["id"]),
            ))
            .build()
            .unwrap()
    }

    fn migrated_conn(schema: &Schema) -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        migrate::ensure_system_tables(&conn).unwrap();
        let live = introspect(&conn).unwrap();
        let changes = diff_schemas(schema, &live);
        let plan = migrate::plan(schema, &changes, &live).unwrap();
        migrate::execute(&conn, schema, &plan).unwrap();
        conn
    }

    #[test]
    fn test_empty_database_creates_everything() {
        let schema = users_schema(|t| t);
        let conn = Connection::open_in_memory().unwrap();
        migrate::ensure_system_tables(&conn).unwrap();
        let live = introspect(&conn).unwrap();

        let changes = diff_schemas(&schema, &live);
        assert_eq!(
            changes,
            vec![SchemaChange::CreateTable {
                table: "users".into()
            }]
        );
    }

    #[test]
    fn test_diff_is_empty_after_migrate() {
        let schema = users_schema(|t| t);
        let conn = migrated_conn(&schema);
        let live = introspect(&conn).unwrap();
        assert!(diff_schemas(&schema, &live).is_empty());
    }

    #[test]
    fn test_added_column_is_simple_alter() {
        let schema = users_schema(|t| t);
        let conn = migrated_conn(&schema);

        let widened = users_schema(|t| t.column(ColumnBuilder::integer("age").not_null().default(0)));
        let live = introspect(&conn).unwrap();
        let changes = diff_schemas(&widened, &live);

        assert_eq!(changes.len(), 1);
        match &changes[0] {
            SchemaChange::AlterTable {
                table,
                column_ops,
                requires_recreate,
                ..
            } => {
                assert_eq!(table, "users");
                assert!(!requires_recreate);
                assert_eq!(column_ops.len(), 1);
                assert!(matches!(&column_ops[0], ColumnOp::Add(c) if c.name == "age"));
            }
            other => panic!("unexpected change: {:?}", other),
        }
    }

    #[test]
    fn test_dropped_column_requires_recreate() {
        let wide = users_schema(|t| t.column(ColumnBuilder::text("legacy")));
        let conn = migrated_conn(&wide);

        let narrow = users_schema(|t| t);
        let live = introspect(&conn).unwrap();
        let changes = diff_schemas(&narrow, &live);

        match &changes[0] {
            SchemaChange::AlterTable {
                column_ops,
                requires_recreate,
                ..
            } => {
                assert!(requires_recreate);
                assert!(column_ops.contains(&ColumnOp::Drop("legacy".into())));
            }
            other => panic!("unexpected change: {:?}", other),
        }
    }

    #[test]
    fn test_lww_toggle_requires_recreate() {
        let plain = users_schema(|t| t.column(ColumnBuilder::real("balance")));
        let conn = migrated_conn(&plain);

        let lww = users_schema(|t| t.column(ColumnBuilder::real("balance").lww()));
        let live = introspect(&conn).unwrap();
        let changes = diff_schemas(&lww, &live);

        match &changes[0] {
            SchemaChange::AlterTable {
                requires_recreate, ..
            } => assert!(requires_recreate),
            other => panic!("unexpected change: {:?}", other),
        }
    }

    #[test]
    fn test_constraint_changes_never_migrate() {
        let schema = users_schema(|t| t.column(ColumnBuilder::text("bio").max_length(10)));
        let conn = migrated_conn(&schema);

        let relaxed = users_schema(|t| t.column(ColumnBuilder::text("bio").max_length(500)));
        let live = introspect(&conn).unwrap();
        assert!(diff_schemas(&relaxed, &live).is_empty());
    }

    #[test]
    fn test_index_add_and_drop() {
        let plain = users_schema(|t| t);
        let conn = migrated_conn(&plain);

        let indexed = users_schema(|t| t.index(["name"]));
        let live = introspect(&conn).unwrap();
        let changes = diff_schemas(&indexed, &live);

        match &changes[0] {
            SchemaChange::AlterTable {
                key_ops,
                requires_recreate,
                ..
            } => {
                assert!(!requires_recreate);
                assert!(matches!(&key_ops[0], KeyOp::AddKey(k) if k.columns == vec!["name"]));
            }
            other => panic!("unexpected change: {:?}", other),
        }
    }

    #[test]
    fn test_system_tables_never_dropped() {
        let schema = users_schema(|t| t);
        let conn = migrated_conn(&schema);
        let live = introspect(&conn).unwrap();
        // __settings, __files, __dirty_rows are present but must not diff
        assert!(live.table("__settings").is_some());
        assert!(diff_schemas(&schema, &live).is_empty());
    }

    #[test]
    fn test_view_changes_are_whitespace_insensitive() {
        let with_view = |order: &str| {
            SchemaBuilder::new()
                .table(
                    TableBuilder::new("users")
                        .column(ColumnBuilder::text("id"))
                        .column(ColumnBuilder::text("name").not_null().default(""))
                        .primary_key(["id"]),
                )
                .view(ViewBuilder::new("named", "users").select("name").order_by(order))
                .build()
                .unwrap()
        };

        let schema = with_view("name");
        let conn = migrated_conn(&schema);
        let live = introspect(&conn).unwrap();
        assert!(diff_schemas(&schema, &live).is_empty());

        let reordered = with_view("name DESC");
        let changes = diff_schemas(&reordered, &live);
        assert_eq!(
            changes,
            vec![SchemaChange::AlterView {
                view: "named".into()
            }]
        );
    }
}
