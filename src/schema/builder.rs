// src/schema/builder.rs

//! Fluent schema construction
//!
//! The builder validates every schema invariant at `build()` time, injects
//! the implicit system columns and LWW companion columns, and seals the
//! result into an immutable [`Schema`]. No partial schema escapes.

use super::view::ViewBuilder;
use super::{
    hlc_column, Column, DefaultValue, Key, KeyKind, LogicalType, Schema, Table, View, HLC_SUFFIX,
    SYSTEM_CREATED_AT, SYSTEM_ID, SYSTEM_VERSION,
};
use crate::error::{Error, Result};
use crate::value::Value;
use std::collections::HashSet;
use std::sync::Arc;

/// Builds one column declaration
#[derive(Debug)]
pub struct ColumnBuilder {
    column: Column,
}

impl ColumnBuilder {
    fn new(name: impl Into<String>, logical_type: LogicalType) -> Self {
        Self {
            column: Column {
                name: name.into(),
                logical_type,
                not_null: false,
                default: None,
                min_value: None,
                max_length: None,
                is_lww: false,
                is_parent: false,
                is_sequence: false,
                sequence_per_parent: false,
                max_count: None,
                max_file_size_bytes: None,
            },
        }
    }

    pub fn guid(name: impl Into<String>) -> Self {
        Self::new(name, LogicalType::Guid)
    }

    pub fn text(name: impl Into<String>) -> Self {
        Self::new(name, LogicalType::Text)
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, LogicalType::Integer)
    }

    pub fn real(name: impl Into<String>) -> Self {
        Self::new(name, LogicalType::Real)
    }

    pub fn date(name: impl Into<String>) -> Self {
        Self::new(name, LogicalType::Date)
    }

    /// Fileset columns carry their bounds up front; both are mandatory
    pub fn fileset(name: impl Into<String>, max_count: u32, max_file_size_bytes: u64) -> Self {
        let mut builder = Self::new(name, LogicalType::Fileset);
        builder.column.max_count = Some(max_count);
        builder.column.max_file_size_bytes = Some(max_file_size_bytes);
        builder
    }

    pub fn not_null(mut self) -> Self {
        self.column.not_null = true;
        self
    }

    pub fn default(mut self, value: impl Into<Value>) -> Self {
        self.column.default = Some(DefaultValue::Scalar(value.into()));
        self
    }

    pub fn default_fn<F>(mut self, f: F) -> Self
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        self.column.default = Some(DefaultValue::Generated(Arc::new(f)));
        self
    }

    pub fn lww(mut self) -> Self {
        self.column.is_lww = true;
        self
    }

    pub fn parent(mut self) -> Self {
        self.column.is_parent = true;
        self
    }

    pub fn sequence(mut self) -> Self {
        self.column.is_sequence = true;
        self
    }

    pub fn sequence_per_parent(mut self) -> Self {
        self.column.is_sequence = true;
        self.column.sequence_per_parent = true;
        self
    }

    pub fn min_value(mut self, min: f64) -> Self {
        self.column.min_value = Some(min);
        self
    }

    pub fn max_length(mut self, max: usize) -> Self {
        self.column.max_length = Some(max);
        self
    }
}

/// Builds one table declaration
#[derive(Debug)]
pub struct TableBuilder {
    name: String,
    columns: Vec<Column>,
    primary_keys: Vec<Vec<String>>,
    keys: Vec<Key>,
}

impl TableBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            primary_keys: Vec::new(),
            keys: Vec::new(),
        }
    }

    pub fn column(mut self, builder: ColumnBuilder) -> Self {
        self.columns.push(builder.column);
        self
    }

    pub fn primary_key<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.primary_keys
            .push(columns.into_iter().map(Into::into).collect());
        self
    }

    pub fn unique<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keys.push(Key {
            kind: KeyKind::Unique,
            columns: columns.into_iter().map(Into::into).collect(),
        });
        self
    }

    pub fn index<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keys.push(Key {
            kind: KeyKind::Index,
            columns: columns.into_iter().map(Into::into).collect(),
        });
        self
    }
}

/// Builds a whole schema
#[derive(Debug, Default)]
pub struct SchemaBuilder {
    tables: Vec<TableBuilder>,
    views: Vec<View>,
}

impl SchemaBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table(mut self, builder: TableBuilder) -> Self {
        self.tables.push(builder);
        self
    }

    pub fn view(mut self, builder: ViewBuilder) -> Self {
        self.views.push(builder.finish());
        self
    }

    /// Validate every invariant, inject implicit columns, and seal
    pub fn build(self) -> Result<Schema> {
        let mut names: HashSet<String> = HashSet::new();
        for table in &self.tables {
            if !names.insert(table.name.clone()) {
                return Err(Error::invalid_schema(
                    "duplicate name",
                    format!("table '{}'", table.name),
                ));
            }
        }
        for view in &self.views {
            if !names.insert(view.name.clone()) {
                return Err(Error::invalid_schema(
                    "duplicate name",
                    format!("view '{}'", view.name),
                ));
            }
        }

        let mut tables = Vec::with_capacity(self.tables.len());
        for table in self.tables {
            tables.push(Self::seal_table(table)?);
        }

        Ok(Schema::sealed(tables, self.views))
    }

    fn seal_table(builder: TableBuilder) -> Result<Table> {
        let table_name = builder.name.clone();
        let location = move |detail: &str| format!("table '{}'{}", table_name, detail);

        if builder.name.starts_with("__") {
            return Err(Error::invalid_schema(
                "the '__' prefix is reserved for system tables",
                location(""),
            ));
        }

        if builder.primary_keys.len() != 1 {
            return Err(Error::invalid_schema(
                format!(
                    "exactly one primary key required, found {}",
                    builder.primary_keys.len()
                ),
                location(""),
            ));
        }
        let pk_columns = builder.primary_keys.into_iter().next().unwrap();

        let mut seen = HashSet::new();
        for column in &builder.columns {
            let col_location = || location(&format!(", column '{}'", column.name));

            if !seen.insert(column.name.clone()) {
                return Err(Error::invalid_schema("duplicate column name", col_location()));
            }
            if column.name.starts_with("__") {
                return Err(Error::invalid_schema(
                    "user columns may not begin with '__'",
                    col_location(),
                ));
            }
            if column.name.ends_with(HLC_SUFFIX) {
                return Err(Error::invalid_schema(
                    "companion timestamp columns are engine-managed",
                    col_location(),
                ));
            }
            if matches!(
                column.name.as_str(),
                SYSTEM_ID | SYSTEM_VERSION | SYSTEM_CREATED_AT
            ) {
                return Err(Error::invalid_schema(
                    "system columns are implicit and may not be declared",
                    col_location(),
                ));
            }
            if column.not_null && column.default.is_none() && !pk_columns.contains(&column.name) {
                return Err(Error::invalid_schema(
                    "NOT NULL columns require a default value",
                    col_location(),
                ));
            }
            if column.logical_type == LogicalType::Fileset
                && (column.max_count.is_none() || column.max_file_size_bytes.is_none())
            {
                return Err(Error::invalid_schema(
                    "fileset columns require max_count and max_file_size_bytes",
                    col_location(),
                ));
            }
        }

        for pk_column in &pk_columns {
            if !seen.contains(pk_column) {
                return Err(Error::invalid_schema(
                    format!("primary key references unknown column '{}'", pk_column),
                    location(""),
                ));
            }
        }
        for key in &builder.keys {
            for key_column in &key.columns {
                if !seen.contains(key_column) {
                    return Err(Error::invalid_schema(
                        format!("key references unknown column '{}'", key_column),
                        location(""),
                    ));
                }
            }
        }

        let parent_count = builder.columns.iter().filter(|c| c.is_parent).count();
        if parent_count > 1 {
            return Err(Error::invalid_schema(
                "at most one parent column per table",
                location(""),
            ));
        }
        if builder
            .columns
            .iter()
            .any(|c| c.sequence_per_parent)
            && parent_count == 0
        {
            return Err(Error::invalid_schema(
                "sequence_per_parent requires a parent column",
                location(""),
            ));
        }

        // Assemble: user columns (each LWW column followed by its companion),
        // then the implicit system columns
        let mut columns = Vec::with_capacity(builder.columns.len() + 4);
        for mut column in builder.columns {
            if pk_columns.contains(&column.name) {
                column.not_null = true;
            }
            let companion = column.is_lww.then(|| implicit_text(hlc_column(&column.name)));
            columns.push(column);
            if let Some(companion) = companion {
                columns.push(companion);
            }
        }
        columns.push(required_text(SYSTEM_ID));
        columns.push(required_text(SYSTEM_VERSION));
        columns.push(required_text(SYSTEM_CREATED_AT));

        let mut keys = Vec::with_capacity(builder.keys.len() + 2);
        keys.push(Key::primary(pk_columns));
        keys.push(Key {
            kind: KeyKind::Unique,
            columns: vec![SYSTEM_ID.to_string()],
        });
        let mut key_names = HashSet::new();
        for key in builder.keys {
            if !key_names.insert(key.index_name(&builder.name)) {
                return Err(Error::invalid_schema(
                    format!("duplicate key on columns ({})", key.columns.join(", ")),
                    location(""),
                ));
            }
            keys.push(key);
        }

        Ok(Table {
            name: builder.name,
            columns,
            keys,
        })
    }
}

/// Nullable engine-managed TEXT column (LWW companions)
fn implicit_text(name: String) -> Column {
    Column {
        name,
        logical_type: LogicalType::Text,
        not_null: false,
        default: None,
        min_value: None,
        max_length: None,
        is_lww: false,
        is_parent: false,
        is_sequence: false,
        sequence_per_parent: false,
        max_count: None,
        max_file_size_bytes: None,
    }
}

/// Engine-filled NOT NULL TEXT column (system columns)
fn required_text(name: &str) -> Column {
    let mut column = implicit_text(name.to_string());
    column.not_null = true;
    column
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users() -> TableBuilder {
        TableBuilder::new("users")
            .column(ColumnBuilder::text("id").not_null())
            .column(ColumnBuilder::text("name").not_null().default(""))
            .primary_key(["id"])
    }

    #[test]
    fn test_build_injects_system_and_companion_columns() {
        let schema = SchemaBuilder::new()
            .table(users().column(ColumnBuilder::real("balance").lww()))
            .build()
            .unwrap();

        let table = schema.table("users").unwrap();
        assert!(table.column("system_id").is_some());
        assert!(table.column("system_version").is_some());
        assert!(table.column("system_created_at").is_some());
        assert!(table.column("balance__hlc").is_some());
        // Companion directly follows its base column
        let idx = table.columns.iter().position(|c| c.name == "balance").unwrap();
        assert_eq!(table.columns[idx + 1].name, "balance__hlc");
    }

    #[test]
    fn test_pk_columns_become_not_null() {
        let schema = SchemaBuilder::new()
            .table(
                TableBuilder::new("t")
                    .column(ColumnBuilder::text("id"))
                    .primary_key(["id"]),
            )
            .build()
            .unwrap();
        assert!(schema.table("t").unwrap().column("id").unwrap().not_null);
    }

    #[test]
    fn test_not_null_without_default_rejected() {
        let result = SchemaBuilder::new()
            .table(
                TableBuilder::new("t")
                    .column(ColumnBuilder::text("id"))
                    .column(ColumnBuilder::integer("age").not_null())
                    .primary_key(["id"]),
            )
            .build();
        assert!(matches!(result, Err(Error::InvalidSchema { .. })));
    }

    #[test]
    fn test_not_null_with_generator_default_accepted() {
        let result = SchemaBuilder::new()
            .table(
                TableBuilder::new("t")
                    .column(ColumnBuilder::text("id"))
                    .column(
                        ColumnBuilder::guid("token")
                            .not_null()
                            .default_fn(|| Value::Text(uuid::Uuid::new_v4().to_string())),
                    )
                    .primary_key(["id"]),
            )
            .build();
        assert!(result.is_ok());
    }

    #[test]
    fn test_manual_companion_column_rejected() {
        let result = SchemaBuilder::new()
            .table(users().column(ColumnBuilder::text("balance__hlc")))
            .build();
        assert!(matches!(result, Err(Error::InvalidSchema { .. })));
    }

    #[test]
    fn test_double_primary_key_rejected() {
        let result = SchemaBuilder::new()
            .table(users().primary_key(["name"]))
            .build();
        assert!(matches!(result, Err(Error::InvalidSchema { .. })));
    }

    #[test]
    fn test_reserved_prefixes_rejected() {
        assert!(SchemaBuilder::new()
            .table(
                TableBuilder::new("__mine")
                    .column(ColumnBuilder::text("id"))
                    .primary_key(["id"])
            )
            .build()
            .is_err());

        assert!(SchemaBuilder::new()
            .table(users().column(ColumnBuilder::text("__hidden")))
            .build()
            .is_err());
    }

    #[test]
    fn test_duplicate_table_names_rejected() {
        let result = SchemaBuilder::new().table(users()).table(users()).build();
        assert!(matches!(result, Err(Error::InvalidSchema { .. })));
    }

    #[test]
    fn test_fingerprint_is_deterministic() {
        let build = || {
            SchemaBuilder::new()
                .table(users().column(ColumnBuilder::integer("age").not_null().default(0)))
                .build()
                .unwrap()
        };
        let a = build();
        let b = build();
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.describe(), b.describe());
        assert_eq!(a, b);
    }

    #[test]
    fn test_fingerprint_changes_with_schema() {
        let a = SchemaBuilder::new().table(users()).build().unwrap();
        let b = SchemaBuilder::new()
            .table(users().column(ColumnBuilder::integer("age").not_null().default(0)))
            .build()
            .unwrap();
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_sequence_per_parent_requires_parent() {
        let result = SchemaBuilder::new()
            .table(users().column(ColumnBuilder::integer("pos").sequence_per_parent()))
            .build();
        assert!(result.is_err());

        let result = SchemaBuilder::new()
            .table(
                users()
                    .column(ColumnBuilder::guid("owner").parent())
                    .column(ColumnBuilder::integer("pos").sequence_per_parent()),
            )
            .build();
        assert!(result.is_ok());
    }
}
