// src/schema/mod.rs

//! Declarative schema model
//!
//! An immutable description of tables, columns, keys and views. Applications
//! construct one through [`builder::SchemaBuilder`]; the engine reconciles it
//! with the physical database at open time. The canonical JSON form of a
//! schema and its SHA-256 fingerprint identify a schema revision in
//! `__settings`.

pub mod builder;
pub mod view;

use crate::value::Value;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;

pub use builder::{ColumnBuilder, SchemaBuilder, TableBuilder};
pub use view::{Join, JoinKind, SelectExpr, View, ViewBuilder};

/// Implicit row id column present on every user table
pub const SYSTEM_ID: &str = "system_id";
/// Implicit HLC of the last write to the row
pub const SYSTEM_VERSION: &str = "system_version";
/// Implicit HLC of row creation
pub const SYSTEM_CREATED_AT: &str = "system_created_at";
/// Suffix of the companion timestamp column backing an LWW column
pub const HLC_SUFFIX: &str = "__hlc";

/// True for engine-managed tables (`__settings`, `__files`, `__dirty_rows`)
pub fn is_system_table(name: &str) -> bool {
    name.starts_with("__")
}

/// Companion timestamp column name for an LWW column
pub fn hlc_column(column: &str) -> String {
    format!("{}{}", column, HLC_SUFFIX)
}

/// Logical column types as the application sees them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogicalType {
    Guid,
    Text,
    Integer,
    Real,
    Date,
    Fileset,
}

/// SQLite affinity used on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PhysicalType {
    Text,
    Integer,
    Real,
}

impl PhysicalType {
    pub fn as_sql(&self) -> &'static str {
        match self {
            PhysicalType::Text => "TEXT",
            PhysicalType::Integer => "INTEGER",
            PhysicalType::Real => "REAL",
        }
    }

    /// Normalize a declared type from `PRAGMA table_info` into an affinity
    pub fn from_declared(declared: &str) -> Self {
        let upper = declared.to_ascii_uppercase();
        if upper.contains("INT") {
            PhysicalType::Integer
        } else if upper.contains("REAL") || upper.contains("FLOA") || upper.contains("DOUB") {
            PhysicalType::Real
        } else {
            PhysicalType::Text
        }
    }
}

impl LogicalType {
    /// GUID, DATE and FILESET values are stored as TEXT
    pub fn physical(&self) -> PhysicalType {
        match self {
            LogicalType::Guid | LogicalType::Text | LogicalType::Date | LogicalType::Fileset => {
                PhysicalType::Text
            }
            LogicalType::Integer => PhysicalType::Integer,
            LogicalType::Real => PhysicalType::Real,
        }
    }
}

/// Function resolving a default value per inserted row
pub type Generator = Arc<dyn Fn() -> Value + Send + Sync>;

/// A column default: a scalar baked into the DDL, or a generator resolved
/// by the engine for each inserted row
#[derive(Clone)]
pub enum DefaultValue {
    Scalar(Value),
    Generated(Generator),
}

impl DefaultValue {
    /// The scalar default, if this default can appear in DDL
    pub fn scalar(&self) -> Option<&Value> {
        match self {
            DefaultValue::Scalar(v) => Some(v),
            DefaultValue::Generated(_) => None,
        }
    }

    /// Resolve the default for one row
    pub fn resolve(&self) -> Value {
        match self {
            DefaultValue::Scalar(v) => v.clone(),
            DefaultValue::Generated(f) => f(),
        }
    }
}

impl fmt::Debug for DefaultValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DefaultValue::Scalar(v) => write!(f, "Scalar({:?})", v),
            DefaultValue::Generated(_) => write!(f, "Generated(<fn>)"),
        }
    }
}

impl PartialEq for DefaultValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (DefaultValue::Scalar(a), DefaultValue::Scalar(b)) => a == b,
            // Generator bodies are opaque; two generated defaults are
            // structurally equivalent
            (DefaultValue::Generated(_), DefaultValue::Generated(_)) => true,
            _ => false,
        }
    }
}

impl Serialize for DefaultValue {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        match self {
            DefaultValue::Scalar(v) => v.serialize(serializer),
            DefaultValue::Generated(_) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("generated", &true)?;
                map.end()
            }
        }
    }
}

/// A single column declaration
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Column {
    pub name: String,
    pub logical_type: LogicalType,
    pub not_null: bool,
    pub default: Option<DefaultValue>,
    pub min_value: Option<f64>,
    pub max_length: Option<usize>,
    pub is_lww: bool,
    pub is_parent: bool,
    pub is_sequence: bool,
    pub sequence_per_parent: bool,
    pub max_count: Option<u32>,
    pub max_file_size_bytes: Option<u64>,
}

impl Column {
    pub fn physical_type(&self) -> PhysicalType {
        self.logical_type.physical()
    }

    /// True for engine-injected columns (system columns and `__hlc` companions)
    pub fn is_engine_managed(&self) -> bool {
        self.name.starts_with("__")
            || self.name.ends_with(HLC_SUFFIX)
            || matches!(
                self.name.as_str(),
                SYSTEM_ID | SYSTEM_VERSION | SYSTEM_CREATED_AT
            )
    }

    /// Column definition fragment for CREATE TABLE
    pub fn to_column_sql(&self) -> String {
        let mut sql = format!("\"{}\" {}", self.name, self.physical_type().as_sql());
        if self.not_null {
            sql.push_str(" NOT NULL");
        }
        if let Some(DefaultValue::Scalar(v)) = &self.default {
            sql.push_str(" DEFAULT ");
            sql.push_str(&v.to_sql_literal());
        }
        sql
    }
}

/// Kind of key on a table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyKind {
    Primary,
    Unique,
    Index,
}

/// A primary key, unique key, or plain index
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Key {
    pub kind: KeyKind,
    pub columns: Vec<String>,
}

impl Key {
    pub fn primary(columns: Vec<String>) -> Self {
        Self {
            kind: KeyKind::Primary,
            columns,
        }
    }

    /// Canonical index name; the migration executor recreates indexes under
    /// these names so they survive table recreation
    pub fn index_name(&self, table: &str) -> String {
        let prefix = match self.kind {
            KeyKind::Primary => "pk",
            KeyKind::Unique => "uidx",
            KeyKind::Index => "idx",
        };
        format!("{}_{}_{}", prefix, table, self.columns.join("_"))
    }

    /// CREATE INDEX statement, or None for the primary key (it lives in the
    /// table definition)
    pub fn create_index_sql(&self, table: &str) -> Option<String> {
        match self.kind {
            KeyKind::Primary => None,
            KeyKind::Unique => Some(format!(
                "CREATE UNIQUE INDEX \"{}\" ON \"{}\" ({})",
                self.index_name(table),
                table,
                self.quoted_columns()
            )),
            KeyKind::Index => Some(format!(
                "CREATE INDEX \"{}\" ON \"{}\" ({})",
                self.index_name(table),
                table,
                self.quoted_columns()
            )),
        }
    }

    fn quoted_columns(&self) -> String {
        self.columns
            .iter()
            .map(|c| format!("\"{}\"", c))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// A table declaration with its columns and keys
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Table {
    pub name: String,
    pub columns: Vec<Column>,
    pub keys: Vec<Key>,
}

impl Table {
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// The table's primary key; the builder guarantees exactly one
    pub fn primary_key(&self) -> &Key {
        self.keys
            .iter()
            .find(|k| k.kind == KeyKind::Primary)
            .expect("builder guarantees a primary key")
    }

    pub fn lww_columns(&self) -> impl Iterator<Item = &Column> {
        self.columns.iter().filter(|c| c.is_lww)
    }

    pub fn fileset_columns(&self) -> impl Iterator<Item = &Column> {
        self.columns
            .iter()
            .filter(|c| c.logical_type == LogicalType::Fileset)
    }

    /// The parent-link column, if this table declares one
    pub fn parent_column(&self) -> Option<&Column> {
        self.columns.iter().find(|c| c.is_parent)
    }

    /// Secondary keys (everything except the primary)
    pub fn secondary_keys(&self) -> impl Iterator<Item = &Key> {
        self.keys.iter().filter(|k| k.kind != KeyKind::Primary)
    }

    /// Full CREATE TABLE statement; `name_override` supports the recreate
    /// sequence (CREATE TABLE t_new ...)
    pub fn create_table_sql(&self, name_override: Option<&str>) -> String {
        let name = name_override.unwrap_or(&self.name);
        let mut parts: Vec<String> = self.columns.iter().map(Column::to_column_sql).collect();

        let pk = self.primary_key();
        parts.push(format!(
            "PRIMARY KEY ({})",
            pk.columns
                .iter()
                .map(|c| format!("\"{}\"", c))
                .collect::<Vec<_>>()
                .join(", ")
        ));

        format!("CREATE TABLE \"{}\" (\n    {}\n)", name, parts.join(",\n    "))
    }
}

/// An immutable, validated schema
///
/// Only [`SchemaBuilder::build`] produces one; no partial schema escapes the
/// builder.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Schema {
    pub tables: Vec<Table>,
    pub views: Vec<View>,
    #[serde(skip)]
    fingerprint: String,
}

impl Schema {
    pub(crate) fn sealed(tables: Vec<Table>, views: Vec<View>) -> Self {
        let mut schema = Self {
            tables,
            views,
            fingerprint: String::new(),
        };
        let canonical = schema.describe();
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        schema.fingerprint = format!("{:x}", hasher.finalize());
        schema
    }

    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub fn view(&self, name: &str) -> Option<&View> {
        self.views.iter().find(|v| v.name == name)
    }

    /// Canonical JSON form; field order is fixed by the struct definitions,
    /// so the output is deterministic for a given schema
    pub fn describe(&self) -> String {
        serde_json::to_string(self).expect("schema serialization is infallible")
    }

    /// SHA-256 of the canonical JSON, hex-encoded
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Tables a name refers to for dependency tracking: the table itself,
    /// or a view's base tables
    pub fn dependency_tables(&self, name: &str) -> Vec<String> {
        if let Some(view) = self.view(name) {
            view.base_tables()
        } else {
            vec![name.to_string()]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_column() -> Column {
        Column {
            name: "name".to_string(),
            logical_type: LogicalType::Text,
            not_null: true,
            default: Some(DefaultValue::Scalar(Value::Text(String::new()))),
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

    #[test]
    fn test_column_sql_includes_constraints() {
        let sql = sample_column().to_column_sql();
        assert_eq!(sql, "\"name\" TEXT NOT NULL DEFAULT ''");
    }

    #[test]
    fn test_generated_default_has_no_ddl_literal() {
        let mut col = sample_column();
        col.default = Some(DefaultValue::Generated(Arc::new(|| Value::Integer(1))));
        assert_eq!(col.to_column_sql(), "\"name\" TEXT NOT NULL");
    }

    #[test]
    fn test_physical_type_folding() {
        assert_eq!(LogicalType::Guid.physical(), PhysicalType::Text);
        assert_eq!(LogicalType::Date.physical(), PhysicalType::Text);
        assert_eq!(LogicalType::Fileset.physical(), PhysicalType::Text);
        assert_eq!(LogicalType::Integer.physical(), PhysicalType::Integer);
        assert_eq!(LogicalType::Real.physical(), PhysicalType::Real);
    }

    #[test]
    fn test_declared_type_normalization() {
        assert_eq!(PhysicalType::from_declared("TEXT"), PhysicalType::Text);
        assert_eq!(PhysicalType::from_declared("VARCHAR(20)"), PhysicalType::Text);
        assert_eq!(PhysicalType::from_declared("integer"), PhysicalType::Integer);
        assert_eq!(PhysicalType::from_declared("BIGINT"), PhysicalType::Integer);
        assert_eq!(PhysicalType::from_declared("DOUBLE"), PhysicalType::Real);
    }

    #[test]
    fn test_index_names_are_canonical() {
        let key = Key {
            kind: KeyKind::Unique,
            columns: vec!["a".into(), "b".into()],
        };
        assert_eq!(key.index_name("t"), "uidx_t_a_b");
        let sql = key.create_index_sql("t").unwrap();
        assert!(sql.starts_with("CREATE UNIQUE INDEX \"uidx_t_a_b\""));
    }

    #[test]
    fn test_system_table_detection() {
        assert!(is_system_table("__settings"));
        assert!(!is_system_table("users"));
    }
}
