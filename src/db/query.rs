// src/db/query.rs

//! Parameterized point queries
//!
//! Queries target one table or view and return rows as column-name to value
//! maps. The same definition backs the reactive streams, which re-run it on
//! every relevant change.

use crate::db::{Database, Session};
use crate::error::Result;
use crate::value::Value;
use rusqlite::Connection;
use std::collections::HashMap;

/// A result row: column name to value
pub type Row = HashMap<String, Value>;

/// A parameterized SELECT against one table or view
#[derive(Debug, Clone)]
pub struct Query {
    target: String,
    columns: Vec<String>,
    where_clause: Option<String>,
    where_args: Vec<Value>,
    order_by: Option<String>,
    limit: Option<u64>,
    offset: Option<u64>,
}

impl Query {
    pub fn table(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            columns: Vec::new(),
            where_clause: None,
            where_args: Vec::new(),
            order_by: None,
            limit: None,
            offset: None,
        }
    }

    /// Restrict the select list; all columns when unset
    pub fn columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn filter(mut self, where_clause: impl Into<String>, args: Vec<Value>) -> Self {
        self.where_clause = Some(where_clause.into());
        self.where_args = args;
        self
    }

    pub fn order_by(mut self, order_by: impl Into<String>) -> Self {
        self.order_by = Some(order_by.into());
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// The table or view this query reads
    pub fn target(&self) -> &str {
        &self.target
    }

    fn to_sql(&self) -> String {
        let select_list = if self.columns.is_empty() {
            "*".to_string()
        } else {
            self.columns
                .iter()
                .map(|c| format!("\"{}\"", c))
                .collect::<Vec<_>>()
                .join(", ")
        };

        let mut sql = format!("SELECT {} FROM \"{}\"", select_list, self.target);
        if let Some(where_clause) = &self.where_clause {
            sql.push_str(&format!(" WHERE {}", where_clause));
        }
        if let Some(order_by) = &self.order_by {
            sql.push_str(&format!(" ORDER BY {}", order_by));
        }
        match (self.limit, self.offset) {
            (Some(limit), Some(offset)) => {
                sql.push_str(&format!(" LIMIT {} OFFSET {}", limit, offset))
            }
            (Some(limit), None) => sql.push_str(&format!(" LIMIT {}", limit)),
            // OFFSET requires a LIMIT clause; -1 means unbounded
            (None, Some(offset)) => sql.push_str(&format!(" LIMIT -1 OFFSET {}", offset)),
            (None, None) => {}
        }
        sql
    }
}

pub(crate) fn run_query(conn: &Connection, query: &Query) -> Result<Vec<Row>> {
    let sql = query.to_sql();
    let mut stmt = conn.prepare(&sql)?;
    let column_names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();

    let mut rows = stmt.query(rusqlite::params_from_iter(query.where_args.iter()))?;
    let mut results = Vec::new();
    while let Some(row) = rows.next()? {
        let mut mapped = Row::with_capacity(column_names.len());
        for (i, name) in column_names.iter().enumerate() {
            mapped.insert(name.clone(), row.get(i)?);
        }
        results.push(mapped);
    }
    Ok(results)
}

impl Database {
    /// Run a point query
    pub fn query(&self, query: &Query) -> Result<Vec<Row>> {
        let conn = self.lock_conn()?;
        run_query(&conn, query)
    }
}

impl Session<'_> {
    /// Run a query inside the current transaction
    pub fn query(&self, query: &Query) -> Result<Vec<Row>> {
        run_query(self.conn, query)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnBuilder, SchemaBuilder, TableBuilder};

    fn test_db() -> Database {
        let schema = SchemaBuilder::new()
            .table(
                TableBuilder::new("users")
                    .column(ColumnBuilder::text("id"))
                    .column(ColumnBuilder::text("name").not_null().default(""))
                    .column(ColumnBuilder::integer("age").not_null().default(0))
                    .primary_key(["id"]),
            )
            .build()
            .unwrap();
        let db = Database::open_in_memory(schema).unwrap();
        db.migrate().unwrap();

        let conn = db.lock_conn().unwrap();
        for (id, name, age) in [("u1", "Alice", 30), ("u2", "Bob", 25), ("u3", "Cara", 35)] {
            conn.execute(
                "INSERT INTO users (id, name, age, system_id, system_version, system_created_at)
                 VALUES (?1, ?2, ?3, ?1, 'h', 'h')",
                rusqlite::params![id, name, age],
            )
            .unwrap();
        }
        drop(conn);
        db
    }

    #[test]
    fn test_select_all_columns() {
        let db = test_db();
        let rows = db.query(&Query::table("users").order_by("id")).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0]["name"], Value::Text("Alice".into()));
        assert!(rows[0].contains_key("system_id"));
    }

    #[test]
    fn test_filter_with_args() {
        let db = test_db();
        let rows = db
            .query(
                &Query::table("users")
                    .columns(["name"])
                    .filter("age > ?1", vec![Value::Integer(28)])
                    .order_by("age"),
            )
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["name"], Value::Text("Alice".into()));
        assert_eq!(rows[1]["name"], Value::Text("Cara".into()));
    }

    #[test]
    fn test_limit_and_offset() {
        let db = test_db();
        let rows = db
            .query(&Query::table("users").columns(["id"]).order_by("id").limit(1).offset(1))
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], Value::Text("u2".into()));

        let rows = db
            .query(&Query::table("users").columns(["id"]).order_by("id").offset(2))
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], Value::Text("u3".into()));
    }

    #[test]
    fn test_unknown_column_errors() {
        let db = test_db();
        let result = db.query(&Query::table("users").columns(["missing"]));
        assert!(result.is_err());
    }
}
