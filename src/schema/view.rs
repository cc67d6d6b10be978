// src/schema/view.rs

//! Structured view definitions
//!
//! Views are declared structurally (select list, from/join list, filters)
//! and emit a deterministic SQL definition. The differ compares stored and
//! declared definitions after whitespace canonicalization, so formatting
//! drift never triggers a rebuild.

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SelectExpr {
    pub expr: String,
    pub alias: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinKind {
    Inner,
    Left,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Join {
    pub kind: JoinKind,
    pub table: String,
    pub on: String,
}

/// A declared view
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct View {
    pub name: String,
    pub select: Vec<SelectExpr>,
    pub from: String,
    pub joins: Vec<Join>,
    pub where_clause: Option<String>,
    pub group_by: Vec<String>,
    pub having: Option<String>,
    pub order_by: Vec<String>,
}

impl View {
    /// The SELECT statement backing this view
    pub fn definition_sql(&self) -> String {
        let select_list = self
            .select
            .iter()
            .map(|s| match &s.alias {
                Some(alias) => format!("{} AS {}", s.expr, alias),
                None => s.expr.clone(),
            })
            .collect::<Vec<_>>()
            .join(", ");

        let mut sql = format!("SELECT {} FROM \"{}\"", select_list, self.from);
        for join in &self.joins {
            let kind = match join.kind {
                JoinKind::Inner => "JOIN",
                JoinKind::Left => "LEFT JOIN",
            };
            sql.push_str(&format!(" {} \"{}\" ON {}", kind, join.table, join.on));
        }
        if let Some(where_clause) = &self.where_clause {
            sql.push_str(&format!(" WHERE {}", where_clause));
        }
        if !self.group_by.is_empty() {
            sql.push_str(&format!(" GROUP BY {}", self.group_by.join(", ")));
        }
        if let Some(having) = &self.having {
            sql.push_str(&format!(" HAVING {}", having));
        }
        if !self.order_by.is_empty() {
            sql.push_str(&format!(" ORDER BY {}", self.order_by.join(", ")));
        }
        sql
    }

    pub fn create_view_sql(&self) -> String {
        format!("CREATE VIEW \"{}\" AS {}", self.name, self.definition_sql())
    }

    /// Tables this view reads; the reactive engine folds these into a
    /// stream's dependency set
    pub fn base_tables(&self) -> Vec<String> {
        let mut tables = vec![self.from.clone()];
        for join in &self.joins {
            if !tables.contains(&join.table) {
                tables.push(join.table.clone());
            }
        }
        tables
    }

    /// Whether the select list exposes a column under the given name
    pub fn selects_column(&self, name: &str) -> bool {
        self.select.iter().any(|s| match &s.alias {
            Some(alias) => alias == name,
            None => {
                // Unaliased "table.col" or bare "col"
                s.expr == name || s.expr.rsplit('.').next() == Some(name)
            }
        })
    }
}

/// Collapse whitespace runs and case so formatting differences don't count
/// as schema drift
pub fn normalize_sql(sql: &str) -> String {
    sql.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_end_matches(';')
        .to_ascii_lowercase()
}

/// Fluent construction of a [`View`]
#[derive(Debug)]
pub struct ViewBuilder {
    view: View,
}

impl ViewBuilder {
    pub fn new(name: impl Into<String>, from: impl Into<String>) -> Self {
        Self {
            view: View {
                name: name.into(),
                select: Vec::new(),
                from: from.into(),
                joins: Vec::new(),
                where_clause: None,
                group_by: Vec::new(),
                having: None,
                order_by: Vec::new(),
            },
        }
    }

    pub fn select(mut self, expr: impl Into<String>) -> Self {
        self.view.select.push(SelectExpr {
            expr: expr.into(),
            alias: None,
        });
        self
    }

    pub fn select_as(mut self, expr: impl Into<String>, alias: impl Into<String>) -> Self {
        self.view.select.push(SelectExpr {
            expr: expr.into(),
            alias: Some(alias.into()),
        });
        self
    }

    pub fn join(mut self, table: impl Into<String>, on: impl Into<String>) -> Self {
        self.view.joins.push(Join {
            kind: JoinKind::Inner,
            table: table.into(),
            on: on.into(),
        });
        self
    }

    pub fn left_join(mut self, table: impl Into<String>, on: impl Into<String>) -> Self {
        self.view.joins.push(Join {
            kind: JoinKind::Left,
            table: table.into(),
            on: on.into(),
        });
        self
    }

    pub fn filter(mut self, where_clause: impl Into<String>) -> Self {
        self.view.where_clause = Some(where_clause.into());
        self
    }

    pub fn group_by(mut self, expr: impl Into<String>) -> Self {
        self.view.group_by.push(expr.into());
        self
    }

    pub fn having(mut self, expr: impl Into<String>) -> Self {
        self.view.having = Some(expr.into());
        self
    }

    pub fn order_by(mut self, expr: impl Into<String>) -> Self {
        self.view.order_by.push(expr.into());
        self
    }

    pub(crate) fn finish(self) -> View {
        self.view
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_view() -> View {
        ViewBuilder::new("active_users", "users")
            .select("users.name")
            .select_as("count(orders.system_id)", "order_count")
            .left_join("orders", "orders.user_id = users.system_id")
            .filter("users.active = 1")
            .group_by("users.name")
            .order_by("users.name")
            .finish()
    }

    #[test]
    fn test_definition_sql_is_deterministic() {
        let view = sample_view();
        assert_eq!(view.definition_sql(), sample_view().definition_sql());
        let sql = view.definition_sql();
        assert!(sql.starts_with("SELECT users.name, count(orders.system_id) AS order_count"));
        assert!(sql.contains("LEFT JOIN \"orders\""));
        assert!(sql.contains("WHERE users.active = 1"));
        assert!(sql.contains("GROUP BY users.name"));
        assert!(sql.ends_with("ORDER BY users.name"));
    }

    #[test]
    fn test_base_tables() {
        assert_eq!(sample_view().base_tables(), vec!["users", "orders"]);
    }

    #[test]
    fn test_selects_column() {
        let view = sample_view();
        assert!(view.selects_column("name"));
        assert!(view.selects_column("order_count"));
        assert!(!view.selects_column("active"));
    }

    #[test]
    fn test_normalize_sql_ignores_whitespace_and_case() {
        let a = normalize_sql("CREATE VIEW \"v\" AS\n  SELECT  x FROM t;");
        let b = normalize_sql("create view \"v\" as select x from t");
        assert_eq!(a, b);
    }
}
