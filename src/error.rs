// src/error.rs

//! Error taxonomy for the strata engine
//!
//! Engine failures are normalized into a small set of categories, each tagged
//! with the kind of operation that produced it and optional table/column
//! metadata. The originating `rusqlite` or I/O error is preserved as the
//! source.

use thiserror::Error;

/// Normalized failure categories
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    ConstraintViolation,
    NotFound,
    InvalidData,
    AccessDenied,
    DatabaseLocked,
    ConnectionError,
    Corruption,
    SchemaMismatch,
    ConcurrencyConflict,
    Unknown,
}

impl Category {
    pub fn as_str(&self) -> &str {
        match self {
            Category::ConstraintViolation => "constraint violation",
            Category::NotFound => "not found",
            Category::InvalidData => "invalid data",
            Category::AccessDenied => "access denied",
            Category::DatabaseLocked => "database locked",
            Category::ConnectionError => "connection error",
            Category::Corruption => "corruption",
            Category::SchemaMismatch => "schema mismatch",
            Category::ConcurrencyConflict => "concurrency conflict",
            Category::Unknown => "unknown error",
        }
    }
}

/// Kind of operation that produced an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Create,
    Read,
    Update,
    Delete,
    Transaction,
    Connection,
    Migration,
}

impl Operation {
    pub fn as_str(&self) -> &str {
        match self {
            Operation::Create => "create",
            Operation::Read => "read",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::Transaction => "transaction",
            Operation::Connection => "connection",
            Operation::Migration => "migration",
        }
    }
}

/// A normalized database error: category + operation + optional metadata
#[derive(Error, Debug)]
pub struct DbError {
    pub category: Category,
    pub operation: Operation,
    pub table: Option<String>,
    pub column: Option<String>,
    pub context: Option<String>,
    #[source]
    pub cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl std::fmt::Display for DbError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} during {}", self.category.as_str(), self.operation.as_str())?;
        if let Some(table) = &self.table {
            write!(f, " on table '{}'", table)?;
        }
        if let Some(column) = &self.column {
            write!(f, " column '{}'", column)?;
        }
        if let Some(context) = &self.context {
            write!(f, ": {}", context)?;
        }
        Ok(())
    }
}

impl DbError {
    pub fn new(category: Category, operation: Operation) -> Self {
        Self {
            category,
            operation,
            table: None,
            column: None,
            context: None,
            cause: None,
        }
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn with_column(mut self, column: impl Into<String>) -> Self {
        self.column = Some(column.into());
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

/// Core error type for strata
#[derive(Error, Debug)]
pub enum Error {
    /// Declarative schema failed validation at build time
    #[error("invalid schema at {location}: {reason}")]
    InvalidSchema { reason: String, location: String },

    /// Normalized engine error
    #[error(transparent)]
    Db(#[from] DbError),
}

impl Error {
    pub fn invalid_schema(reason: impl Into<String>, location: impl Into<String>) -> Self {
        Error::InvalidSchema {
            reason: reason.into(),
            location: location.into(),
        }
    }

    /// Application data rejected by engine-side validation
    pub fn invalid_data(reason: impl Into<String>) -> Self {
        Error::Db(DbError::new(Category::InvalidData, Operation::Update).with_context(reason))
    }

    pub fn not_found(table: impl Into<String>, context: impl Into<String>) -> Self {
        Error::Db(
            DbError::new(Category::NotFound, Operation::Read)
                .with_table(table)
                .with_context(context),
        )
    }

    pub fn schema_mismatch(context: impl Into<String>) -> Self {
        Error::Db(DbError::new(Category::SchemaMismatch, Operation::Migration).with_context(context))
    }

    pub fn corruption(context: impl Into<String>) -> Self {
        Error::Db(DbError::new(Category::Corruption, Operation::Migration).with_context(context))
    }

    /// The normalized category, if this is an engine error
    pub fn category(&self) -> Option<Category> {
        match self {
            Error::InvalidSchema { .. } => None,
            Error::Db(db) => Some(db.category),
        }
    }

    /// Re-tag the operation kind on an engine error
    ///
    /// Conversions via `?` default to `Read`; mutating call sites re-tag.
    pub fn during(mut self, operation: Operation) -> Self {
        if let Error::Db(db) = &mut self {
            db.operation = operation;
        }
        self
    }

    pub fn on_table(mut self, table: &str) -> Self {
        if let Error::Db(db) = &mut self {
            if db.table.is_none() {
                db.table = Some(table.to_string());
            }
        }
        self
    }

    /// True for transient lock contention worth retrying
    pub fn is_locked(&self) -> bool {
        self.category() == Some(Category::DatabaseLocked)
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        let category = match &e {
            rusqlite::Error::SqliteFailure(code, _) => match code.code {
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked => {
                    Category::DatabaseLocked
                }
                rusqlite::ErrorCode::ConstraintViolation => Category::ConstraintViolation,
                rusqlite::ErrorCode::DatabaseCorrupt | rusqlite::ErrorCode::NotADatabase => {
                    Category::Corruption
                }
                rusqlite::ErrorCode::CannotOpen => Category::ConnectionError,
                rusqlite::ErrorCode::PermissionDenied
                | rusqlite::ErrorCode::ReadOnly
                | rusqlite::ErrorCode::AuthorizationForStatementDenied => Category::AccessDenied,
                _ => Category::Unknown,
            },
            rusqlite::Error::QueryReturnedNoRows => Category::NotFound,
            rusqlite::Error::InvalidColumnName(_) => Category::SchemaMismatch,
            _ => Category::Unknown,
        };

        Error::Db(DbError {
            category,
            operation: Operation::Read,
            table: None,
            column: None,
            context: None,
            cause: Some(Box::new(e)),
        })
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        let category = match e.kind() {
            std::io::ErrorKind::NotFound => Category::NotFound,
            std::io::ErrorKind::PermissionDenied => Category::AccessDenied,
            _ => Category::Unknown,
        };

        Error::Db(DbError {
            category,
            operation: Operation::Read,
            table: None,
            column: None,
            context: None,
            cause: Some(Box::new(e)),
        })
    }
}

/// Result type alias using strata's Error type
pub type Result<T> = std::result::Result<T, Error>;
