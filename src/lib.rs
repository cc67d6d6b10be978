// src/lib.rs

//! Strata — local-first embedded data engine
//!
//! One declarative schema drives everything: the engine reconciles it with
//! the physical SQLite database (including safe table recreation), stamps
//! per-column hybrid-logical-clock timestamps for last-writer-wins merging,
//! tracks locally changed rows for sync, manages bounded filesets of binary
//! blobs, and re-runs reactive queries when their tables change.
//!
//! # Architecture
//!
//! - Database-first: one SQLite file holds all state, system tables included
//! - Declarative schema: migrations are computed, never written by hand
//! - LWW columns: per-field timestamps resolve cross-device conflicts
//! - Outbox: dirty rows wait durably for the application's sync transport
//! - Filesets: blob content in a pluggable repository, metadata in the db

pub mod db;
mod error;
pub mod files;
pub mod hlc;
pub mod schema;
pub mod value;

pub use db::outbox::DirtyRow;
pub use db::query::{Query, Row};
pub use db::records::Record;
pub use db::streams::StreamHandle;
pub use db::sync::{RemoteColumn, RemoteRow, SyncReport};
pub use db::Database;
pub use error::{Category, DbError, Error, Operation, Result};
pub use files::manager::{FileMeta, Fileset, GcReport};
pub use files::{FileRepository, FsFileRepository, MemoryFileRepository};
pub use hlc::{Hlc, HlcClock};
pub use schema::{ColumnBuilder, Schema, SchemaBuilder, TableBuilder, ViewBuilder};
pub use value::Value;
