// src/files/manager.rs

//! Fileset management
//!
//! A fileset column stores an opaque fileset id; the files themselves are
//! metadata rows in `__files` plus content in the repository. The manager
//! mints ids, enforces the column's `max_count` / `max_file_size_bytes`
//! bounds, and garbage-collects repository entries with no metadata row.

use crate::db::records::Record;
use crate::db::{Database, Session};
use crate::error::{Error, Result};
use crate::hlc::Hlc;
use crate::schema::LogicalType;
use rusqlite::params;
use std::collections::HashSet;
use std::io::Read;
use tracing::info;

/// Metadata for one stored file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMeta {
    pub id: String,
    pub fileset: String,
    pub name: String,
    pub size: i64,
    pub mime: Option<String>,
    pub created_at: Hlc,
    pub modified_at: Hlc,
}

impl FileMeta {
    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        let parse = |idx: usize, text: String| {
            text.parse::<Hlc>().map_err(|_| {
                rusqlite::Error::FromSqlConversionFailure(
                    idx,
                    rusqlite::types::Type::Text,
                    format!("malformed hlc '{}'", text).into(),
                )
            })
        };
        Ok(Self {
            id: row.get(0)?,
            fileset: row.get(1)?,
            name: row.get(2)?,
            size: row.get(3)?,
            mime: row.get(4)?,
            created_at: parse(5, row.get(5)?)?,
            modified_at: parse(6, row.get(6)?)?,
        })
    }
}

const SELECT_META: &str =
    "SELECT id, fileset, name, size, mime, created_at, modified_at FROM __files";

/// A bound fileset: the column's bounds plus the row's fileset id
pub struct Fileset<'a> {
    db: &'a Database,
    id: String,
    max_count: u32,
    max_file_size_bytes: u64,
}

impl Database {
    /// Bind the fileset column of a record
    ///
    /// Mints and saves a fresh fileset id into the record when the column
    /// is still empty.
    pub fn fileset<'a>(&'a self, record: &mut Record, column: &str) -> Result<Fileset<'a>> {
        let table = self
            .schema()
            .table(record.table())
            .ok_or_else(|| Error::invalid_data(format!("unknown table '{}'", record.table())))?;
        let declared = table
            .column(column)
            .ok_or_else(|| {
                Error::invalid_data(format!("unknown column '{}.{}'", record.table(), column))
            })?;
        if declared.logical_type != LogicalType::Fileset {
            return Err(Error::invalid_data(format!(
                "column '{}.{}' is not a fileset column",
                record.table(),
                column
            )));
        }
        let max_count = declared.max_count.ok_or_else(|| {
            Error::invalid_data(format!("fileset column '{}' has no max_count", column))
        })?;
        let max_file_size_bytes = declared.max_file_size_bytes.ok_or_else(|| {
            Error::invalid_data(format!("fileset column '{}' has no max_file_size_bytes", column))
        })?;

        let id = match record.get(column).and_then(|v| v.as_text()) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => {
                let id = uuid::Uuid::new_v4().to_string();
                record.set(column, id.as_str());
                self.save(record)?;
                id
            }
        };

        Ok(Fileset {
            db: self,
            id,
            max_count,
            max_file_size_bytes,
        })
    }
}

impl Fileset<'_> {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Add a file to the fileset
    ///
    /// Checks the count and size bounds, writes the content through the
    /// repository, and records the metadata row. The whole operation runs
    /// in one transaction; a crash between the repository write and the
    /// metadata commit leaves an orphan for the next GC pass.
    pub fn add(&self, name: &str, mime: Option<&str>, content: &mut dyn Read) -> Result<FileMeta> {
        let repository = self.db.repository()?.clone();

        // Read one byte past the cap so oversized content fails before the
        // repository sees it
        let mut buffer = Vec::new();
        content
            .take(self.max_file_size_bytes + 1)
            .read_to_end(&mut buffer)?;
        if buffer.len() as u64 > self.max_file_size_bytes {
            return Err(Error::invalid_data("max_file_size exceeded"));
        }

        let file_id = uuid::Uuid::new_v4().to_string();
        let size = buffer.len() as i64;

        self.db.transaction(|session| {
            let count = self.count_in(session)?;
            if count >= self.max_count as i64 {
                return Err(Error::invalid_data("max_count exceeded"));
            }

            repository.add_file(&self.id, &file_id, &mut buffer.as_slice())?;

            let hlc = session.now()?.to_string();
            session.conn.execute(
                "INSERT INTO __files (id, fileset, name, size, mime, created_at, modified_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                params![file_id, self.id, name, size, mime, hlc],
            )?;
            session.touch("__files");
            Ok(())
        })?;

        self.meta(&file_id)?.ok_or_else(|| {
            Error::not_found("__files", format!("file '{}' vanished after insert", file_id))
        })
    }

    /// Open a stored file for reading
    pub fn get(&self, file_id: &str) -> Result<Box<dyn Read + Send>> {
        if self.meta(file_id)?.is_none() {
            return Err(Error::not_found(
                "__files",
                format!("no file '{}' in fileset '{}'", file_id, self.id),
            ));
        }
        self.db.repository()?.get_file(&self.id, file_id)
    }

    /// Delete a file: the metadata row first, then the content
    pub fn delete(&self, file_id: &str) -> Result<()> {
        let removed = self.db.transaction(|session| {
            let removed = session.conn.execute(
                "DELETE FROM __files WHERE id = ?1 AND fileset = ?2",
                params![file_id, self.id],
            )?;
            if removed > 0 {
                session.touch("__files");
            }
            Ok(removed)
        })?;
        if removed == 0 {
            return Err(Error::not_found(
                "__files",
                format!("no file '{}' in fileset '{}'", file_id, self.id),
            ));
        }
        self.db.repository()?.remove_file(&self.id, file_id)
    }

    /// Metadata for every file in the fileset
    pub fn list(&self) -> Result<Vec<FileMeta>> {
        let conn = self.db.lock_conn()?;
        let mut stmt = conn.prepare(&format!("{} WHERE fileset = ?1 ORDER BY created_at", SELECT_META))?;
        let rows = stmt
            .query_map([&self.id], FileMeta::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn count(&self) -> Result<i64> {
        let conn = self.db.lock_conn()?;
        let count = conn.query_row(
            "SELECT count(*) FROM __files WHERE fileset = ?1",
            [&self.id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    fn count_in(&self, session: &Session<'_>) -> Result<i64> {
        let count = session.conn.query_row(
            "SELECT count(*) FROM __files WHERE fileset = ?1",
            [&self.id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    fn meta(&self, file_id: &str) -> Result<Option<FileMeta>> {
        use rusqlite::OptionalExtension;
        let conn = self.db.lock_conn()?;
        let meta = conn
            .query_row(
                &format!("{} WHERE id = ?1 AND fileset = ?2", SELECT_META),
                params![file_id, self.id],
                FileMeta::from_row,
            )
            .optional()?;
        Ok(meta)
    }
}

/// Outcome of a garbage collection pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GcReport {
    pub filesets_removed: usize,
    pub files_removed: usize,
}

impl Database {
    /// Remove repository content with no `__files` row
    ///
    /// `additional_valid` filesets are kept even without metadata (e.g.
    /// filesets owned by another database sharing the repository).
    /// Per-item repository failures are logged and skipped; the report
    /// counts successful removals only.
    pub fn gc_all(&self, additional_valid: &[String]) -> Result<GcReport> {
        let repository = self.repository()?.clone();

        let referenced: Vec<String> = {
            let conn = self.lock_conn()?;
            let mut stmt = conn.prepare("SELECT DISTINCT fileset FROM __files")?;
            stmt.query_map([], |row| row.get(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?
        };

        let mut valid: HashSet<String> = referenced.iter().cloned().collect();
        valid.extend(additional_valid.iter().cloned());

        let filesets_removed = repository.gc_filesets(&valid)?;

        let mut files_removed = 0;
        for fileset in &referenced {
            let valid_files: HashSet<String> = {
                let conn = self.lock_conn()?;
                let mut stmt = conn.prepare("SELECT id FROM __files WHERE fileset = ?1")?;
                stmt.query_map([fileset], |row| row.get(0))?
                    .collect::<std::result::Result<HashSet<_>, _>>()?
            };
            files_removed += repository.gc_files(fileset, &valid_files)?;
        }

        info!(
            "fileset gc removed {} fileset(s) and {} file(s)",
            filesets_removed, files_removed
        );
        Ok(GcReport {
            filesets_removed,
            files_removed,
        })
    }

}
