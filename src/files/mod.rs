// src/files/mod.rs

//! Blob repositories for fileset content
//!
//! File content lives outside the database under `<fileset_id>/<file_id>`;
//! only metadata goes in `__files`. The repository is the one resource that
//! may be shared across processes, so `add_file` is idempotent on
//! `(fileset, file_id)` and writes land via temp-file + rename. Garbage
//! collection removes entries with no metadata row, logging and skipping
//! per-item failures.

pub mod manager;

use crate::error::{Error, Result};
use std::collections::HashSet;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Abstract blob store for fileset content
pub trait FileRepository: Send + Sync {
    /// Store a file durably; idempotent on `(fileset, file_id)`. Returns
    /// the number of bytes stored.
    fn add_file(&self, fileset: &str, file_id: &str, content: &mut dyn Read) -> Result<u64>;

    /// Open a file for reading
    fn get_file(&self, fileset: &str, file_id: &str) -> Result<Box<dyn Read + Send>>;

    /// Remove a file; removing an absent file is not an error
    fn remove_file(&self, fileset: &str, file_id: &str) -> Result<()>;

    /// Remove every fileset not in the valid set; returns removed count
    fn gc_filesets(&self, valid: &HashSet<String>) -> Result<usize>;

    /// Remove every file in one fileset not in the valid set; returns
    /// removed count
    fn gc_files(&self, fileset: &str, valid: &HashSet<String>) -> Result<usize>;
}

/// Ids come from the engine as UUIDs, but the repository is a process
/// boundary: reject anything that could escape the root
fn check_id(id: &str) -> Result<()> {
    if id.is_empty() || id.contains('/') || id.contains('\\') || id.contains("..") {
        return Err(Error::invalid_data(format!("invalid repository id '{}'", id)));
    }
    Ok(())
}

/// Filesystem-backed repository: `ROOT/<fileset_id>/<file_id>`
pub struct FsFileRepository {
    root: PathBuf,
}

impl FsFileRepository {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.exists() {
            fs::create_dir_all(&root)?;
            debug!("created file repository root {:?}", root);
        }
        Ok(Self { root })
    }

    fn file_path(&self, fileset: &str, file_id: &str) -> Result<PathBuf> {
        check_id(fileset)?;
        check_id(file_id)?;
        Ok(self.root.join(fileset).join(file_id))
    }
}

impl FileRepository for FsFileRepository {
    fn add_file(&self, fileset: &str, file_id: &str, content: &mut dyn Read) -> Result<u64> {
        let path = self.file_path(fileset, file_id)?;

        // A finished write from an earlier attempt satisfies the call
        if path.exists() {
            debug!("file {}/{} already stored", fileset, file_id);
            return Ok(path.metadata()?.len());
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Write to a temp name, then rename into place
        let temp_path = path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path)?;
        let written = std::io::copy(content, &mut file)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&temp_path, &path)?;

        debug!("stored {}/{} ({} bytes)", fileset, file_id, written);
        Ok(written)
    }

    fn get_file(&self, fileset: &str, file_id: &str) -> Result<Box<dyn Read + Send>> {
        let path = self.file_path(fileset, file_id)?;
        let file = fs::File::open(&path)?;
        Ok(Box::new(file))
    }

    fn remove_file(&self, fileset: &str, file_id: &str) -> Result<()> {
        let path = self.file_path(fileset, file_id)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn gc_filesets(&self, valid: &HashSet<String>) -> Result<usize> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.root)? {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("gc: unreadable directory entry skipped: {}", e);
                    continue;
                }
            };
            let name = entry.file_name().to_string_lossy().to_string();
            if valid.contains(&name) || !entry.path().is_dir() {
                continue;
            }
            match fs::remove_dir_all(entry.path()) {
                Ok(()) => {
                    debug!("gc: removed orphan fileset {}", name);
                    removed += 1;
                }
                Err(e) => warn!("gc: failed to remove fileset {}: {}", name, e),
            }
        }
        Ok(removed)
    }

    fn gc_files(&self, fileset: &str, valid: &HashSet<String>) -> Result<usize> {
        check_id(fileset)?;
        let dir = self.root.join(fileset);
        if !dir.exists() {
            return Ok(0);
        }

        let mut removed = 0;
        for entry in fs::read_dir(&dir)? {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("gc: unreadable file entry skipped: {}", e);
                    continue;
                }
            };
            let name = entry.file_name().to_string_lossy().to_string();
            if valid.contains(&name) {
                continue;
            }
            match fs::remove_file(entry.path()) {
                Ok(()) => {
                    debug!("gc: removed orphan file {}/{}", fileset, name);
                    removed += 1;
                }
                Err(e) => warn!("gc: failed to remove file {}/{}: {}", fileset, name, e),
            }
        }
        Ok(removed)
    }
}

/// In-memory repository, for tests and ephemeral databases
#[derive(Default)]
pub struct MemoryFileRepository {
    filesets: Mutex<std::collections::HashMap<String, std::collections::HashMap<String, Vec<u8>>>>,
}

impl MemoryFileRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, std::collections::HashMap<String, std::collections::HashMap<String, Vec<u8>>>>> {
        self.filesets
            .lock()
            .map_err(|_| Error::invalid_data("repository mutex poisoned"))
    }
}

impl FileRepository for MemoryFileRepository {
    fn add_file(&self, fileset: &str, file_id: &str, content: &mut dyn Read) -> Result<u64> {
        check_id(fileset)?;
        check_id(file_id)?;
        let mut buffer = Vec::new();
        content.read_to_end(&mut buffer)?;
        let len = buffer.len() as u64;

        let mut filesets = self.lock()?;
        let files = filesets.entry(fileset.to_string()).or_default();
        // Idempotent: the first durable write wins
        files.entry(file_id.to_string()).or_insert(buffer);
        Ok(len)
    }

    fn get_file(&self, fileset: &str, file_id: &str) -> Result<Box<dyn Read + Send>> {
        let filesets = self.lock()?;
        let content = filesets
            .get(fileset)
            .and_then(|files| files.get(file_id))
            .cloned()
            .ok_or_else(|| {
                Error::not_found("__files", format!("no stored file {}/{}", fileset, file_id))
            })?;
        Ok(Box::new(std::io::Cursor::new(content)))
    }

    fn remove_file(&self, fileset: &str, file_id: &str) -> Result<()> {
        let mut filesets = self.lock()?;
        if let Some(files) = filesets.get_mut(fileset) {
            files.remove(file_id);
        }
        Ok(())
    }

    fn gc_filesets(&self, valid: &HashSet<String>) -> Result<usize> {
        let mut filesets = self.lock()?;
        let before = filesets.len();
        filesets.retain(|name, _| valid.contains(name));
        Ok(before - filesets.len())
    }

    fn gc_files(&self, fileset: &str, valid: &HashSet<String>) -> Result<usize> {
        let mut filesets = self.lock()?;
        let Some(files) = filesets.get_mut(fileset) else {
            return Ok(0);
        };
        let before = files.len();
        files.retain(|name, _| valid.contains(name));
        Ok(before - files.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn valid_set(names: &[&str]) -> HashSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn store(repo: &dyn FileRepository, fileset: &str, file_id: &str, content: &[u8]) {
        repo.add_file(fileset, file_id, &mut &content[..]).unwrap();
    }

    fn fetch(repo: &dyn FileRepository, fileset: &str, file_id: &str) -> Vec<u8> {
        let mut reader = repo.get_file(fileset, file_id).unwrap();
        let mut buffer = Vec::new();
        reader.read_to_end(&mut buffer).unwrap();
        buffer
    }

    #[test]
    fn test_fs_store_and_retrieve() {
        let temp = TempDir::new().unwrap();
        let repo = FsFileRepository::new(temp.path()).unwrap();

        store(&repo, "fs1", "f1", b"hello blob");
        assert_eq!(fetch(&repo, "fs1", "f1"), b"hello blob");
        assert!(temp.path().join("fs1").join("f1").exists());
    }

    #[test]
    fn test_fs_add_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let repo = FsFileRepository::new(temp.path()).unwrap();

        store(&repo, "fs1", "f1", b"original");
        // A crashed-and-retried write must not clobber the stored content
        let written = repo.add_file("fs1", "f1", &mut &b"retry"[..]).unwrap();
        assert_eq!(written, 8);
        assert_eq!(fetch(&repo, "fs1", "f1"), b"original");
    }

    #[test]
    fn test_fs_remove_absent_is_ok() {
        let temp = TempDir::new().unwrap();
        let repo = FsFileRepository::new(temp.path()).unwrap();
        assert!(repo.remove_file("fs1", "missing").is_ok());
    }

    #[test]
    fn test_fs_rejects_escaping_ids() {
        let temp = TempDir::new().unwrap();
        let repo = FsFileRepository::new(temp.path()).unwrap();
        assert!(repo.add_file("../evil", "f", &mut &b"x"[..]).is_err());
        assert!(repo.get_file("fs", "a/b").is_err());
    }

    #[test]
    fn test_fs_gc_filesets_removes_orphans() {
        let temp = TempDir::new().unwrap();
        let repo = FsFileRepository::new(temp.path()).unwrap();

        store(&repo, "keep", "f1", b"a");
        store(&repo, "orphan", "f1", b"b");

        let removed = repo.gc_filesets(&valid_set(&["keep"])).unwrap();
        assert_eq!(removed, 1);
        assert!(temp.path().join("keep").exists());
        assert!(!temp.path().join("orphan").exists());
    }

    #[test]
    fn test_fs_gc_files_removes_orphans() {
        let temp = TempDir::new().unwrap();
        let repo = FsFileRepository::new(temp.path()).unwrap();

        store(&repo, "fs1", "keep", b"a");
        store(&repo, "fs1", "orphan", b"b");

        let removed = repo.gc_files("fs1", &valid_set(&["keep"])).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(fetch(&repo, "fs1", "keep"), b"a");
    }

    #[test]
    fn test_memory_round_trip_and_gc() {
        let repo = MemoryFileRepository::new();
        store(&repo, "fs1", "f1", b"abc");
        store(&repo, "fs2", "f1", b"def");

        assert_eq!(fetch(&repo, "fs1", "f1"), b"abc");

        let removed = repo.gc_filesets(&valid_set(&["fs1"])).unwrap();
        assert_eq!(removed, 1);
        assert!(repo.get_file("fs2", "f1").is_err());

        let removed = repo.gc_files("fs1", &valid_set(&[])).unwrap();
        assert_eq!(removed, 1);
    }

    #[test]
    fn test_memory_add_is_idempotent() {
        let repo = MemoryFileRepository::new();
        store(&repo, "fs1", "f1", b"original");
        store(&repo, "fs1", "f1", b"retry");
        assert_eq!(fetch(&repo, "fs1", "f1"), b"original");
    }
}
