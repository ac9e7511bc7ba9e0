//! File helpers shared by the JSON-file stores.
//!
//! `FileLock` is an OS advisory lock on a `<file>.lock` sidecar, held across a
//! whole read-modify-write so separate processes sharing a store do not lose
//! each other's updates. `write_atomic` replaces a file through a synced temp
//! file and a rename.

use crate::{Result, SnapshotError};
use fs2::FileExt;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Exclusive advisory lock, released on drop
#[derive(Debug)]
pub(crate) struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Block until the lock guarding `target` is held
    pub(crate) fn exclusive(target: &Path) -> Result<Self> {
        let path = lock_path(target);
        ensure_parent(&path)?;

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| SnapshotError::io("opening lock file", &path, e))?;
        FileExt::lock_exclusive(&file).map_err(|e| SnapshotError::io("locking", &path, e))?;

        Ok(Self { file, path })
    }

    #[cfg(test)]
    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // Closing the handle releases the lock as well.
        let _ = FileExt::unlock(&self.file);
    }
}

/// `<target>.lock`
pub(crate) fn lock_path(target: &Path) -> PathBuf {
    let mut name: OsString = target.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn ensure_parent(path: &Path) -> Result<PathBuf> {
    let dir = parent_dir(path);
    fs::create_dir_all(&dir).map_err(|e| SnapshotError::io("creating directory", &dir, e))?;
    Ok(dir)
}

/// Replace `path` with `bytes`: write and sync a sibling temp file, then rename
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = ensure_parent(path)?;

    let mut tmp = tempfile::NamedTempFile::new_in(&dir)
        .map_err(|e| SnapshotError::io("creating temp file in", &dir, e))?;
    tmp.write_all(bytes)
        .map_err(|e| SnapshotError::io("writing", tmp.path(), e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| SnapshotError::io("syncing", tmp.path(), e))?;
    tmp.persist(path)
        .map_err(|e| SnapshotError::io("replacing", path, e.error))?;
    Ok(())
}
