/*!
Local JSON index repository implementation.
*/

use super::{sort_newest_first, SnapshotRepository};
use crate::fsio::{self, FileLock};
use crate::{Result, Snapshot, SnapshotError};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Snapshot metadata stored as a JSON array in one index file
///
/// Every mutation takes an exclusive advisory lock on `<index>.lock`, reloads
/// the index, applies the change and atomically replaces the file. Separate
/// processes sharing the index (the admin CLI and a running scheduler daemon)
/// therefore never overwrite each other's writes.
///
/// # Example
/// ```rust,no_run
/// use snapkeep_core::repository::{JsonFileRepository, SnapshotRepository};
///
/// let repo = JsonFileRepository::new("/var/lib/app/snapshot_index.json");
/// for snapshot in repo.list()? {
///     println!("{} {}", snapshot.id, snapshot.kind);
/// }
/// # Ok::<(), snapkeep_core::SnapshotError>(())
/// ```
#[derive(Debug)]
pub struct JsonFileRepository {
    index_path: PathBuf,
}

impl JsonFileRepository {
    /// Create a repository backed by the index file at `index_path`
    ///
    /// The file and its parent directories are created on first write.
    pub fn new<P: AsRef<Path>>(index_path: P) -> Self {
        Self {
            index_path: index_path.as_ref().to_path_buf(),
        }
    }

    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    fn load(&self) -> Result<Vec<Snapshot>> {
        if !self.index_path.exists() {
            return Ok(Vec::new());
        }

        let raw = fs::read(&self.index_path)
            .map_err(|e| SnapshotError::io("reading", &self.index_path, e))?;
        if raw.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }

        serde_json::from_slice(&raw).map_err(|e| {
            SnapshotError::repository(format!(
                "corrupt snapshot index {}: {e}",
                self.index_path.display()
            ))
        })
    }

    fn store(&self, records: &[Snapshot]) -> Result<()> {
        let json = serde_json::to_vec_pretty(records)?;
        fsio::write_atomic(&self.index_path, &json)?;
        debug!(path = %self.index_path.display(), records = records.len(), "Wrote snapshot index");
        Ok(())
    }

    /// Load, mutate and store while holding the index lock
    fn update<T>(&self, f: impl FnOnce(&mut Vec<Snapshot>) -> Result<(T, bool)>) -> Result<T> {
        let _lock = FileLock::exclusive(&self.index_path)?;

        let mut records = self.load()?;
        let (result, changed) = f(&mut records)?;
        if changed {
            self.store(&records)?;
        }
        Ok(result)
    }
}

impl SnapshotRepository for JsonFileRepository {
    fn insert(&self, snapshot: &Snapshot) -> Result<()> {
        self.update(|records| {
            if records.iter().any(|r| r.id == snapshot.id) {
                return Err(SnapshotError::repository(format!(
                    "duplicate snapshot id {}",
                    snapshot.id
                )));
            }
            records.push(snapshot.clone());
            Ok(((), true))
        })
    }

    fn list(&self) -> Result<Vec<Snapshot>> {
        let mut records = self.load()?;
        sort_newest_first(&mut records);
        Ok(records)
    }

    fn get(&self, id: &str) -> Result<Option<Snapshot>> {
        Ok(self.load()?.into_iter().find(|r| r.id == id))
    }

    fn delete(&self, id: &str) -> Result<()> {
        self.update(|records| {
            let before = records.len();
            records.retain(|r| r.id != id);
            Ok(((), records.len() != before))
        })
    }

    fn set_retained(&self, id: &str, retained: bool) -> Result<Option<Snapshot>> {
        self.update(|records| {
            let updated = records.iter_mut().find(|r| r.id == id).map(|record| {
                record.is_retained = retained;
                record.clone()
            });
            let changed = updated.is_some();
            Ok((updated, changed))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SnapshotKind;
    use chrono::Utc;
    use tempfile::TempDir;

    #[test]
    fn test_json_repository_basic_operations() {
        let temp_dir = TempDir::new().unwrap();
        let repo = JsonFileRepository::new(temp_dir.path().join("index/snapshots.json"));

        assert!(repo.list().unwrap().is_empty());

        let snapshot = Snapshot::new(SnapshotKind::manual(), Utc::now(), "/data/a.db", 12)
            .with_actor("admin");
        repo.insert(&snapshot).unwrap();
        assert!(repo.index_path().exists());

        let reopened = JsonFileRepository::new(repo.index_path());
        assert_eq!(reopened.get(&snapshot.id).unwrap(), Some(snapshot.clone()));

        let retained = reopened.set_retained(&snapshot.id, true).unwrap().unwrap();
        assert!(retained.is_retained);
        assert!(repo.get(&snapshot.id).unwrap().unwrap().is_retained);

        repo.delete(&snapshot.id).unwrap();
        assert!(reopened.list().unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_index_is_a_repository_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("snapshots.json");
        fs::write(&path, b"[{").unwrap();

        let repo = JsonFileRepository::new(&path);
        assert!(matches!(repo.list(), Err(SnapshotError::Repository(_))));
    }

    #[test]
    fn test_list_orders_newest_first() {
        let temp_dir = TempDir::new().unwrap();
        let repo = JsonFileRepository::new(temp_dir.path().join("snapshots.json"));

        let older = Snapshot::new(
            SnapshotKind::automated_daily(),
            Utc::now() - chrono::Duration::days(2),
            "/data/old.db",
            1,
        );
        let newer = Snapshot::new(SnapshotKind::manual(), Utc::now(), "/data/new.db", 1);
        repo.insert(&older).unwrap();
        repo.insert(&newer).unwrap();

        let ids: Vec<_> = repo.list().unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![newer.id, older.id]);
    }

    #[test]
    fn test_separate_instances_do_not_lose_inserts() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("snapshots.json");

        let writers: Vec<_> = (0..2)
            .map(|writer| {
                // Each writer opens its own handle, as a second process would.
                let repo = JsonFileRepository::new(&path);
                std::thread::spawn(move || {
                    for n in 0..50 {
                        let record = Snapshot::new(
                            SnapshotKind::automated_daily(),
                            Utc::now(),
                            format!("/data/{writer}_{n}.db"),
                            1,
                        );
                        repo.insert(&record).unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        assert_eq!(JsonFileRepository::new(&path).list().unwrap().len(), 100);
    }

    #[test]
    fn test_concurrent_flag_and_delete_both_apply() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("snapshots.json");
        let seed = JsonFileRepository::new(&path);
        let keep = Snapshot::new(SnapshotKind::automated_daily(), Utc::now(), "/data/k.db", 1);
        let gone = Snapshot::new(SnapshotKind::automated_daily(), Utc::now(), "/data/d.db", 1);
        seed.insert(&keep).unwrap();
        seed.insert(&gone).unwrap();

        let (flagger, deleter) = (JsonFileRepository::new(&path), JsonFileRepository::new(&path));
        let keep_id = keep.id.clone();
        let gone_id = gone.id.clone();
        let a = std::thread::spawn(move || flagger.set_retained(&keep_id, true).unwrap());
        let b = std::thread::spawn(move || deleter.delete(&gone_id).unwrap());
        a.join().unwrap();
        b.join().unwrap();

        let records = seed.list().unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].is_retained);
    }
}
