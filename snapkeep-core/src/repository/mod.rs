/*!
Snapshot metadata repositories.

This module defines the persistence abstraction (port) for snapshot records and
its concrete implementations (adapters). The engine never touches the metadata
store directly, so the host application can plug in its own database while the
adapters here cover embedding and tests.
*/

pub mod local;

use crate::{Result, Snapshot, SnapshotError};
use std::sync::Mutex;

pub use local::JsonFileRepository;

/// Persistence contract for snapshot metadata
///
/// Each call is expected to be individually consistent (one transaction per
/// write); no locking is imposed across calls.
pub trait SnapshotRepository: Send + Sync {
    /// Persist a new record
    ///
    /// # Arguments
    /// * `snapshot` - The record to store; its id must not exist yet
    fn insert(&self, snapshot: &Snapshot) -> Result<()>;

    /// All records ordered by `created_at`, newest first
    fn list(&self) -> Result<Vec<Snapshot>>;

    /// Fetch a single record
    ///
    /// # Returns
    /// `Ok(None)` when no record has this id
    fn get(&self, id: &str) -> Result<Option<Snapshot>>;

    /// Remove a record; deleting an unknown id is not an error
    fn delete(&self, id: &str) -> Result<()>;

    /// Toggle the retention exemption flag
    ///
    /// # Returns
    /// The updated record, or `Ok(None)` when no record has this id
    fn set_retained(&self, id: &str, retained: bool) -> Result<Option<Snapshot>>;
}

pub(crate) fn sort_newest_first(records: &mut [Snapshot]) {
    records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
}

/// In-memory repository
///
/// Stores records in a mutex-guarded vector. Used by tests and by embedders
/// that keep metadata elsewhere.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    records: Mutex<Vec<Snapshot>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<Snapshot>>> {
        self.records
            .lock()
            .map_err(|_| SnapshotError::repository("repository lock poisoned"))
    }
}

impl SnapshotRepository for MemoryRepository {
    fn insert(&self, snapshot: &Snapshot) -> Result<()> {
        let mut records = self.lock()?;
        if records.iter().any(|r| r.id == snapshot.id) {
            return Err(SnapshotError::repository(format!(
                "duplicate snapshot id {}",
                snapshot.id
            )));
        }
        records.push(snapshot.clone());
        Ok(())
    }

    fn list(&self) -> Result<Vec<Snapshot>> {
        let mut records = self.lock()?.clone();
        sort_newest_first(&mut records);
        Ok(records)
    }

    fn get(&self, id: &str) -> Result<Option<Snapshot>> {
        Ok(self.lock()?.iter().find(|r| r.id == id).cloned())
    }

    fn delete(&self, id: &str) -> Result<()> {
        self.lock()?.retain(|r| r.id != id);
        Ok(())
    }

    fn set_retained(&self, id: &str, retained: bool) -> Result<Option<Snapshot>> {
        let mut records = self.lock()?;
        Ok(records.iter_mut().find(|r| r.id == id).map(|record| {
            record.is_retained = retained;
            record.clone()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SnapshotKind;
    use chrono::{Duration, Utc};

    fn record(age_days: i64) -> Snapshot {
        Snapshot::new(
            SnapshotKind::automated_daily(),
            Utc::now() - Duration::days(age_days),
            format!("/snapshots/{age_days}.db"),
            1,
        )
    }

    #[test]
    fn test_list_is_newest_first() {
        let repo = MemoryRepository::new();
        for age in [5, 1, 9, 3] {
            repo.insert(&record(age)).unwrap();
        }

        let listed = repo.list().unwrap();
        let ages: Vec<_> = listed
            .iter()
            .map(|s| (Utc::now() - s.created_at).num_days())
            .collect();
        assert_eq!(ages, vec![1, 3, 5, 9]);
    }

    #[test]
    fn test_get_delete_and_retain() {
        let repo = MemoryRepository::new();
        let snapshot = record(1);
        repo.insert(&snapshot).unwrap();

        let updated = repo.set_retained(&snapshot.id, true).unwrap().unwrap();
        assert!(updated.is_retained);
        assert!(repo.get(&snapshot.id).unwrap().unwrap().is_retained);

        repo.delete(&snapshot.id).unwrap();
        assert!(repo.get(&snapshot.id).unwrap().is_none());
        assert!(repo.set_retained(&snapshot.id, false).unwrap().is_none());
        repo.delete(&snapshot.id).unwrap();
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let repo = MemoryRepository::new();
        let snapshot = record(1);
        repo.insert(&snapshot).unwrap();
        assert!(repo.insert(&snapshot).is_err());
    }
}
