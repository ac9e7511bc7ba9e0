/*!
Snapshot engine that owns every create, restore, schedule and retention decision.

The engine is synchronous and shareable: admin entry points call it directly on
the caller's thread, and the scheduler holds it behind an `Arc` on its own
worker thread. It imposes no locking of its own across operations; the
repository and the filesystem provide per-call consistency.
*/

use crate::config::SnapshotConfig;
use crate::observability;
use crate::repository::SnapshotRepository;
use crate::retention::{self, RetentionPolicy};
use crate::schedule;
use crate::settings::SettingsProvider;
use crate::{Result, Snapshot, SnapshotError, SnapshotKind};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// When the next automated snapshot is due
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NextRun {
    /// Whether automation is enabled at all
    pub enabled: bool,
    /// Next due instant; may already be in the past
    pub at: DateTime<Utc>,
}

/// Schedule information rendered by the admin surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScheduleStatus {
    pub enabled: bool,
    pub next_run: DateTime<Utc>,
    /// Enabled and the next run is not in the future
    pub overdue: bool,
}

/// Totals over recorded snapshot sizes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiskUsage {
    pub count: usize,
    pub total_bytes: u64,
}

/// Path of the pre-restore copy of `live_file` taken at `at`
///
/// Format: {live_file}.pre_restore_{YYYYmmdd_HHMMSS}
pub fn pre_restore_path(live_file: &Path, at: DateTime<Utc>) -> PathBuf {
    let mut name: OsString = live_file.as_os_str().to_owned();
    name.push(format!(".pre_restore_{}", at.format("%Y%m%d_%H%M%S")));
    PathBuf::from(name)
}

/// Copy the live file to a fresh pre-restore path that did not exist before
///
/// Within one second the name gains a `_<n>` suffix, so an earlier backup is
/// never overwritten.
pub(crate) fn backup_live_file(live_file: &Path, at: DateTime<Utc>) -> Result<PathBuf> {
    const MAX_SUFFIX: u32 = 1000;

    let base = pre_restore_path(live_file, at);
    let mut source =
        fs::File::open(live_file).map_err(|e| SnapshotError::io("opening", live_file, e))?;

    for attempt in 0..=MAX_SUFFIX {
        let candidate = if attempt == 0 {
            base.clone()
        } else {
            let mut name: OsString = base.as_os_str().to_owned();
            name.push(format!("_{attempt}"));
            PathBuf::from(name)
        };

        let mut dest = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
        {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(SnapshotError::io("creating backup", &candidate, e)),
        };

        io::copy(&mut source, &mut dest)
            .and_then(|_| dest.sync_all())
            .map_err(|e| SnapshotError::io("backing up live data file to", &candidate, e))?;
        return Ok(candidate);
    }

    Err(SnapshotError::io(
        "creating backup",
        &base,
        io::Error::new(io::ErrorKind::AlreadyExists, "too many backups this second"),
    ))
}

fn copy_file(from: &Path, to: &Path, operation: &'static str, missing: &'static str) -> Result<u64> {
    fs::copy(from, to).map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound && !from.exists() {
            SnapshotError::not_found(missing, from)
        } else {
            SnapshotError::io(operation, to, e)
        }
    })
}

/// Main engine for snapshot operations
///
/// # Example
/// ```rust,no_run
/// use snapkeep_core::{SnapshotEngine, SnapshotKind};
/// use snapkeep_core::repository::JsonFileRepository;
/// use snapkeep_core::settings::JsonFileSettings;
///
/// let engine = SnapshotEngine::new(
///     JsonFileRepository::new("/srv/app/snapshot_index.json"),
///     JsonFileSettings::new("/srv/app/settings.json"),
///     "/srv/app/app.db",
///     "/srv/app",
/// );
///
/// // Manual snapshot on the caller's thread
/// let snapshot = engine.create(SnapshotKind::manual(), Some("admin"), Some("before upgrade"), true)?;
///
/// // Roll the live file back to it
/// let backup = engine.restore(&snapshot)?;
/// # Ok::<(), snapkeep_core::SnapshotError>(())
/// ```
pub struct SnapshotEngine<R, P>
where
    R: SnapshotRepository,
    P: SettingsProvider,
{
    repository: R,
    settings: P,
    data_file: PathBuf,
    app_root: PathBuf,
}

impl<R, P> SnapshotEngine<R, P>
where
    R: SnapshotRepository,
    P: SettingsProvider,
{
    /// Create a new engine
    ///
    /// # Arguments
    /// * `repository` - Metadata store for snapshot records
    /// * `settings` - Settings store the configuration is read from
    /// * `data_file` - The primary data file being protected
    /// * `app_root` - Base for a relative `snapshot_dir` setting
    pub fn new<D, A>(repository: R, settings: P, data_file: D, app_root: A) -> Self
    where
        D: Into<PathBuf>,
        A: Into<PathBuf>,
    {
        Self {
            repository,
            settings,
            data_file: data_file.into(),
            app_root: app_root.into(),
        }
    }

    pub fn repository(&self) -> &R {
        &self.repository
    }

    pub fn settings(&self) -> &P {
        &self.settings
    }

    pub fn data_file(&self) -> &Path {
        &self.data_file
    }

    /// Current validated configuration, read fresh from the settings store
    pub fn config(&self) -> SnapshotConfig {
        SnapshotConfig::from_settings(&self.settings)
    }

    /// Directory new snapshots are written to
    pub fn snapshot_dir(&self) -> PathBuf {
        self.config().resolve_snapshot_dir(&self.app_root)
    }

    /// Copy the primary data file into the snapshot directory and record it
    ///
    /// This method:
    /// 1. Checks the primary data file exists
    /// 2. Creates the snapshot directory if needed
    /// 3. Copies the data file byte-for-byte under a timestamped name
    /// 4. Measures and hashes the copy
    /// 5. Inserts the metadata record
    ///
    /// # Arguments
    /// * `kind` - `MANUAL`, `AUTOMATED_DAILY` or another kind tag
    /// * `actor` - User the snapshot is attributed to; `None` for the scheduler
    /// * `description` - Optional free text
    /// * `retain` - Exempt the snapshot from automatic retention
    ///
    /// # Returns
    /// The persisted record
    ///
    /// # Errors
    /// * `SnapshotError::NotFound` - The primary data file does not exist; nothing is recorded
    /// * `SnapshotError::Io` - Directory creation, copy or measurement failed
    /// * `SnapshotError::Repository` - The record could not be stored; the copy is removed
    pub fn create(
        &self,
        kind: SnapshotKind,
        actor: Option<&str>,
        description: Option<&str>,
        retain: bool,
    ) -> Result<Snapshot> {
        self.create_at(kind, actor, description, retain, Utc::now())
    }

    /// Same as [`SnapshotEngine::create`], stamped with `created_at`
    ///
    /// The scheduler passes the instant its due check was evaluated at, so the
    /// record lands on the UTC day that check was about even when the copy
    /// finishes after midnight.
    pub fn create_at(
        &self,
        kind: SnapshotKind,
        actor: Option<&str>,
        description: Option<&str>,
        retain: bool,
        created_at: DateTime<Utc>,
    ) -> Result<Snapshot> {
        let result = self.create_inner(kind, actor, description, retain, created_at);
        match &result {
            Ok(snapshot) => observability::record_snapshot_created(snapshot.size_bytes),
            Err(_) => observability::record_snapshot_failure(),
        }
        result
    }

    fn create_inner(
        &self,
        kind: SnapshotKind,
        actor: Option<&str>,
        description: Option<&str>,
        retain: bool,
        created_at: DateTime<Utc>,
    ) -> Result<Snapshot> {
        if !self.data_file.is_file() {
            return Err(SnapshotError::not_found("primary data file", &self.data_file));
        }

        let dir = self.snapshot_dir();
        fs::create_dir_all(&dir).map_err(|e| SnapshotError::io("creating directory", &dir, e))?;

        let extension = self.data_file.extension().and_then(|ext| ext.to_str());
        let dest = dir.join(Snapshot::suggested_filename(created_at, &kind, extension));
        if dest.exists() {
            warn!(path = %dest.display(), "Snapshot file name already taken this second; overwriting");
        }

        copy_file(&self.data_file, &dest, "copying data file to", "primary data file")?;

        let size_bytes = fs::metadata(&dest)
            .map_err(|e| SnapshotError::io("measuring", &dest, e))?
            .len();
        let content_hash = Snapshot::hash_file(&dest)?;
        let file_path = fs::canonicalize(&dest).unwrap_or_else(|_| dest.clone());

        let mut snapshot = Snapshot::new(kind, created_at, file_path, size_bytes)
            .with_content_hash(content_hash)
            .with_retained(retain);
        if let Some(actor) = actor {
            snapshot = snapshot.with_actor(actor);
        }
        if let Some(description) = description {
            snapshot = snapshot.with_description(description);
        }

        if let Err(e) = self.repository.insert(&snapshot) {
            if let Err(rm) = fs::remove_file(&snapshot.file_path) {
                warn!(path = %snapshot.file_path.display(), error = %rm, "Failed to remove orphaned snapshot copy");
            }
            return Err(e);
        }

        info!(
            snapshot_id = %snapshot.id,
            kind = %snapshot.kind,
            size_bytes = snapshot.size_bytes,
            path = %snapshot.file_path.display(),
            actor = actor.unwrap_or("system"),
            "Created snapshot"
        );
        Ok(snapshot)
    }

    /// Replace the live data file with the content of a snapshot
    ///
    /// The current live file is first copied to
    /// `<data_file>.pre_restore_<timestamp>`, then the snapshot is copied over
    /// the live path. The two steps are not atomic: if the second copy fails
    /// partway the live file may be inconsistent, but the backup is intact.
    ///
    /// # Returns
    /// The pre-restore backup path, or `None` when there was no live file to
    /// preserve
    ///
    /// # Errors
    /// * `SnapshotError::NotFound` - The snapshot file is gone; nothing is touched
    /// * `SnapshotError::Io` - Either copy failed
    pub fn restore(&self, snapshot: &Snapshot) -> Result<Option<PathBuf>> {
        if !snapshot.file_path.is_file() {
            return Err(SnapshotError::not_found("snapshot file", &snapshot.file_path));
        }

        let backup = if self.data_file.exists() {
            let backup = backup_live_file(&self.data_file, Utc::now())?;
            debug!(path = %backup.display(), "Saved pre-restore copy");
            Some(backup)
        } else {
            warn!(path = %self.data_file.display(), "No live data file to preserve before restore");
            if let Some(parent) = self.data_file.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)
                    .map_err(|e| SnapshotError::io("creating directory", parent, e))?;
            }
            None
        };

        copy_file(&snapshot.file_path, &self.data_file, "restoring over", "snapshot file")?;
        observability::record_restore();

        info!(
            snapshot_id = %snapshot.id,
            data_file = %self.data_file.display(),
            backup = ?backup,
            "Restored snapshot"
        );
        Ok(backup)
    }

    /// Look up a snapshot by id and restore it
    pub fn restore_by_id(&self, id: &str) -> Result<(Snapshot, Option<PathBuf>)> {
        let snapshot = self.get(id)?;
        let backup = self.restore(&snapshot)?;
        Ok((snapshot, backup))
    }

    /// Whether an automated snapshot exists for the given UTC day
    pub fn has_automated_on(&self, day: NaiveDate) -> Result<bool> {
        Ok(self
            .repository
            .list()?
            .iter()
            .any(|s| s.kind.is_automated() && s.created_at.date_naive() == day))
    }

    /// Decide whether the automated daily snapshot is due at `now`
    ///
    /// Idempotent and safe to call at any frequency: once an automated
    /// snapshot exists for `now`'s UTC day this returns false until the next
    /// day.
    pub fn should_run_automated(&self, now: DateTime<Utc>) -> Result<bool> {
        let config = self.config();
        if !config.auto_enabled {
            return Ok(false);
        }
        let ran_today = self.has_automated_on(now.date_naive())?;
        Ok(schedule::should_run(&config, now, ran_today))
    }

    /// Compute when the next automated snapshot is due
    ///
    /// Today's slot is returned even when already past, unless today's
    /// snapshot exists, in which case it is tomorrow's slot.
    pub fn next_scheduled_run(&self, now: DateTime<Utc>) -> Result<NextRun> {
        let config = self.config();
        let ran_today = self.has_automated_on(now.date_naive())?;
        Ok(NextRun {
            enabled: config.auto_enabled,
            at: schedule::next_run(&config, now, ran_today),
        })
    }

    /// Schedule information for the admin surface
    pub fn schedule_status(&self, now: DateTime<Utc>) -> Result<ScheduleStatus> {
        let next = self.next_scheduled_run(now)?;
        Ok(ScheduleStatus {
            enabled: next.enabled,
            next_run: next.at,
            overdue: next.enabled && next.at <= now,
        })
    }

    /// Apply the retention policy now
    ///
    /// # Returns
    /// Number of records removed
    pub fn enforce_retention(&self) -> Result<usize> {
        self.enforce_retention_at(Utc::now())
    }

    /// Apply the retention policy as of `now`
    ///
    /// Only automated, non-retained records are eligible. The age pass runs
    /// before the count pass. File removal failures are logged and the
    /// metadata row is deleted anyway.
    pub fn enforce_retention_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let config = self.config();
        let records = self.repository.list()?;
        let plan = retention::plan(RetentionPolicy::from(&config), &records, now);

        if plan.is_empty() {
            debug!("Retention found nothing to delete");
            return Ok(0);
        }

        let (by_age, by_count) = (plan.by_age.len(), plan.by_count.len());
        let mut deleted = 0;
        for snapshot in plan.into_deletions() {
            self.remove_snapshot(&snapshot)?;
            deleted += 1;
        }
        observability::record_retention_deleted(deleted);

        info!(
            deleted,
            by_age,
            by_count,
            retention_days = config.retention_days,
            max_snapshots = config.max_snapshots,
            "Enforced snapshot retention"
        );
        Ok(deleted)
    }

    /// Remove the file (best effort) and then the metadata row
    fn remove_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        match fs::remove_file(&snapshot.file_path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %snapshot.file_path.display(), "Snapshot file already gone");
            }
            Err(e) => {
                warn!(
                    snapshot_id = %snapshot.id,
                    path = %snapshot.file_path.display(),
                    error = %e,
                    "Failed to remove snapshot file; deleting record anyway"
                );
            }
        }
        self.repository.delete(&snapshot.id)
    }

    /// All snapshot records, newest first
    pub fn list(&self) -> Result<Vec<Snapshot>> {
        self.repository.list()
    }

    /// Fetch a snapshot record
    ///
    /// # Errors
    /// * `SnapshotError::UnknownSnapshot` - No record has this id
    pub fn get(&self, id: &str) -> Result<Snapshot> {
        self.repository
            .get(id)?
            .ok_or_else(|| SnapshotError::UnknownSnapshot(id.to_string()))
    }

    /// Explicit admin delete, regardless of kind or retained flag
    pub fn delete(&self, id: &str) -> Result<Snapshot> {
        let snapshot = self.get(id)?;
        self.remove_snapshot(&snapshot)?;
        info!(snapshot_id = %snapshot.id, "Deleted snapshot");
        Ok(snapshot)
    }

    /// Toggle the retention exemption flag
    pub fn set_retained(&self, id: &str, retained: bool, actor: &str) -> Result<Snapshot> {
        let snapshot = self
            .repository
            .set_retained(id, retained)?
            .ok_or_else(|| SnapshotError::UnknownSnapshot(id.to_string()))?;
        info!(snapshot_id = %snapshot.id, retained, actor, "Updated retained flag");
        Ok(snapshot)
    }

    /// Check the snapshot file still matches its recorded hash
    pub fn verify(&self, snapshot: &Snapshot) -> Result<()> {
        snapshot.verify_integrity()
    }

    /// Totals over the recorded (creation-time) sizes
    pub fn usage(&self) -> Result<DiskUsage> {
        let records = self.repository.list()?;
        Ok(DiskUsage {
            count: records.len(),
            total_bytes: records.iter().map(|s| s.size_bytes).sum(),
        })
    }
}
