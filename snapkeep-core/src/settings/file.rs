/*!
JSON file settings adapter.
*/

use super::{SettingValue, SettingsProvider};
use crate::fsio::{self, FileLock};
use crate::{Result, SnapshotError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// One entry of the settings document
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StoredSetting {
    pub value: SettingValue,
    pub updated_by: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Settings persisted as a single JSON document
///
/// The document is re-read on every lookup so a long-running process picks
/// up changes written by another process (for example the admin CLI toggling
/// `auto_snapshot_enabled` while the scheduler runs).
///
/// # Example
/// ```rust,no_run
/// use snapkeep_core::settings::{JsonFileSettings, SettingValue, SettingsProvider};
///
/// let settings = JsonFileSettings::new("/var/lib/app/settings.json");
/// settings.set("max_snapshots", SettingValue::Int(14), Some("admin"))?;
/// assert_eq!(settings.get_int("max_snapshots", 10), 14);
/// # Ok::<(), snapkeep_core::SnapshotError>(())
/// ```
#[derive(Debug)]
pub struct JsonFileSettings {
    path: PathBuf,
}

impl JsonFileSettings {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every stored entry; a missing file is an empty store
    pub fn entries(&self) -> Result<BTreeMap<String, StoredSetting>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let raw = fs::read(&self.path).map_err(|e| SnapshotError::io("reading", &self.path, e))?;
        if raw.iter().all(u8::is_ascii_whitespace) {
            return Ok(BTreeMap::new());
        }
        Ok(serde_json::from_slice(&raw)?)
    }

    fn write_entries(&self, entries: &BTreeMap<String, StoredSetting>) -> Result<()> {
        let json = serde_json::to_vec_pretty(entries)?;
        fsio::write_atomic(&self.path, &json)
    }
}

impl SettingsProvider for JsonFileSettings {
    fn get(&self, key: &str) -> Option<SettingValue> {
        match self.entries() {
            Ok(mut entries) => entries.remove(key).map(|entry| entry.value),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to read settings; using defaults");
                None
            }
        }
    }

    fn set(&self, key: &str, value: SettingValue, actor: Option<&str>) -> Result<()> {
        let _lock = FileLock::exclusive(&self.path)?;

        let mut entries = self.entries()?;
        debug!(key, value = %value, actor = actor.unwrap_or("system"), "Updating setting");
        entries.insert(
            key.to_string(),
            StoredSetting {
                value,
                updated_by: actor.map(str::to_string),
                updated_at: Utc::now(),
            },
        );
        self.write_entries(&entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_reads_as_empty() {
        let dir = TempDir::new().unwrap();
        let settings = JsonFileSettings::new(dir.path().join("settings.json"));
        assert!(settings.get("auto_snapshot_enabled").is_none());
        assert!(settings.get_bool("auto_snapshot_enabled", true));
    }

    #[test]
    fn test_set_persists_with_attribution() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/settings.json");
        let settings = JsonFileSettings::new(&path);

        settings
            .set("daily_snapshot_time", SettingValue::Str("03:30".into()), Some("alice"))
            .unwrap();

        let reopened = JsonFileSettings::new(&path);
        assert_eq!(
            reopened.get_str("daily_snapshot_time").as_deref(),
            Some("03:30")
        );
        let entries = reopened.entries().unwrap();
        assert_eq!(
            entries["daily_snapshot_time"].updated_by.as_deref(),
            Some("alice")
        );
    }

    #[test]
    fn test_corrupt_file_falls_back_to_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, b"{not json").unwrap();

        let settings = JsonFileSettings::new(&path);
        assert_eq!(settings.get_int("max_snapshots", 10), 10);
        assert!(settings.set("max_snapshots", SettingValue::Int(3), None).is_err());
    }

    #[test]
    fn test_separate_instances_keep_every_key() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");

        let writers: Vec<_> = (0..2)
            .map(|writer| {
                let settings = JsonFileSettings::new(&path);
                std::thread::spawn(move || {
                    for n in 0..20 {
                        settings
                            .set(&format!("key_{writer}_{n}"), SettingValue::Int(n), None)
                            .unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        assert_eq!(JsonFileSettings::new(&path).entries().unwrap().len(), 40);
    }
}
