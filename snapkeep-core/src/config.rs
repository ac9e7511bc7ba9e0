//! Typed snapshot configuration
//!
//! The settings store is stringly keyed and loosely typed. This module reads
//! the recognised keys once, applies defaults, range checks and the schedule
//! time fallback in a single place, and hands the rest of the crate a
//! validated [`SnapshotConfig`].

use crate::settings::{SettingValue, SettingsProvider};
use crate::{Result, SnapshotError};
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use tracing::warn;

pub const KEY_AUTO_ENABLED: &str = "auto_snapshot_enabled";
pub const KEY_DAILY_TIME: &str = "daily_snapshot_time";
pub const KEY_RETENTION_DAYS: &str = "snapshot_retention_days";
pub const KEY_MAX_SNAPSHOTS: &str = "max_snapshots";
pub const KEY_SNAPSHOT_DIR: &str = "snapshot_dir";

/// Every key this crate reads from the settings store
pub const KNOWN_KEYS: [&str; 5] = [
    KEY_AUTO_ENABLED,
    KEY_DAILY_TIME,
    KEY_RETENTION_DAYS,
    KEY_MAX_SNAPSHOTS,
    KEY_SNAPSHOT_DIR,
];

pub const DEFAULT_DAILY_TIME: &str = "02:00";
pub const DEFAULT_RETENTION_DAYS: u32 = 30;
pub const DEFAULT_MAX_SNAPSHOTS: u32 = 10;
pub const RETENTION_DAYS_RANGE: RangeInclusive<u32> = 1..=3650;
pub const MAX_SNAPSHOTS_RANGE: RangeInclusive<u32> = 1..=500;

/// Directory used when `snapshot_dir` is not set, relative to the app root
pub const DEFAULT_SNAPSHOT_DIR: &str = "snapshots";

/// Validated snapshot configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Whether the scheduler creates daily snapshots
    pub auto_enabled: bool,
    /// UTC time of day the daily snapshot becomes due
    pub daily_time: NaiveTime,
    /// Automated snapshots older than this many days are pruned
    pub retention_days: u32,
    /// Upper bound on prunable automated snapshots kept
    pub max_snapshots: u32,
    /// Configured snapshot directory, absolute or relative to the app root
    pub snapshot_dir: Option<PathBuf>,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        SnapshotConfig {
            auto_enabled: true,
            daily_time: default_daily_time(),
            retention_days: DEFAULT_RETENTION_DAYS,
            max_snapshots: DEFAULT_MAX_SNAPSHOTS,
            snapshot_dir: None,
        }
    }
}

fn default_daily_time() -> NaiveTime {
    NaiveTime::from_hms_opt(2, 0, 0).unwrap_or(NaiveTime::MIN)
}

/// Parse a 24-hour `HH:MM` string
pub fn parse_daily_time(raw: &str) -> Result<NaiveTime> {
    let raw = raw.trim();
    let (hours, minutes) = raw
        .split_once(':')
        .ok_or_else(|| SnapshotError::config(format!("'{raw}' is not in HH:MM form")))?;

    let hours: u32 = hours
        .parse()
        .map_err(|_| SnapshotError::config(format!("invalid hour in '{raw}'")))?;
    let minutes: u32 = minutes
        .parse()
        .map_err(|_| SnapshotError::config(format!("invalid minute in '{raw}'")))?;

    NaiveTime::from_hms_opt(hours, minutes, 0)
        .ok_or_else(|| SnapshotError::config(format!("'{raw}' is not a valid time of day")))
}

fn clamp_setting(key: &str, raw: i64, default: u32, range: &RangeInclusive<u32>) -> u32 {
    let start = i64::from(*range.start());
    let end = i64::from(*range.end());
    if (start..=end).contains(&raw) {
        return raw as u32;
    }

    let clamped = raw.clamp(start, end) as u32;
    warn!(
        key,
        value = raw,
        clamped,
        default,
        "Setting outside allowed range; clamping"
    );
    clamped
}

impl SnapshotConfig {
    /// Build the configuration from the settings store
    ///
    /// Never fails: missing keys take their defaults, a malformed daily time
    /// falls back to `02:00` and out-of-range numbers are clamped.
    pub fn from_settings<P: SettingsProvider + ?Sized>(settings: &P) -> Self {
        let defaults = SnapshotConfig::default();

        let daily_time = match settings.get_str(KEY_DAILY_TIME) {
            Some(raw) => parse_daily_time(&raw).unwrap_or_else(|e| {
                warn!(key = KEY_DAILY_TIME, value = %raw, error = %e, "Falling back to default snapshot time");
                defaults.daily_time
            }),
            None => defaults.daily_time,
        };

        let retention_days = clamp_setting(
            KEY_RETENTION_DAYS,
            settings.get_int(KEY_RETENTION_DAYS, i64::from(DEFAULT_RETENTION_DAYS)),
            DEFAULT_RETENTION_DAYS,
            &RETENTION_DAYS_RANGE,
        );

        let max_snapshots = clamp_setting(
            KEY_MAX_SNAPSHOTS,
            settings.get_int(KEY_MAX_SNAPSHOTS, i64::from(DEFAULT_MAX_SNAPSHOTS)),
            DEFAULT_MAX_SNAPSHOTS,
            &MAX_SNAPSHOTS_RANGE,
        );

        let snapshot_dir = settings
            .get_str(KEY_SNAPSHOT_DIR)
            .filter(|dir| !dir.trim().is_empty())
            .map(PathBuf::from);

        SnapshotConfig {
            auto_enabled: settings.get_bool(KEY_AUTO_ENABLED, defaults.auto_enabled),
            daily_time,
            retention_days,
            max_snapshots,
            snapshot_dir,
        }
    }

    /// Resolve the directory snapshots are written to
    pub fn resolve_snapshot_dir(&self, app_root: &Path) -> PathBuf {
        match &self.snapshot_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => app_root.join(dir),
            None => app_root.join(DEFAULT_SNAPSHOT_DIR),
        }
    }

    /// Convert and validate a raw admin-supplied value for a known key
    ///
    /// Unlike [`SnapshotConfig::from_settings`], this rejects bad input so the
    /// admin surface can report it instead of silently storing it.
    pub fn validate_key(key: &str, raw: &str) -> Result<SettingValue> {
        use crate::settings::SettingType;

        let invalid = |expected: &str| {
            SnapshotError::config(format!("invalid value '{raw}' for {key}: expected {expected}"))
        };

        match key {
            KEY_AUTO_ENABLED => {
                SettingValue::parse(raw, SettingType::Bool).ok_or_else(|| invalid("true or false"))
            }
            KEY_DAILY_TIME => {
                let time = parse_daily_time(raw)?;
                Ok(SettingValue::Str(time.format("%H:%M").to_string()))
            }
            KEY_RETENTION_DAYS | KEY_MAX_SNAPSHOTS => {
                let range = if key == KEY_RETENTION_DAYS {
                    RETENTION_DAYS_RANGE
                } else {
                    MAX_SNAPSHOTS_RANGE
                };
                let expected = format!("an integer in {}..={}", range.start(), range.end());
                match SettingValue::parse(raw, SettingType::Int) {
                    Some(SettingValue::Int(v))
                        if v >= i64::from(*range.start()) && v <= i64::from(*range.end()) =>
                    {
                        Ok(SettingValue::Int(v))
                    }
                    _ => Err(invalid(&expected)),
                }
            }
            KEY_SNAPSHOT_DIR => Ok(SettingValue::Str(raw.trim().to_string())),
            _ => Err(SnapshotError::config(format!("unknown setting '{key}'"))),
        }
    }
}
