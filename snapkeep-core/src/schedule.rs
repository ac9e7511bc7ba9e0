//! Daily schedule decisions.
//!
//! All functions are pure: they take the configuration, the current instant and
//! whether an automated snapshot already exists for that UTC day.

use crate::config::SnapshotConfig;
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};

/// The UTC instant `time` falls on `day`
pub fn scheduled_instant(day: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
    day.and_time(time).and_utc()
}

/// Whether the automated snapshot for `now`'s UTC day is due
pub fn should_run(config: &SnapshotConfig, now: DateTime<Utc>, already_ran_today: bool) -> bool {
    if !config.auto_enabled || already_ran_today {
        return false;
    }
    now >= scheduled_instant(now.date_naive(), config.daily_time)
}

/// The next instant an automated snapshot becomes due
///
/// Today's slot is returned even when it has already passed; callers treat a
/// past instant as due now.
pub fn next_run(config: &SnapshotConfig, now: DateTime<Utc>, already_ran_today: bool) -> DateTime<Utc> {
    let today = now.date_naive();
    let day = if already_ran_today {
        today + Duration::days(1)
    } else {
        today
    };
    scheduled_instant(day, config.daily_time)
}
