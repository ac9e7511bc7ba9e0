//! Retention policy planning.

use crate::config::SnapshotConfig;
use crate::Snapshot;
use chrono::{DateTime, Duration, Utc};

/// Age and count limits for prunable snapshots
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub retention_days: u32,
    pub max_snapshots: u32,
}

impl From<&SnapshotConfig> for RetentionPolicy {
    fn from(config: &SnapshotConfig) -> Self {
        Self {
            retention_days: config.retention_days,
            max_snapshots: config.max_snapshots,
        }
    }
}

/// Records selected for deletion, split by the pass that selected them
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RetentionPlan {
    pub by_age: Vec<Snapshot>,
    pub by_count: Vec<Snapshot>,
}

impl RetentionPlan {
    pub fn len(&self) -> usize {
        self.by_age.len() + self.by_count.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_age.is_empty() && self.by_count.is_empty()
    }

    /// Age-pass records first, then count-pass records oldest first
    pub fn into_deletions(self) -> impl Iterator<Item = Snapshot> {
        self.by_age.into_iter().chain(self.by_count)
    }
}

/// Decide which records retention removes at `now`.
///
/// Only automated, non-retained records are considered. The age pass takes
/// everything older than `retention_days`; the count pass then trims the
/// survivors, oldest first, down to `max_snapshots`.
pub fn plan(policy: RetentionPolicy, records: &[Snapshot], now: DateTime<Utc>) -> RetentionPlan {
    let cutoff = now - Duration::days(i64::from(policy.retention_days));

    let mut eligible: Vec<&Snapshot> = records.iter().filter(|s| s.is_prunable()).collect();
    // Newest first, so the tail holds the oldest survivors.
    eligible.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    let (expired, survivors): (Vec<&Snapshot>, Vec<&Snapshot>) =
        eligible.into_iter().partition(|s| s.created_at < cutoff);

    let limit = policy.max_snapshots as usize;
    let by_count = if survivors.len() > limit {
        survivors[limit..].iter().rev().map(|s| (*s).clone()).collect()
    } else {
        Vec::new()
    };

    RetentionPlan {
        by_age: expired.into_iter().cloned().collect(),
        by_count,
    }
}
