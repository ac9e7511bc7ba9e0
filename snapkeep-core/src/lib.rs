/*!
# Snapkeep Core

Scheduled point-in-time snapshots of a single primary data file.

This crate provides:

- A synchronous snapshot engine (create, restore, retention, schedule checks)
- A background scheduler that takes one automated snapshot per UTC day
- Pluggable repository and settings stores, with JSON-file and in-memory implementations
- Structured logging setup and optional Prometheus counters

## Architecture

The engine depends only on two traits:
- [`SnapshotRepository`] stores snapshot metadata records
- [`SettingsProvider`] supplies the typed settings the configuration is read from

Configuration is re-read on every engine call, so a settings change takes
effect on the scheduler's next iteration without a restart.

## Usage

```rust,no_run
use std::sync::Arc;
use snapkeep_core::{Scheduler, SchedulerOptions, SnapshotEngine, SnapshotKind};
use snapkeep_core::repository::JsonFileRepository;
use snapkeep_core::settings::JsonFileSettings;

let engine = Arc::new(SnapshotEngine::new(
    JsonFileRepository::new("/srv/app/snapshot_index.json"),
    JsonFileSettings::new("/srv/app/settings.json"),
    "/srv/app/app.db",
    "/srv/app",
));

// Manual snapshot, exempt from retention
let snapshot = engine.create(SnapshotKind::manual(), Some("admin"), None, true)?;

// Automated daily snapshots in the background
let scheduler = Scheduler::new(Arc::clone(&engine), SchedulerOptions::default());
scheduler.start()?;

// Later: roll back
engine.restore(&snapshot)?;
scheduler.stop();
# Ok::<(), snapkeep_core::SnapshotError>(())
```
*/

pub mod config;
pub mod engine;
pub mod error;
mod fsio;
pub mod metadata;
pub mod observability;
pub mod repository;
pub mod retention;
pub mod schedule;
pub mod scheduler;
pub mod settings;


pub use config::SnapshotConfig;
pub use engine::{DiskUsage, NextRun, ScheduleStatus, SnapshotEngine};
pub use error::{ErrorKind, Result, SnapshotError};
pub use metadata::{Snapshot, SnapshotKind};
#[cfg(feature = "metrics")]
pub use observability::SnapkeepMetrics;
pub use observability::{init_default_observability, init_observability, LogFormat};
pub use repository::{JsonFileRepository, MemoryRepository, SnapshotRepository};
pub use scheduler::{Scheduler, SchedulerOptions};
pub use settings::{JsonFileSettings, MemorySettings, SettingValue, SettingsProvider};
pub use snapkeep_retry::RetryPolicy;
