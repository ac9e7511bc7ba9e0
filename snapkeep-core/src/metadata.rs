/*!
Snapshot metadata records and kind tags.
*/

use crate::{Result, SnapshotError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Prefix shared by every kind created without operator action
pub const AUTOMATED_PREFIX: &str = "AUTOMATED";

/// Open-ended tag describing how a snapshot came to exist
///
/// Kept as a string rather than a closed enum so new automated variants
/// (`AUTOMATED_WEEKLY`, ...) can be stored and pruned without a schema change.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct SnapshotKind(String);

impl SnapshotKind {
    pub const MANUAL: &'static str = "MANUAL";
    pub const AUTOMATED_DAILY: &'static str = "AUTOMATED_DAILY";

    pub fn new<S: Into<String>>(kind: S) -> Self {
        Self(kind.into())
    }

    pub fn manual() -> Self {
        Self::new(Self::MANUAL)
    }

    pub fn automated_daily() -> Self {
        Self::new(Self::AUTOMATED_DAILY)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True for every kind the retention policy may prune
    pub fn is_automated(&self) -> bool {
        self.0.starts_with(AUTOMATED_PREFIX)
    }
}

impl fmt::Display for SnapshotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Metadata for one point-in-time copy of the primary data file
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Snapshot {
    /// Unique identifier assigned at creation
    pub id: String,

    /// UTC instant the copy was taken
    pub created_at: DateTime<Utc>,

    /// Acting user; `None` means the scheduler created it
    pub created_by: Option<String>,

    /// How the snapshot was created
    pub kind: SnapshotKind,

    /// Absolute path of the copied data file
    pub file_path: PathBuf,

    /// Optional human-readable description (manual snapshots only)
    pub description: Option<String>,

    /// Size of the copy at creation time; never recomputed
    pub size_bytes: u64,

    /// Exempt from automatic retention
    #[serde(default)]
    pub is_retained: bool,

    /// SHA-256 of the copy at creation time
    #[serde(default)]
    pub content_hash: String,
}

impl Snapshot {
    /// Create a record for a freshly copied file
    ///
    /// # Arguments
    /// * `kind` - Kind tag for the snapshot
    /// * `created_at` - Instant the copy was taken
    /// * `file_path` - Location of the copy
    /// * `size_bytes` - Measured size of the copy
    pub fn new<P: Into<PathBuf>>(
        kind: SnapshotKind,
        created_at: DateTime<Utc>,
        file_path: P,
        size_bytes: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            created_at,
            created_by: None,
            kind,
            file_path: file_path.into(),
            description: None,
            size_bytes,
            is_retained: false,
            content_hash: String::new(),
        }
    }

    /// Attribute the snapshot to a user
    pub fn with_actor<S: Into<String>>(mut self, actor: S) -> Self {
        self.created_by = Some(actor.into());
        self
    }

    /// Set optional description for the snapshot
    pub fn with_description<S: Into<String>>(mut self, description: S) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Set the retained flag
    pub fn with_retained(mut self, retained: bool) -> Self {
        self.is_retained = retained;
        self
    }

    /// Set the content hash recorded at creation
    pub fn with_content_hash<S: Into<String>>(mut self, hash: S) -> Self {
        self.content_hash = hash.into();
        self
    }

    /// True when automatic retention is allowed to delete this record
    pub fn is_prunable(&self) -> bool {
        self.kind.is_automated() && !self.is_retained
    }

    /// Generate the file name for a snapshot taken at `created_at`
    ///
    /// Format: snapshot_{YYYYmmdd_HHMMSS}_{kind}[.{extension}]
    ///
    /// Second granularity: two snapshots of the same kind within one second
    /// map to the same name.
    pub fn suggested_filename(
        created_at: DateTime<Utc>,
        kind: &SnapshotKind,
        extension: Option<&str>,
    ) -> String {
        let timestamp = created_at.format("%Y%m%d_%H%M%S");
        let kind = kind.as_str().to_ascii_lowercase();
        match extension {
            Some(ext) if !ext.is_empty() => format!("snapshot_{timestamp}_{kind}.{ext}"),
            _ => format!("snapshot_{timestamp}_{kind}"),
        }
    }

    /// Compute the SHA-256 of a file, streaming its content
    ///
    /// # Returns
    /// Hexadecimal string representation of the hash
    pub fn hash_file(path: &Path) -> Result<String> {
        let mut file = File::open(path).map_err(|e| SnapshotError::io("opening", path, e))?;
        let mut hasher = Sha256::new();
        io::copy(&mut file, &mut hasher).map_err(|e| SnapshotError::io("hashing", path, e))?;
        Ok(format!("{:x}", hasher.finalize()))
    }

    /// Verify the snapshot file still matches the hash recorded at creation
    ///
    /// Records written without a hash are accepted as long as the file exists.
    pub fn verify_integrity(&self) -> Result<()> {
        if !self.file_path.exists() {
            return Err(SnapshotError::not_found("snapshot file", &self.file_path));
        }
        if self.content_hash.is_empty() {
            return Ok(());
        }

        let actual = Self::hash_file(&self.file_path)?;
        if actual == self.content_hash {
            Ok(())
        } else {
            Err(SnapshotError::IntegrityCheckFailed {
                expected: self.content_hash.clone(),
                actual,
            })
        }
    }
}
