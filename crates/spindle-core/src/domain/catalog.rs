//! Status codes of the archive catalog rows the scheduler touches.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of an archived file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileStatus {
    Registered,
    CopyReady,
    CopyInProgress,
    Copied,
    TarReady,
    TarInProgress,
    BackupReady,
    BackupInProgress,
    BackupComplete,
    RestoreRegistered,
    RestoreInProgress,
    Restored,
    PurgeReady,
    Delete,
}

/// Status of a restore (pull/prep) queue row or an md5 row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RowStatus {
    Registered,
    InProgress,
    Complete,
    Failed,
    PrepInProgress,
    PrepFailed,
}

/// Status of a per-service backup record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackupRecordStatus {
    Registered,
    TransferReady,
    TransferInProgress,
    TransferComplete,
    TransferFailed,
}

/// Memory queue kinds that are seeded from and report back to the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueKind {
    Ingest,
    Copy,
    Tar,
    Purge,
    Delete,
    Put,
    Md5,
}

impl QueueKind {
    pub const ALL: [QueueKind; 7] = [
        QueueKind::Ingest,
        QueueKind::Copy,
        QueueKind::Tar,
        QueueKind::Purge,
        QueueKind::Delete,
        QueueKind::Put,
        QueueKind::Md5,
    ];

    pub fn name(self) -> &'static str {
        match self {
            QueueKind::Ingest => "ingest",
            QueueKind::Copy => "copy",
            QueueKind::Tar => "tar",
            QueueKind::Purge => "purge",
            QueueKind::Delete => "delete",
            QueueKind::Put => "put",
            QueueKind::Md5 => "md5",
        }
    }

    pub fn priority(self) -> u32 {
        match self {
            QueueKind::Ingest => 0,
            QueueKind::Copy => 2,
            QueueKind::Tar => 3,
            QueueKind::Purge | QueueKind::Delete => 4,
            QueueKind::Put | QueueKind::Md5 => 5,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
