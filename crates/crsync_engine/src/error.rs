//! Error types for the sync engine.

use crsync_protocol::{Checkpoint, DbId, FailureKind, ProtocolError, SiteId};
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// A provider was invoked without being configured.
    #[error("no {0} provider configured")]
    NotConfigured(&'static str),

    /// Configuration values are unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Opening a database handle failed.
    #[error("failed to open database {dbid}: {message}")]
    Open {
        /// Database that failed to open.
        dbid: DbId,
        /// Error message.
        message: String,
    },

    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The remote refused a request as invalid. Resending it cannot succeed.
    #[error("remote rejected request: {0}")]
    Rejected(String),

    /// Applying a change batch failed; nothing from the batch was kept.
    #[error("apply failed: {0}")]
    Apply(String),

    /// A checkpoint was asked to move backward.
    #[error("checkpoint regression for site {site_id}: current {current}, attempted {attempted}")]
    CheckpointRegression {
        /// Remote site the checkpoint belongs to.
        site_id: SiteId,
        /// Recorded checkpoint.
        current: Checkpoint,
        /// Rejected checkpoint.
        attempted: Checkpoint,
    },

    /// Records from one site arrived with a decreasing version.
    #[error("out of order changes from site {site_id}: version {next} after {previous}")]
    OutOfOrder {
        /// Originating site.
        site_id: SiteId,
        /// Version seen first.
        previous: i64,
        /// Smaller version seen afterwards.
        next: i64,
    },

    /// A batch contained records that originated at the applying site.
    #[error("site {0} is trying to patch itself")]
    SelfApply(SiteId),

    /// A session is already running for this database.
    #[error("sync session already active for {0}")]
    SessionAlreadyActive(DbId),

    /// The previous session for this database has not finished stopping.
    #[error("sync session for {0} is still stopping")]
    SessionStopping(DbId),

    /// The database handle has been closed.
    #[error("database is closed")]
    DatabaseClosed,

    /// Codec error.
    #[error("codec error: {0}")]
    Codec(#[from] ProtocolError),

    /// Sync was cancelled.
    #[error("sync cancelled")]
    Cancelled,

    /// The sync worker is no longer running.
    #[error("sync worker is not running")]
    WorkerStopped,
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates an open error.
    pub fn open(dbid: DbId, message: impl Into<String>) -> Self {
        Self::Open {
            dbid,
            message: message.into(),
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Open { .. } => true,
            SyncError::Apply(_) => true,
            _ => false,
        }
    }

    /// Classifies this error for reporting across the worker boundary.
    pub fn kind(&self) -> FailureKind {
        match self {
            SyncError::NotConfigured(_) | SyncError::InvalidConfig(_) => FailureKind::Configuration,
            SyncError::Open { .. }
            | SyncError::Transport { .. }
            | SyncError::DatabaseClosed
            | SyncError::Codec(_)
            | SyncError::Cancelled
            | SyncError::WorkerStopped => FailureKind::Io,
            SyncError::Apply(_) => FailureKind::Apply,
            SyncError::CheckpointRegression { .. }
            | SyncError::OutOfOrder { .. }
            | SyncError::SelfApply(_)
            | SyncError::Rejected(_)
            | SyncError::SessionAlreadyActive(_)
            | SyncError::SessionStopping(_) => FailureKind::Protocol,
        }
    }
}
