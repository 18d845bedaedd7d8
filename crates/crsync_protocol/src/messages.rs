//! Messages crossing the sync engine boundary.
//!
//! The engine runs in its own execution context. The only way in is a
//! [`ToWorker`] message and the only way out is a [`FromWorker`] message; no
//! mutable state is shared across the boundary.

use crate::change::{ChangeRecord, Scope};
use crate::codec::ContentType;
use crate::ids::DbId;
use crate::wire::Endpoints;
use serde::{Deserialize, Serialize};

/// Commands sent to the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "_tag")]
pub enum ToWorker {
    /// The local database committed a write.
    ///
    /// Delivery is at-least-once; duplicates are harmless.
    LocalDbChanged {
        /// Database that changed.
        dbid: DbId,
    },
    /// Start synchronizing a database.
    StartSync {
        /// Database to sync.
        dbid: DbId,
        /// Remote endpoints.
        endpoints: Endpoints,
        /// Replication breadth for the outbound stream.
        scope: Scope,
        /// Encoding the transport should use.
        content_type: ContentType,
    },
    /// Stop synchronizing a database.
    StopSync {
        /// Database to stop.
        dbid: DbId,
    },
}

impl ToWorker {
    /// Returns the database this command targets.
    pub fn dbid(&self) -> &DbId {
        match self {
            ToWorker::LocalDbChanged { dbid }
            | ToWorker::StartSync { dbid, .. }
            | ToWorker::StopSync { dbid } => dbid,
        }
    }
}

/// Which way a reported batch travelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Local changes pushed to the remote.
    Pushed,
    /// Remote changes pulled and applied locally.
    Pulled,
}

/// Failure classes reported across the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// A provider is not configured.
    Configuration,
    /// Handle open or transport I/O failed.
    Io,
    /// A change batch failed to apply and was rolled back.
    Apply,
    /// The request violated the protocol (checkpoint regression, duplicate session).
    Protocol,
}

/// Reports emitted by the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "_tag")]
pub enum FromWorker {
    /// A batch of changes was synced with the remote.
    SyncedRemote {
        /// Database that synced.
        dbid: DbId,
        /// Whether the batch was pushed or pulled.
        direction: Direction,
        /// The records in the batch.
        collected_changes: Vec<ChangeRecord>,
    },
    /// A background sync step failed. The session keeps running.
    SyncFailed {
        /// Database the failure belongs to.
        dbid: DbId,
        /// Failure class.
        kind: FailureKind,
        /// Human readable description.
        message: String,
    },
}

impl FromWorker {
    /// Returns the database this report concerns.
    pub fn dbid(&self) -> &DbId {
        match self {
            FromWorker::SyncedRemote { dbid, .. } | FromWorker::SyncFailed { dbid, .. } => dbid,
        }
    }
}
