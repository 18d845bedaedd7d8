//! Requests and responses exchanged with a remote peer.
//!
//! These are transport-agnostic payloads. A transport encodes them with the
//! codec selected by the session's [`ContentType`](crate::ContentType).

use crate::change::{ChangeRecord, Checkpoint};
use crate::ids::{DbId, SiteId};
use serde::{Deserialize, Serialize};

/// Named remote targets a session talks to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoints {
    /// Creates the remote database or migrates its schema.
    pub create_or_migrate: String,
    /// Fetches a batch of remote changes.
    pub get_changes: Option<String>,
    /// Applies a batch of local changes remotely.
    pub apply_changes: String,
    /// Streams remote changes to this replica.
    pub start_outbound_stream: String,
    /// Reads or records what one side has seen from the other.
    pub get_last_seen: Option<String>,
}

impl Endpoints {
    /// Creates the standard endpoint set under a base URL.
    pub fn new(base_url: impl AsRef<str>) -> Self {
        let base = base_url.as_ref().trim_end_matches('/');
        Self {
            create_or_migrate: format!("{base}/sync/create-or-migrate"),
            get_changes: Some(format!("{base}/sync/changes")),
            apply_changes: format!("{base}/sync/apply"),
            start_outbound_stream: format!("{base}/sync/stream"),
            get_last_seen: Some(format!("{base}/sync/last-seen")),
        }
    }

    /// Sets the get-changes endpoint.
    pub fn with_get_changes(mut self, url: Option<String>) -> Self {
        self.get_changes = url;
        self
    }

    /// Sets the last-seen endpoint.
    pub fn with_get_last_seen(mut self, url: Option<String>) -> Self {
        self.get_last_seen = url;
        self
    }
}

/// Opens (creating if needed) the remote copy of a database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateOrMigrateRequest {
    /// Database to open remotely.
    pub dbid: DbId,
    /// Site id of the requesting replica.
    pub site_id: SiteId,
}

/// Result of a create-or-migrate call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateOrMigrateResponse {
    /// Site id of the remote replica.
    pub site_id: SiteId,
}

/// Delivers a batch of changes to the remote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushRequest {
    /// Target database.
    pub dbid: DbId,
    /// Site that produced the stream the batch was read from.
    pub from_site: SiteId,
    /// Changes in stream order.
    pub changes: Vec<ChangeRecord>,
}

impl PushRequest {
    /// Creates a push request.
    pub fn new(dbid: DbId, from_site: SiteId, changes: Vec<ChangeRecord>) -> Self {
        Self {
            dbid,
            from_site,
            changes,
        }
    }
}

/// Acknowledges durable receipt of a pushed batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushResponse {
    /// What the remote has now durably applied from the pushing site.
    pub checkpoint: Checkpoint,
}

/// Fetches remote changes after a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullRequest {
    /// Source database.
    pub dbid: DbId,
    /// Site of the requesting replica. Its own records are never returned.
    pub requester: SiteId,
    /// Position to read after.
    pub since: Checkpoint,
    /// Maximum number of records to return.
    pub limit: u32,
}

impl PullRequest {
    /// Creates a pull request.
    pub fn new(dbid: DbId, requester: SiteId, since: Checkpoint, limit: u32) -> Self {
        Self {
            dbid,
            requester,
            since,
            limit,
        }
    }
}

/// A batch of remote changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullResponse {
    /// Site that produced the stream.
    pub site_id: SiteId,
    /// Changes in stream order.
    pub changes: Vec<ChangeRecord>,
    /// Position to resume from on the next pull.
    pub checkpoint: Checkpoint,
    /// Whether more changes are available.
    pub has_more: bool,
}

/// Reads, or records, the last position one site has seen from another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastSeenRequest {
    /// Database.
    pub dbid: DbId,
    /// Site whose position is being negotiated.
    pub site_id: SiteId,
    /// When present, the position to record.
    pub set: Option<Checkpoint>,
}

/// Position held by the remote after a last-seen request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastSeenResponse {
    /// The recorded position.
    pub checkpoint: Checkpoint,
}
