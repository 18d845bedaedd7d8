//! Error types for the sync server.

use crsync_engine::SyncError;
use crsync_protocol::{DbId, FailureKind, ProtocolError};
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the sync server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Invalid request contents.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The database has not been created on this server.
    #[error("unknown database: {0}")]
    UnknownDatabase(DbId),

    /// No endpoint is served at this path.
    #[error("no endpoint at {0}")]
    NotFound(String),

    /// Merging or reading changes failed.
    #[error(transparent)]
    Sync(#[from] SyncError),

    /// A body could not be decoded or a response encoded.
    #[error(transparent)]
    Codec(#[from] ProtocolError),
}

impl ServerError {
    /// Returns true if the request itself was at fault.
    pub fn is_client_error(&self) -> bool {
        match self {
            ServerError::InvalidRequest(_)
            | ServerError::UnknownDatabase(_)
            | ServerError::NotFound(_)
            | ServerError::Codec(_) => true,
            ServerError::Sync(e) => e.kind() == FailureKind::Protocol,
        }
    }

    /// Returns true if the server failed to handle a valid request.
    pub fn is_server_error(&self) -> bool {
        !self.is_client_error()
    }

    /// Returns the HTTP status code for this error.
    pub fn status(&self) -> u16 {
        match self {
            ServerError::InvalidRequest(_) | ServerError::Codec(_) => 400,
            ServerError::UnknownDatabase(_) | ServerError::NotFound(_) => 404,
            ServerError::Sync(e) if e.kind() == FailureKind::Protocol => 409,
            ServerError::Sync(_) => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crsync_protocol::{Checkpoint, SiteId};

    #[test]
    fn error_classification() {
        assert!(ServerError::InvalidRequest("bad".into()).is_client_error());
        assert!(ServerError::NotFound("/nope".into()).is_client_error());
        assert!(ServerError::Sync(SyncError::Apply("disk full".into())).is_server_error());

        let regression = SyncError::CheckpointRegression {
            site_id: SiteId::new(),
            current: Checkpoint::new(5, 0),
            attempted: Checkpoint::new(3, 0),
        };
        assert!(ServerError::from(regression).is_client_error());
    }

    #[test]
    fn status_codes() {
        assert_eq!(ServerError::InvalidRequest("bad".into()).status(), 400);
        assert_eq!(ServerError::NotFound("/nope".into()).status(), 404);
        assert_eq!(ServerError::UnknownDatabase(DbId::new()).status(), 404);
        let out_of_order = SyncError::OutOfOrder {
            site_id: SiteId::new(),
            previous: 3,
            next: 2,
        };
        assert_eq!(ServerError::from(out_of_order).status(), 409);
        assert_eq!(ServerError::Sync(SyncError::Apply("disk full".into())).status(), 500);
    }

    #[test]
    fn error_display() {
        let dbid = DbId::new();
        assert_eq!(
            ServerError::UnknownDatabase(dbid).to_string(),
            format!("unknown database: {dbid}")
        );
    }
}
