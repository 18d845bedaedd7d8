//! The replicated database contract.
//!
//! The engine never talks to storage directly. It reads and writes change
//! logs through [`ReplicatedDb`] and obtains handles through a
//! [`HandleProvider`].

use crate::error::SyncResult;
use async_trait::async_trait;
use crsync_protocol::{ChangeRecord, Checkpoint, DbId, SiteId};
use std::sync::Arc;

/// Callback invoked after a local write or a successful apply.
pub type ChangeListener = Arc<dyn Fn() + Send + Sync>;

/// Shared handle to an open database.
pub type DbHandle = Arc<dyn ReplicatedDb>;

/// A database that exposes its change log.
#[async_trait]
pub trait ReplicatedDb: Send + Sync {
    /// Returns the site id of this replica.
    fn site_id(&self) -> SiteId;

    /// Returns up to `limit` changes positioned after `since`, in stream order.
    async fn pull_changeset(&self, since: Checkpoint, limit: usize)
        -> SyncResult<Vec<ChangeRecord>>;

    /// Merges a batch of remote changes in one transaction.
    ///
    /// Either every record is merged or none is.
    async fn apply_changeset(&self, changes: &[ChangeRecord]) -> SyncResult<()>;

    /// Merges `changes` received from `from_site` and moves the last-seen
    /// position for `from_site` to `through`, in one transaction.
    ///
    /// Fails with
    /// [`SyncError::CheckpointRegression`](crate::SyncError::CheckpointRegression)
    /// before touching anything if `through` is behind the recorded
    /// position. With an empty batch only the position moves. Concurrent
    /// calls must never leave the position lower than either of them set it.
    async fn apply_through(
        &self,
        from_site: &SiteId,
        changes: &[ChangeRecord],
        through: Checkpoint,
    ) -> SyncResult<Checkpoint>;

    /// Returns the last position recorded for `site_id`.
    async fn get_last_seen(&self, site_id: &SiteId) -> SyncResult<Checkpoint>;

    /// Records the last position seen from `site_id`.
    async fn set_last_seen(&self, site_id: &SiteId, checkpoint: Checkpoint) -> SyncResult<()>;

    /// Registers a change listener. Dropping the subscription unregisters it.
    fn on_change(&self, listener: ChangeListener) -> Subscription;

    /// Closes the database. Later calls fail with
    /// [`SyncError::DatabaseClosed`](crate::SyncError::DatabaseClosed).
    async fn close(&self) -> SyncResult<()>;
}

/// Opens and closes database handles.
#[async_trait]
pub trait HandleProvider: Send + Sync {
    /// Opens the database identified by `dbid`.
    async fn open(&self, dbid: &DbId) -> SyncResult<DbHandle>;

    /// Closes a handle previously returned by [`open`](Self::open).
    async fn close(&self, dbid: &DbId, handle: DbHandle) -> SyncResult<()>;
}

/// Registration returned by [`ReplicatedDb::on_change`].
///
/// The listener stays registered until the subscription is dropped or
/// [`unsubscribe`](Self::unsubscribe) is called.
#[must_use = "dropping a subscription unregisters the listener"]
pub struct Subscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Creates a subscription that runs `unsubscribe` when released.
    pub fn new(unsubscribe: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    /// Creates a subscription with nothing to release.
    pub fn detached() -> Self {
        Self { unsubscribe: None }
    }

    /// Unregisters the listener now.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.unsubscribe.is_some())
            .finish()
    }
}
