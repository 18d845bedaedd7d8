//! Per-site checkpoints that only move forward.

use crate::database::ReplicatedDb;
use crate::error::SyncResult;
use crsync_protocol::{Checkpoint, SiteId};
use tracing::trace;

/// Reads and advances the positions a database has applied from each remote
/// site.
///
/// Positions are persisted through the database's last-seen table, so they
/// survive handle eviction and restarts.
pub struct CheckpointStore<'a> {
    db: &'a dyn ReplicatedDb,
}

impl<'a> CheckpointStore<'a> {
    /// Creates a store over `db`.
    pub fn new(db: &'a dyn ReplicatedDb) -> Self {
        Self { db }
    }

    /// Returns the position recorded for `site_id`, or [`Checkpoint::ZERO`].
    pub async fn get(&self, site_id: &SiteId) -> SyncResult<Checkpoint> {
        self.db.get_last_seen(site_id).await
    }

    /// Moves the position for `site_id` to `to`.
    ///
    /// Advancing to the current position is a no-op. Moving backward fails
    /// with [`SyncError::CheckpointRegression`] and leaves the position as it
    /// was. The check and the write happen in one database transaction, so
    /// concurrent advances never lower the position.
    ///
    /// [`SyncError::CheckpointRegression`]: crate::SyncError::CheckpointRegression
    pub async fn advance(&self, site_id: &SiteId, to: Checkpoint) -> SyncResult<Checkpoint> {
        let applied = self.db.apply_through(site_id, &[], to).await?;
        trace!(site = %site_id, to = %applied, "checkpoint advanced");
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{ChangeListener, Subscription};
    use crate::error::SyncError;
    use crate::memory::MemoryDatabase;
    use async_trait::async_trait;
    use crsync_protocol::ChangeRecord;

    /// Yields to other tasks before every call reaches the database.
    struct Yielding(MemoryDatabase);

    #[async_trait]
    impl ReplicatedDb for Yielding {
        fn site_id(&self) -> SiteId {
            self.0.site_id()
        }

        async fn pull_changeset(
            &self,
            since: Checkpoint,
            limit: usize,
        ) -> SyncResult<Vec<ChangeRecord>> {
            tokio::task::yield_now().await;
            self.0.pull_changeset(since, limit).await
        }

        async fn apply_changeset(&self, changes: &[ChangeRecord]) -> SyncResult<()> {
            tokio::task::yield_now().await;
            self.0.apply_changeset(changes).await
        }

        async fn apply_through(
            &self,
            from_site: &SiteId,
            changes: &[ChangeRecord],
            through: Checkpoint,
        ) -> SyncResult<Checkpoint> {
            tokio::task::yield_now().await;
            self.0.apply_through(from_site, changes, through).await
        }

        async fn get_last_seen(&self, site_id: &SiteId) -> SyncResult<Checkpoint> {
            tokio::task::yield_now().await;
            self.0.get_last_seen(site_id).await
        }

        async fn set_last_seen(&self, site_id: &SiteId, checkpoint: Checkpoint) -> SyncResult<()> {
            tokio::task::yield_now().await;
            self.0.set_last_seen(site_id, checkpoint).await
        }

        fn on_change(&self, listener: ChangeListener) -> Subscription {
            self.0.on_change(listener)
        }

        async fn close(&self) -> SyncResult<()> {
            self.0.close().await
        }
    }

    #[tokio::test]
    async fn starts_at_zero() {
        let db = MemoryDatabase::new();
        let store = CheckpointStore::new(&db);
        assert_eq!(store.get(&SiteId::new()).await.unwrap(), Checkpoint::ZERO);
    }

    #[tokio::test]
    async fn advances_forward_and_tolerates_repeats() {
        let db = MemoryDatabase::new();
        let store = CheckpointStore::new(&db);
        let site = SiteId::new();

        store.advance(&site, Checkpoint::new(3, 1)).await.unwrap();
        store.advance(&site, Checkpoint::new(3, 1)).await.unwrap();
        store.advance(&site, Checkpoint::new(4, 0)).await.unwrap();
        assert_eq!(store.get(&site).await.unwrap(), Checkpoint::new(4, 0));
    }

    #[tokio::test]
    async fn refuses_to_move_backward() {
        let db = MemoryDatabase::new();
        let store = CheckpointStore::new(&db);
        let site = SiteId::new();
        store.advance(&site, Checkpoint::new(5, 0)).await.unwrap();

        let result = store.advance(&site, Checkpoint::new(4, 9)).await;
        assert!(matches!(result, Err(SyncError::CheckpointRegression { .. })));
        assert_eq!(store.get(&site).await.unwrap(), Checkpoint::new(5, 0));
    }

    #[tokio::test]
    async fn sites_are_independent() {
        let db = MemoryDatabase::new();
        let store = CheckpointStore::new(&db);
        let a = SiteId::new();
        let b = SiteId::new();

        store.advance(&a, Checkpoint::new(9, 0)).await.unwrap();
        store.advance(&b, Checkpoint::new(1, 0)).await.unwrap();
        assert_eq!(store.get(&a).await.unwrap(), Checkpoint::new(9, 0));
        assert_eq!(store.get(&b).await.unwrap(), Checkpoint::new(1, 0));
    }

    #[tokio::test]
    async fn interleaved_advances_never_lower_the_position() {
        let db = Yielding(MemoryDatabase::new());
        let store = CheckpointStore::new(&db);
        let site = SiteId::new();

        let (ahead, behind) = tokio::join!(
            store.advance(&site, Checkpoint::new(9, 0)),
            store.advance(&site, Checkpoint::new(4, 0)),
        );
        assert_eq!(ahead.unwrap(), Checkpoint::new(9, 0));
        assert!(matches!(behind, Err(SyncError::CheckpointRegression { .. })));
        assert_eq!(store.get(&site).await.unwrap(), Checkpoint::new(9, 0));
    }
}
