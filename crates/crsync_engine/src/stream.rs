//! Outbound change collection and inbound apply.

use crate::database::ReplicatedDb;
use crate::error::{SyncError, SyncResult};
use crsync_protocol::{ChangeRecord, Checkpoint, Scope, SiteId};
use std::collections::HashMap;
use tracing::debug;

/// A batch of outbound changes.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectedBatch {
    /// Changes in stream order, already filtered by scope.
    pub changes: Vec<ChangeRecord>,
    /// Stream position covered by this batch, including records the scope
    /// filtered out. Collecting again from here never repeats a record.
    pub through: Checkpoint,
}

impl CollectedBatch {
    /// Returns true if the batch carries no changes.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// Reads change batches from a database and applies remote ones to it.
#[derive(Debug, Clone, Copy)]
pub struct ChangeStream {
    batch_size: usize,
}

impl ChangeStream {
    /// Creates a stream that moves at most `batch_size` changes at a time.
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
        }
    }

    /// Returns the batch size.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Collects changes positioned after `since` that `scope` admits.
    ///
    /// Returns at most one batch. Records come out in stream order, so for a
    /// given site their versions never decrease. An empty batch means the
    /// stream is drained up to `through`.
    pub async fn collect_since(
        &self,
        db: &dyn ReplicatedDb,
        since: Checkpoint,
        scope: Scope,
    ) -> SyncResult<CollectedBatch> {
        let local = db.site_id();
        let mut through = since;
        let mut changes = Vec::new();

        loop {
            let page = db.pull_changeset(through, self.batch_size).await?;
            let exhausted = page.len() < self.batch_size;

            for record in page {
                through = record.position();
                if scope.includes(&record.site_id, &local) {
                    changes.push(record);
                    if changes.len() == self.batch_size {
                        return Ok(CollectedBatch { changes, through });
                    }
                }
            }

            if exhausted {
                return Ok(CollectedBatch { changes, through });
            }
        }
    }

    /// Applies a batch received from `from_site` and records `through` as
    /// the position now seen from it.
    ///
    /// The batch is checked before anything is written. A batch whose
    /// `through` is behind the recorded position is rejected with
    /// [`SyncError::CheckpointRegression`]; one at the recorded position is
    /// applied again, which is a no-op for a convergent database. The rows
    /// and the checkpoint are written in one transaction, so a failed apply
    /// leaves the checkpoint untouched.
    pub async fn apply(
        &self,
        db: &dyn ReplicatedDb,
        from_site: &SiteId,
        changes: &[ChangeRecord],
        through: Checkpoint,
    ) -> SyncResult<Checkpoint> {
        check_order(changes)?;
        let applied = db.apply_through(from_site, changes, through).await?;
        debug!(site = %from_site, count = changes.len(), through = %applied, "applied batch");
        Ok(applied)
    }
}

/// Checks that each site's versions never decrease within the batch.
fn check_order(changes: &[ChangeRecord]) -> SyncResult<()> {
    let mut latest: HashMap<SiteId, i64> = HashMap::new();
    for change in changes {
        if let Some(previous) = latest.insert(change.site_id, change.version) {
            if change.version < previous {
                return Err(SyncError::OutOfOrder {
                    site_id: change.site_id,
                    previous,
                    next: change.version,
                });
            }
        }
    }
    Ok(())
}
