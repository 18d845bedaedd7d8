//! Request handlers for sync endpoints.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crsync_engine::{ChangeStream, MemoryDatabase, ReplicatedDb, SyncError};
use crsync_protocol::{
    Checkpoint, CreateOrMigrateRequest, CreateOrMigrateResponse, DbId, LastSeenRequest,
    LastSeenResponse, PullRequest, PullResponse, PushRequest, PushResponse, SiteId,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// State shared by every request.
pub struct HandlerContext {
    /// Server configuration.
    pub config: ServerConfig,
    databases: RwLock<HashMap<DbId, Arc<MemoryDatabase>>>,
    /// How far each client has applied the server's stream, per database.
    pulled: RwLock<HashMap<(DbId, SiteId), Checkpoint>>,
}

impl HandlerContext {
    /// Creates a new handler context.
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            databases: RwLock::new(HashMap::new()),
            pulled: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the server's replica of `dbid`, if it has been created.
    pub fn database(&self, dbid: &DbId) -> Option<Arc<MemoryDatabase>> {
        self.databases.read().get(dbid).cloned()
    }

    /// Returns how many databases the server holds.
    pub fn database_count(&self) -> usize {
        self.databases.read().len()
    }

    fn existing(&self, dbid: &DbId) -> ServerResult<Arc<MemoryDatabase>> {
        self.database(dbid)
            .ok_or(ServerError::UnknownDatabase(*dbid))
    }

    fn get_or_create(&self, dbid: &DbId) -> Arc<MemoryDatabase> {
        if let Some(db) = self.database(dbid) {
            return db;
        }
        let mut databases = self.databases.write();
        Arc::clone(databases.entry(*dbid).or_insert_with(|| {
            info!(%dbid, "creating database");
            Arc::new(MemoryDatabase::new())
        }))
    }

    fn record_pulled(&self, dbid: DbId, site_id: SiteId, checkpoint: Checkpoint) -> Checkpoint {
        let mut pulled = self.pulled.write();
        let entry = pulled.entry((dbid, site_id)).or_default();
        *entry = (*entry).max(checkpoint);
        *entry
    }

    fn pulled_through(&self, dbid: &DbId, site_id: &SiteId) -> Checkpoint {
        self.pulled
            .read()
            .get(&(*dbid, *site_id))
            .copied()
            .unwrap_or_default()
    }
}

/// Handler for sync requests.
pub struct RequestHandler {
    context: Arc<HandlerContext>,
}

impl RequestHandler {
    /// Creates a new request handler.
    pub fn new(context: Arc<HandlerContext>) -> Self {
        Self { context }
    }

    /// Opens the database, creating it on first use, and returns the
    /// server's site id for it.
    pub fn handle_create_or_migrate(
        &self,
        request: CreateOrMigrateRequest,
    ) -> ServerResult<CreateOrMigrateResponse> {
        let db = self.context.get_or_create(&request.dbid);
        let site_id = db.site_id();
        if site_id == request.site_id {
            return Err(ServerError::InvalidRequest(format!(
                "client shares the server's site id {site_id}"
            )));
        }
        debug!(dbid = %request.dbid, client = %request.site_id, "client attached");
        Ok(CreateOrMigrateResponse { site_id })
    }

    /// Merges a pushed batch and records how far the pushing site's stream
    /// has been applied.
    ///
    /// A batch at or behind the recorded position is a resend. It is merged
    /// again, which changes nothing, and acknowledged at the recorded
    /// position so the client can skip ahead.
    pub async fn handle_push(&self, request: PushRequest) -> ServerResult<PushResponse> {
        let max = self.context.config.max_push_batch as usize;
        if request.changes.len() > max {
            return Err(ServerError::InvalidRequest(format!(
                "too many changes: {} > {}",
                request.changes.len(),
                max
            )));
        }

        let db = self.context.existing(&request.dbid)?;
        let stream = ChangeStream::new(max.max(1));
        let pushed = request.changes.last().map(|last| last.position());
        let checkpoint = loop {
            let current = db.get_last_seen(&request.from_site).await?;
            let through = pushed.map_or(current, |pushed| pushed.max(current));
            match stream
                .apply(db.as_ref(), &request.from_site, &request.changes, through)
                .await
            {
                // Another push for this site moved the position in between.
                Err(SyncError::CheckpointRegression { .. }) => continue,
                result => break result?,
            }
        };

        if pushed.is_some_and(|pushed| pushed < checkpoint) {
            debug!(
                dbid = %request.dbid,
                from = %request.from_site,
                through = %checkpoint,
                "resent batch acknowledged"
            );
        }
        debug!(
            dbid = %request.dbid,
            from = %request.from_site,
            count = request.changes.len(),
            through = %checkpoint,
            "push applied"
        );
        Ok(PushResponse { checkpoint })
    }

    /// Returns the next batch of the server's stream, leaving out the
    /// requester's own records.
    pub async fn handle_pull(&self, request: PullRequest) -> ServerResult<PullResponse> {
        let db = self.context.existing(&request.dbid)?;
        let limit = request.limit.min(self.context.config.max_pull_batch) as usize;

        let scanned = if limit == 0 {
            Vec::new()
        } else {
            db.pull_changeset(request.since, limit).await?
        };
        let has_more = limit > 0 && scanned.len() == limit;
        let checkpoint = scanned
            .last()
            .map(|record| record.position())
            .unwrap_or(request.since);
        let changes: Vec<_> = scanned
            .into_iter()
            .filter(|record| record.site_id != request.requester)
            .collect();

        debug!(
            dbid = %request.dbid,
            requester = %request.requester,
            count = changes.len(),
            through = %checkpoint,
            has_more,
            "pull served"
        );
        Ok(PullResponse {
            site_id: db.site_id(),
            changes,
            checkpoint,
            has_more,
        })
    }

    /// Reads how far the server has applied a site's pushes, or records how
    /// far that site has applied the server's stream.
    pub async fn handle_last_seen(&self, request: LastSeenRequest) -> ServerResult<LastSeenResponse> {
        let db = self.context.existing(&request.dbid)?;
        let checkpoint = match request.set {
            Some(checkpoint) => {
                self.context
                    .record_pulled(request.dbid, request.site_id, checkpoint)
            }
            None => db.get_last_seen(&request.site_id).await?,
        };
        Ok(LastSeenResponse { checkpoint })
    }

    /// Returns how far `site_id` has reported applying the server's stream.
    pub fn pulled_through(&self, dbid: &DbId, site_id: &SiteId) -> Checkpoint {
        self.context.pulled_through(dbid, site_id)
    }
}
