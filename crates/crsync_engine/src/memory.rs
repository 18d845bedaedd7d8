//! In-memory replicated database.
//!
//! [`MemoryDatabase`] is a complete reference implementation of
//! [`ReplicatedDb`]. It keeps rows, a change log and last-seen positions in
//! memory and merges remote changes with last-writer-wins per row:
//! the higher version wins, and a tie goes to the larger site id.

use crate::database::{ChangeListener, DbHandle, HandleProvider, ReplicatedDb, Subscription};
use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use crsync_protocol::{ChangeKind, ChangeRecord, Checkpoint, DbId, SiteId};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

type RowKey = (String, Vec<u8>);

#[derive(Debug, Clone)]
struct Row {
    payload: Option<Vec<u8>>,
    version: i64,
    site_id: SiteId,
}

#[derive(Debug, Default)]
struct State {
    db_version: i64,
    rows: HashMap<RowKey, Row>,
    log: Vec<ChangeRecord>,
    last_seen: HashMap<SiteId, Checkpoint>,
}

#[derive(Default)]
struct Listeners {
    next_id: AtomicU64,
    registered: Mutex<HashMap<u64, ChangeListener>>,
}

impl Listeners {
    fn snapshot(&self) -> Vec<ChangeListener> {
        self.registered.lock().values().cloned().collect()
    }
}

/// An in-memory replicated database.
pub struct MemoryDatabase {
    site_id: SiteId,
    state: RwLock<State>,
    listeners: Arc<Listeners>,
    closed: AtomicBool,
    apply_fault: Mutex<Option<String>>,
}

impl MemoryDatabase {
    /// Creates an empty database with a random site id.
    pub fn new() -> Self {
        Self::with_site_id(SiteId::new())
    }

    /// Creates an empty database with the given site id.
    pub fn with_site_id(site_id: SiteId) -> Self {
        Self {
            site_id,
            state: RwLock::new(State::default()),
            listeners: Arc::new(Listeners::default()),
            closed: AtomicBool::new(false),
            apply_fault: Mutex::new(None),
        }
    }

    /// Inserts a row.
    pub fn insert(
        &self,
        table: impl Into<String>,
        row_key: Vec<u8>,
        payload: Vec<u8>,
    ) -> SyncResult<ChangeRecord> {
        self.write_local(ChangeKind::Insert, table.into(), row_key, Some(payload))
    }

    /// Updates a row.
    pub fn update(
        &self,
        table: impl Into<String>,
        row_key: Vec<u8>,
        payload: Vec<u8>,
    ) -> SyncResult<ChangeRecord> {
        self.write_local(ChangeKind::Update, table.into(), row_key, Some(payload))
    }

    /// Deletes a row.
    pub fn delete(&self, table: impl Into<String>, row_key: Vec<u8>) -> SyncResult<ChangeRecord> {
        self.write_local(ChangeKind::Delete, table.into(), row_key, None)
    }

    /// Returns the payload of a live row.
    pub fn get(&self, table: &str, row_key: &[u8]) -> Option<Vec<u8>> {
        let state = self.state.read();
        state
            .rows
            .get(&(table.to_string(), row_key.to_vec()))
            .and_then(|row| row.payload.clone())
    }

    /// Returns every live row, ordered by table and key.
    pub fn rows(&self) -> BTreeMap<(String, Vec<u8>), Vec<u8>> {
        let state = self.state.read();
        state
            .rows
            .iter()
            .filter_map(|(key, row)| row.payload.clone().map(|payload| (key.clone(), payload)))
            .collect()
    }

    /// Returns the number of records in the change log.
    pub fn change_count(&self) -> usize {
        self.state.read().log.len()
    }

    /// Returns the current database version.
    pub fn db_version(&self) -> i64 {
        self.state.read().db_version
    }

    /// Returns true once [`close`](ReplicatedDb::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Makes the next apply fail with [`SyncError::Apply`] before touching any row.
    pub fn fail_next_apply(&self, message: impl Into<String>) {
        *self.apply_fault.lock() = Some(message.into());
    }

    fn reopen(&self) {
        self.closed.store(false, Ordering::SeqCst);
    }

    fn ensure_open(&self) -> SyncResult<()> {
        if self.is_closed() {
            Err(SyncError::DatabaseClosed)
        } else {
            Ok(())
        }
    }

    fn write_local(
        &self,
        kind: ChangeKind,
        table: String,
        row_key: Vec<u8>,
        payload: Option<Vec<u8>>,
    ) -> SyncResult<ChangeRecord> {
        self.ensure_open()?;

        let record = {
            let mut state = self.state.write();
            state.db_version += 1;
            let version = state.db_version;
            let record = ChangeRecord {
                kind,
                table: table.clone(),
                row_key: row_key.clone(),
                payload: payload.clone(),
                version,
                site_id: self.site_id,
                db_version: version,
                seq: 0,
            };
            state.rows.insert(
                (table, row_key),
                Row {
                    payload,
                    version,
                    site_id: self.site_id,
                },
            );
            state.log.push(record.clone());
            record
        };

        trace!(version = record.version, table = %record.table, "local write");
        self.notify();
        Ok(record)
    }

    fn take_fault(&self) -> SyncResult<()> {
        match self.apply_fault.lock().take() {
            Some(message) => Err(SyncError::Apply(message)),
            None => Ok(()),
        }
    }

    fn validate(&self, changes: &[ChangeRecord]) -> SyncResult<()> {
        let mut latest: HashMap<SiteId, i64> = HashMap::new();
        for change in changes {
            if change.site_id == self.site_id {
                return Err(SyncError::SelfApply(self.site_id));
            }
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

    fn notify(&self) {
        for listener in self.listeners.snapshot() {
            listener();
        }
    }
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryDatabase")
            .field("site_id", &self.site_id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Returns true if `incoming` beats the current row.
fn wins(incoming: &ChangeRecord, current: Option<&Row>) -> bool {
    match current {
        None => true,
        Some(row) => {
            incoming.version > row.version
                || (incoming.version == row.version && incoming.site_id > row.site_id)
        }
    }
}

/// Merges `changes` into `state` and returns how many won.
///
/// Winners are logged under one new database version, in batch order.
fn merge(state: &mut State, changes: &[ChangeRecord]) -> usize {
    let db_version = state.db_version + 1;
    let mut seq = 0;
    let mut max_seen = state.db_version;

    for change in changes {
        let key = (change.table.clone(), change.row_key.clone());
        if !wins(change, state.rows.get(&key)) {
            continue;
        }
        state.rows.insert(
            key,
            Row {
                payload: change.payload.clone(),
                version: change.version,
                site_id: change.site_id,
            },
        );
        state.log.push(change.clone().at(db_version, seq));
        seq += 1;
        max_seen = max_seen.max(change.version);
    }

    if seq > 0 {
        state.db_version = max_seen.max(db_version);
    }
    seq as usize
}

#[async_trait]
impl ReplicatedDb for MemoryDatabase {
    fn site_id(&self) -> SiteId {
        self.site_id
    }

    async fn pull_changeset(
        &self,
        since: Checkpoint,
        limit: usize,
    ) -> SyncResult<Vec<ChangeRecord>> {
        self.ensure_open()?;
        let state = self.state.read();
        // The log is appended in position order.
        let start = state.log.partition_point(|record| record.position() <= since);
        Ok(state.log[start..].iter().take(limit).cloned().collect())
    }

    async fn apply_changeset(&self, changes: &[ChangeRecord]) -> SyncResult<()> {
        self.ensure_open()?;
        self.take_fault()?;
        self.validate(changes)?;

        let merged = merge(&mut self.state.write(), changes);
        debug!(received = changes.len(), merged, "applied changeset");
        if merged > 0 {
            self.notify();
        }
        Ok(())
    }

    async fn apply_through(
        &self,
        from_site: &SiteId,
        changes: &[ChangeRecord],
        through: Checkpoint,
    ) -> SyncResult<Checkpoint> {
        self.ensure_open()?;
        if !changes.is_empty() {
            self.take_fault()?;
            self.validate(changes)?;
        }

        let merged = {
            let mut state = self.state.write();
            let current = state.last_seen.get(from_site).copied().unwrap_or_default();
            if through < current {
                return Err(SyncError::CheckpointRegression {
                    site_id: *from_site,
                    current,
                    attempted: through,
                });
            }
            let merged = merge(&mut state, changes);
            state.last_seen.insert(*from_site, through);
            merged
        };

        debug!(
            site = %from_site,
            received = changes.len(),
            merged,
            through = %through,
            "applied changeset"
        );
        if merged > 0 {
            self.notify();
        }
        Ok(through)
    }

    async fn get_last_seen(&self, site_id: &SiteId) -> SyncResult<Checkpoint> {
        self.ensure_open()?;
        Ok(self
            .state
            .read()
            .last_seen
            .get(site_id)
            .copied()
            .unwrap_or_default())
    }

    async fn set_last_seen(&self, site_id: &SiteId, checkpoint: Checkpoint) -> SyncResult<()> {
        self.ensure_open()?;
        self.state.write().last_seen.insert(*site_id, checkpoint);
        Ok(())
    }

    fn on_change(&self, listener: ChangeListener) -> Subscription {
        let id = self.listeners.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.registered.lock().insert(id, listener);

        let listeners = Arc::downgrade(&self.listeners);
        Subscription::new(move || {
            if let Some(listeners) = listeners.upgrade() {
                listeners.registered.lock().remove(&id);
            }
        })
    }

    async fn close(&self) -> SyncResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.listeners.registered.lock().clear();
        Ok(())
    }
}

/// Handle provider backed by [`MemoryDatabase`]s.
///
/// Databases outlive their handles: closing and reopening a `DbId` yields
/// the same data. Opens and closes are counted so tests can assert on
/// handle lifetimes.
#[derive(Default)]
pub struct MemoryHandleProvider {
    databases: Mutex<HashMap<DbId, Arc<MemoryDatabase>>>,
    failing: Mutex<HashSet<DbId>>,
    open_delay: Mutex<Option<Duration>>,
    opens: AtomicUsize,
    closes: AtomicUsize,
}

impl MemoryHandleProvider {
    /// Creates an empty provider.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the database for `dbid`, creating it if needed.
    ///
    /// This does not count as an open.
    pub fn database(&self, dbid: &DbId) -> Arc<MemoryDatabase> {
        Arc::clone(
            self.databases
                .lock()
                .entry(*dbid)
                .or_insert_with(|| Arc::new(MemoryDatabase::new())),
        )
    }

    /// Makes every open of `dbid` fail.
    pub fn fail_opens(&self, dbid: DbId) {
        self.failing.lock().insert(dbid);
    }

    /// Delays every open by `delay`.
    pub fn set_open_delay(&self, delay: Option<Duration>) {
        *self.open_delay.lock() = delay;
    }

    /// Returns how many handles have been opened.
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Returns how many handles have been closed.
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for MemoryHandleProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryHandleProvider")
            .field("opens", &self.open_count())
            .field("closes", &self.close_count())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl HandleProvider for MemoryHandleProvider {
    async fn open(&self, dbid: &DbId) -> SyncResult<DbHandle> {
        let delay = *self.open_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.lock().contains(dbid) {
            return Err(SyncError::open(*dbid, "open refused"));
        }

        let database = self.database(dbid);
        database.reopen();
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(database as DbHandle)
    }

    async fn close(&self, _dbid: &DbId, handle: DbHandle) -> SyncResult<()> {
        handle.close().await?;
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
