//! Connection cache with sliding idle eviction.
//!
//! The cache holds at most one live handle per [`DbId`]. Concurrent `get`
//! calls for an id that is still opening wait for the first open instead of
//! starting another one.
//!
//! Every `get` marks the entry as used. Each entry has a timer that ticks
//! once per TTL. A tick that finds the entry used clears the mark; a tick that
//! finds it already clear removes the entry and closes its handle. An entry
//! therefore survives at least one full TTL after its last access and is gone
//! within two.

use crate::database::{DbHandle, HandleProvider};
use crate::error::{SyncError, SyncResult};
use crsync_protocol::DbId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

const EVICTION_CHANNEL_CAPACITY: usize = 64;

/// Caches open database handles by id.
///
/// Cloning a cache yields another reference to the same entries.
#[derive(Clone)]
pub struct ConnectionCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    ttl: Duration,
    provider: Arc<dyn HandleProvider>,
    slots: Mutex<HashMap<DbId, Slot>>,
    generations: AtomicU64,
    evictions: broadcast::Sender<DbId>,
}

enum Slot {
    /// An open is in progress. The receiver carries the failure message if
    /// it fails, and closes when the opener is done.
    Opening(watch::Receiver<Option<String>>),
    Live(Entry),
}

struct Entry {
    handle: DbHandle,
    last_access: Instant,
    idle: bool,
    generation: u64,
    timer: JoinHandle<()>,
}

enum Lookup {
    Hit(DbHandle),
    Wait(watch::Receiver<Option<String>>),
    Open(watch::Sender<Option<String>>),
}

enum Expiry {
    Idle,
    Evicted(DbHandle),
    Stale,
}

impl ConnectionCache {
    /// Creates a cache that opens handles through `provider`.
    pub fn new(ttl: Duration, provider: Arc<dyn HandleProvider>) -> SyncResult<Self> {
        if ttl.is_zero() {
            return Err(SyncError::InvalidConfig(
                "cache ttl must be greater than zero".into(),
            ));
        }
        let (evictions, _) = broadcast::channel(EVICTION_CHANNEL_CAPACITY);
        Ok(Self {
            inner: Arc::new(CacheInner {
                ttl,
                provider,
                slots: Mutex::new(HashMap::new()),
                generations: AtomicU64::new(0),
                evictions,
            }),
        })
    }

    /// Returns the handle for `dbid`, opening it if needed.
    ///
    /// Each call marks the entry as used. If an open is already in flight,
    /// this waits for it and shares its outcome. A failed open leaves no entry
    /// behind.
    pub async fn get(&self, dbid: &DbId) -> SyncResult<DbHandle> {
        loop {
            match self.inner.lookup(dbid) {
                Lookup::Hit(handle) => return Ok(handle),
                Lookup::Wait(mut opened) => {
                    trace!(%dbid, "waiting for open in progress");
                    // An error means the opener finished without failing.
                    if opened.changed().await.is_ok() {
                        let failure = opened.borrow().clone();
                        if let Some(message) = failure {
                            return Err(SyncError::open(*dbid, message));
                        }
                    }
                }
                Lookup::Open(sender) => return self.open(dbid, sender).await,
            }
        }
    }

    async fn open(
        &self,
        dbid: &DbId,
        sender: watch::Sender<Option<String>>,
    ) -> SyncResult<DbHandle> {
        let mut guard = OpenGuard {
            inner: &self.inner,
            dbid: *dbid,
            installed: false,
            sender,
        };

        debug!(%dbid, "opening database handle");
        match self.inner.provider.open(dbid).await {
            Ok(handle) => {
                CacheInner::install(&self.inner, dbid, Arc::clone(&handle));
                guard.installed = true;
                Ok(handle)
            }
            Err(e) => {
                warn!(%dbid, error = %e, "failed to open database handle");
                guard.sender.send_replace(Some(e.to_string()));
                Err(e)
            }
        }
    }

    /// Returns true if a live handle is cached for `dbid`.
    pub fn contains(&self, dbid: &DbId) -> bool {
        matches!(self.inner.slots.lock().get(dbid), Some(Slot::Live(_)))
    }

    /// Returns the number of live handles.
    pub fn len(&self) -> usize {
        self.inner
            .slots
            .lock()
            .values()
            .filter(|slot| matches!(slot, Slot::Live(_)))
            .count()
    }

    /// Returns true if no handle is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the idle time-to-live.
    pub fn ttl(&self) -> Duration {
        self.inner.ttl
    }

    /// Subscribes to eviction notices.
    pub fn subscribe_evictions(&self) -> broadcast::Receiver<DbId> {
        self.inner.evictions.subscribe()
    }

    /// Closes every cached handle.
    pub async fn shutdown(&self) {
        let drained: Vec<(DbId, DbHandle)> = {
            let mut slots = self.inner.slots.lock();
            let live: Vec<DbId> = slots
                .iter()
                .filter(|(_, slot)| matches!(slot, Slot::Live(_)))
                .map(|(dbid, _)| *dbid)
                .collect();
            live.into_iter()
                .filter_map(|dbid| match slots.remove(&dbid) {
                    Some(Slot::Live(entry)) => {
                        entry.timer.abort();
                        Some((dbid, entry.handle))
                    }
                    _ => None,
                })
                .collect()
        };

        debug!(handles = drained.len(), "shutting down connection cache");
        for (dbid, handle) in drained {
            self.inner.release(dbid, handle).await;
        }
    }
}

impl std::fmt::Debug for ConnectionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionCache")
            .field("ttl", &self.inner.ttl)
            .field("live", &self.len())
            .finish()
    }
}

impl CacheInner {
    fn lookup(&self, dbid: &DbId) -> Lookup {
        let mut slots = self.slots.lock();
        match slots.get_mut(dbid) {
            Some(Slot::Live(entry)) => {
                entry.last_access = Instant::now();
                entry.idle = false;
                Lookup::Hit(Arc::clone(&entry.handle))
            }
            Some(Slot::Opening(opened)) => Lookup::Wait(opened.clone()),
            None => {
                let (sender, receiver) = watch::channel(None);
                slots.insert(*dbid, Slot::Opening(receiver));
                Lookup::Open(sender)
            }
        }
    }

    fn install(this: &Arc<Self>, dbid: &DbId, handle: DbHandle) {
        let generation = this.generations.fetch_add(1, Ordering::Relaxed);
        let timer = Self::arm(this, *dbid, generation);
        let entry = Entry {
            handle,
            last_access: Instant::now(),
            idle: false,
            generation,
            timer,
        };
        if let Some(Slot::Live(previous)) = this.slots.lock().insert(*dbid, Slot::Live(entry)) {
            previous.timer.abort();
        }
    }

    fn arm(this: &Arc<Self>, dbid: DbId, generation: u64) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(this);
        let ttl = this.ttl;
        tokio::spawn(async move {
            let mut deadline = Instant::now();
            loop {
                deadline += ttl;
                tokio::time::sleep_until(deadline).await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                match inner.expire(&dbid, generation) {
                    Expiry::Idle => {}
                    Expiry::Evicted(handle) => {
                        inner.release(dbid, handle).await;
                        return;
                    }
                    Expiry::Stale => return,
                }
            }
        })
    }

    fn expire(&self, dbid: &DbId, generation: u64) -> Expiry {
        let mut slots = self.slots.lock();
        let Some(Slot::Live(entry)) = slots.get_mut(dbid) else {
            return Expiry::Stale;
        };
        if entry.generation != generation {
            return Expiry::Stale;
        }
        if !entry.idle {
            entry.idle = true;
            trace!(%dbid, since = ?entry.last_access.elapsed(), "handle idle");
            return Expiry::Idle;
        }
        match slots.remove(dbid) {
            Some(Slot::Live(entry)) => Expiry::Evicted(entry.handle),
            _ => Expiry::Stale,
        }
    }

    async fn release(&self, dbid: DbId, handle: DbHandle) {
        debug!(%dbid, "evicting database handle");
        let _ = self.evictions.send(dbid);
        if let Err(e) = self.provider.close(&dbid, handle).await {
            warn!(%dbid, error = %e, "failed to close database handle");
        }
    }
}

/// Clears an `Opening` slot if the open did not install a handle, including
/// when the opening future is dropped. Waiters wake when the sender drops.
struct OpenGuard<'a> {
    inner: &'a Arc<CacheInner>,
    dbid: DbId,
    installed: bool,
    sender: watch::Sender<Option<String>>,
}

impl Drop for OpenGuard<'_> {
    fn drop(&mut self) {
        if self.installed {
            return;
        }
        let mut slots = self.inner.slots.lock();
        if matches!(slots.get(&self.dbid), Some(Slot::Opening(_))) {
            slots.remove(&self.dbid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryHandleProvider;

    const TTL: Duration = Duration::from_millis(100);
    const EPSILON: Duration = Duration::from_millis(10);

    fn cache() -> (ConnectionCache, Arc<MemoryHandleProvider>) {
        let provider = Arc::new(MemoryHandleProvider::new());
        let cache = ConnectionCache::new(TTL, provider.clone()).unwrap();
        (cache, provider)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    async fn advance(duration: Duration) {
        tokio::time::advance(duration).await;
        settle().await;
    }

    #[test]
    fn zero_ttl_is_rejected() {
        let provider = Arc::new(MemoryHandleProvider::new());
        assert!(ConnectionCache::new(Duration::ZERO, provider).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn get_opens_once() {
        let (cache, provider) = cache();
        let dbid = DbId::new();

        let first = cache.get(&dbid).await.unwrap();
        let second = cache.get(&dbid).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(provider.open_count(), 1);
        assert!(cache.contains(&dbid));
    }

    #[tokio::test(start_paused = true)]
    async fn entry_survives_one_ttl_and_is_gone_after_two() {
        let (cache, provider) = cache();
        let dbid = DbId::new();
        cache.get(&dbid).await.unwrap();

        advance(TTL + EPSILON).await;
        assert!(cache.contains(&dbid));

        advance(TTL).await;
        assert!(!cache.contains(&dbid));
        assert_eq!(provider.close_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn access_restarts_the_timer() {
        let (cache, _provider) = cache();
        let dbid = DbId::new();
        cache.get(&dbid).await.unwrap();

        advance(TTL + EPSILON).await;
        cache.get(&dbid).await.unwrap();
        advance(TTL + EPSILON).await;
        assert!(cache.contains(&dbid));

        cache.get(&dbid).await.unwrap();
        advance(TTL + EPSILON).await;
        assert!(cache.contains(&dbid));
    }

    #[tokio::test(start_paused = true)]
    async fn evicted_handle_is_closed_and_reopened_on_demand() {
        let (cache, provider) = cache();
        let dbid = DbId::new();
        let mut evictions = cache.subscribe_evictions();
        cache.get(&dbid).await.unwrap();

        advance(TTL * 2 + EPSILON).await;
        assert_eq!(evictions.recv().await.unwrap(), dbid);
        assert!(provider.database(&dbid).is_closed());

        cache.get(&dbid).await.unwrap();
        assert_eq!(provider.open_count(), 2);
        assert!(!provider.database(&dbid).is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_open_leaves_no_entry() {
        let (cache, provider) = cache();
        let dbid = DbId::new();
        provider.fail_opens(dbid);

        assert!(matches!(cache.get(&dbid).await, Err(SyncError::Open { .. })));
        assert!(!cache.contains(&dbid));
        assert!(cache.inner.slots.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn waiters_share_one_open() {
        let (cache, provider) = cache();
        provider.set_open_delay(Some(Duration::from_millis(20)));
        let dbid = DbId::new();

        let gets = (0..8).map(|_| {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get(&dbid).await })
        });
        let handles: Vec<DbHandle> = futures_join(gets).await;

        assert_eq!(provider.open_count(), 1);
        assert!(handles.windows(2).all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));
    }

    #[tokio::test(start_paused = true)]
    async fn waiters_observe_a_failed_open() {
        let (cache, provider) = cache();
        provider.set_open_delay(Some(Duration::from_millis(20)));
        let dbid = DbId::new();
        provider.fail_opens(dbid);

        let first = tokio::spawn({
            let cache = cache.clone();
            async move { cache.get(&dbid).await }
        });
        let second = tokio::spawn({
            let cache = cache.clone();
            async move { cache.get(&dbid).await }
        });

        assert!(first.await.unwrap().is_err());
        assert!(second.await.unwrap().is_err());
        assert!(!cache.contains(&dbid));
    }

    async fn futures_join(
        tasks: impl Iterator<Item = JoinHandle<SyncResult<DbHandle>>>,
    ) -> Vec<DbHandle> {
        let mut handles = Vec::new();
        for task in tasks.collect::<Vec<_>>() {
            handles.push(task.await.unwrap().unwrap());
        }
        handles
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_closes_everything() {
        let (cache, provider) = cache();
        let first = DbId::new();
        let second = DbId::new();
        cache.get(&first).await.unwrap();
        cache.get(&second).await.unwrap();

        cache.shutdown().await;
        assert!(cache.is_empty());
        assert_eq!(provider.close_count(), 2);

        // Aborted timers never close a handle twice.
        advance(TTL * 3).await;
        assert_eq!(provider.close_count(), 2);
    }
}
