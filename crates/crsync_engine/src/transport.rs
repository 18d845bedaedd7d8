//! Transport layer abstraction for sync operations.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use crsync_protocol::{
    Checkpoint, ContentType, CreateOrMigrateRequest, CreateOrMigrateResponse, DbId, Endpoints,
    LastSeenRequest, LastSeenResponse, PullRequest, PullResponse, PushRequest, PushResponse,
    SiteId,
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A sync transport carries requests to one remote peer.
///
/// This trait abstracts the network layer, allowing for different
/// implementations (HTTP, in-process loopback, mock for testing).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Creates the remote database or migrates it, returning the remote site id.
    async fn create_or_migrate(
        &self,
        request: &CreateOrMigrateRequest,
    ) -> SyncResult<CreateOrMigrateResponse>;

    /// Pushes a batch of changes. A response is a durable acknowledgement.
    async fn push(&self, request: &PushRequest) -> SyncResult<PushResponse>;

    /// Pulls a batch of remote changes.
    async fn pull(&self, request: &PullRequest) -> SyncResult<PullResponse>;

    /// Reads or records a last-seen position on the remote.
    async fn last_seen(&self, request: &LastSeenRequest) -> SyncResult<LastSeenResponse>;

    /// Returns how far the remote has applied changes pushed by `site_id`.
    async fn get_last_seen(&self, dbid: &DbId, site_id: &SiteId) -> SyncResult<Checkpoint> {
        let request = LastSeenRequest {
            dbid: *dbid,
            site_id: *site_id,
            set: None,
        };
        Ok(self.last_seen(&request).await?.checkpoint)
    }

    /// Records on the remote how far `site_id` has applied the remote's changes.
    async fn set_last_seen(
        &self,
        dbid: &DbId,
        site_id: &SiteId,
        checkpoint: Checkpoint,
    ) -> SyncResult<()> {
        let request = LastSeenRequest {
            dbid: *dbid,
            site_id: *site_id,
            set: Some(checkpoint),
        };
        self.last_seen(&request).await.map(|_| ())
    }
}

/// Where and how a session reaches its remote.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportOptions {
    /// Remote endpoints.
    pub endpoints: Endpoints,
    /// Body encoding.
    pub content_type: ContentType,
}

impl TransportOptions {
    /// Creates transport options.
    pub fn new(endpoints: Endpoints, content_type: ContentType) -> Self {
        Self {
            endpoints,
            content_type,
        }
    }
}

/// Creates transports for sync sessions.
#[async_trait]
pub trait TransportProvider: Send + Sync {
    /// Connects to the remote described by `options` for database `dbid`.
    async fn connect(
        &self,
        dbid: &DbId,
        options: &TransportOptions,
    ) -> SyncResult<Arc<dyn Transport>>;
}

/// Hands out the same transport for every connection.
pub struct FixedTransportProvider {
    transport: Arc<dyn Transport>,
}

impl FixedTransportProvider {
    /// Creates a provider that always returns `transport`.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl TransportProvider for FixedTransportProvider {
    async fn connect(
        &self,
        _dbid: &DbId,
        _options: &TransportOptions,
    ) -> SyncResult<Arc<dyn Transport>> {
        Ok(Arc::clone(&self.transport))
    }
}

/// A mock transport for testing.
///
/// Pushes are acknowledged at the position of their last record and kept
/// for inspection. Pulls are answered from a queue of canned responses, or
/// with an empty batch when the queue is empty.
#[derive(Debug)]
pub struct MockTransport {
    connected: AtomicBool,
    remote_site: SiteId,
    pushes: Mutex<Vec<PushRequest>>,
    pulls: Mutex<Vec<PullRequest>>,
    pull_responses: Mutex<VecDeque<PullResponse>>,
    last_seen: Mutex<HashMap<SiteId, Checkpoint>>,
    pulled: Mutex<HashMap<SiteId, Checkpoint>>,
    failing_pushes: AtomicUsize,
    pull_delay: Mutex<Option<Duration>>,
    push_delay: Mutex<Option<Duration>>,
}

impl MockTransport {
    /// Creates a new mock transport for a remote with a random site id.
    pub fn new() -> Self {
        Self::with_remote_site(SiteId::new())
    }

    /// Creates a new mock transport for the given remote site.
    pub fn with_remote_site(remote_site: SiteId) -> Self {
        Self {
            connected: AtomicBool::new(true),
            remote_site,
            pushes: Mutex::new(Vec::new()),
            pulls: Mutex::new(Vec::new()),
            pull_responses: Mutex::new(VecDeque::new()),
            last_seen: Mutex::new(HashMap::new()),
            pulled: Mutex::new(HashMap::new()),
            failing_pushes: AtomicUsize::new(0),
            pull_delay: Mutex::new(None),
            push_delay: Mutex::new(None),
        }
    }

    /// Returns the site id the mock reports for the remote.
    pub fn remote_site(&self) -> SiteId {
        self.remote_site
    }

    /// Queues a pull response.
    pub fn push_pull_response(&self, response: PullResponse) {
        self.pull_responses.lock().push_back(response);
    }

    /// Makes the next `count` pushes fail with a retryable error.
    pub fn fail_next_pushes(&self, count: usize) {
        self.failing_pushes.store(count, Ordering::SeqCst);
    }

    /// Delays every pull by `delay`.
    pub fn set_pull_delay(&self, delay: Option<Duration>) {
        *self.pull_delay.lock() = delay;
    }

    /// Delays every push by `delay` before it is acknowledged.
    pub fn set_push_delay(&self, delay: Option<Duration>) {
        *self.push_delay.lock() = delay;
    }

    /// Sets the connected state.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Presets the position the remote reports for `site_id`.
    pub fn set_remote_last_seen(&self, site_id: SiteId, checkpoint: Checkpoint) {
        self.last_seen.lock().insert(site_id, checkpoint);
    }

    /// Returns every acknowledged push.
    pub fn pushes(&self) -> Vec<PushRequest> {
        self.pushes.lock().clone()
    }

    /// Returns every pull request received.
    pub fn pulls(&self) -> Vec<PullRequest> {
        self.pulls.lock().clone()
    }

    /// Returns how far `site_id` reported having applied pulled changes.
    pub fn pulled_through(&self, site_id: &SiteId) -> Option<Checkpoint> {
        self.pulled.lock().get(site_id).copied()
    }

    fn ensure_connected(&self) -> SyncResult<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SyncError::transport_retryable("not connected"))
        }
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn create_or_migrate(
        &self,
        _request: &CreateOrMigrateRequest,
    ) -> SyncResult<CreateOrMigrateResponse> {
        self.ensure_connected()?;
        Ok(CreateOrMigrateResponse {
            site_id: self.remote_site,
        })
    }

    async fn push(&self, request: &PushRequest) -> SyncResult<PushResponse> {
        self.ensure_connected()?;
        let failing = self
            .failing_pushes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(SyncError::transport_retryable("mock push failure"));
        }

        let delay = *self.push_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut last_seen = self.last_seen.lock();
        let acked = last_seen.entry(request.from_site).or_default();
        if let Some(last) = request.changes.last() {
            *acked = (*acked).max(last.position());
        }
        let checkpoint = *acked;
        drop(last_seen);

        self.pushes.lock().push(request.clone());
        Ok(PushResponse { checkpoint })
    }

    async fn pull(&self, request: &PullRequest) -> SyncResult<PullResponse> {
        self.ensure_connected()?;
        self.pulls.lock().push(request.clone());

        let delay = *self.pull_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let queued = self.pull_responses.lock().pop_front();
        Ok(queued.unwrap_or(PullResponse {
            site_id: self.remote_site,
            changes: Vec::new(),
            checkpoint: request.since,
            has_more: false,
        }))
    }

    async fn last_seen(&self, request: &LastSeenRequest) -> SyncResult<LastSeenResponse> {
        self.ensure_connected()?;
        let checkpoint = match request.set {
            Some(checkpoint) => {
                let mut pulled = self.pulled.lock();
                let entry = pulled.entry(request.site_id).or_default();
                *entry = (*entry).max(checkpoint);
                *entry
            }
            None => self
                .last_seen
                .lock()
                .get(&request.site_id)
                .copied()
                .unwrap_or_default(),
        };
        Ok(LastSeenResponse { checkpoint })
    }
}
