//! Per-database sync sessions.
//!
//! A session runs as its own task and moves through
//! `Idle → Starting → Streaming → Stopping → Idle`. While streaming it pushes
//! local changes whenever it is woken and pulls remote changes on the
//! configured interval. Failures are reported and retried; they never end the
//! session.

use crate::cache::ConnectionCache;
use crate::checkpoint::CheckpointStore;
use crate::config::SyncConfig;
use crate::database::{DbHandle, Subscription};
use crate::error::{SyncError, SyncResult};
use crate::stream::ChangeStream;
use crate::transport::{Transport, TransportOptions, TransportProvider};
use crsync_protocol::{
    ChangeRecord, Checkpoint, CreateOrMigrateRequest, DbId, Direction, FromWorker, PullRequest,
    PushRequest, Scope, SiteId,
};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, info_span, trace, warn, Instrument};

/// Lifecycle state of a sync session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// No session is running.
    #[default]
    Idle,
    /// Opening the handle and connecting to the remote.
    Starting,
    /// Pushing and pulling changes.
    Streaming,
    /// Finishing in-flight work before going idle.
    Stopping,
}

impl SessionState {
    /// Returns true if the session occupies its database.
    pub fn is_active(&self) -> bool {
        !matches!(self, SessionState::Idle)
    }

    /// Returns true if a session can be started from this state.
    pub fn can_start(&self) -> bool {
        matches!(self, SessionState::Idle)
    }
}

/// Everything a session borrows from its worker.
#[derive(Clone)]
pub(crate) struct SessionContext {
    pub(crate) config: Arc<SyncConfig>,
    pub(crate) cache: ConnectionCache,
    pub(crate) transports: Arc<dyn TransportProvider>,
    pub(crate) reports: mpsc::Sender<FromWorker>,
}

/// The worker's grip on a running session.
pub(crate) struct SessionHandle {
    state: Arc<RwLock<SessionState>>,
    wake: Arc<Notify>,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    /// Spawns a session for `dbid`.
    pub(crate) fn start(
        dbid: DbId,
        options: TransportOptions,
        scope: Scope,
        ctx: SessionContext,
    ) -> Self {
        let state = Arc::new(RwLock::new(SessionState::Starting));
        let wake = Arc::new(Notify::new());
        let (stop, stop_rx) = watch::channel(false);

        let task = tokio::spawn(
            run(
                dbid,
                options,
                scope,
                ctx,
                Arc::clone(&state),
                Arc::clone(&wake),
                stop_rx,
            )
            .instrument(info_span!("sync_session", %dbid)),
        );

        Self {
            state,
            wake,
            stop,
            task,
        }
    }

    /// Returns the current state. A session whose task has ended is idle.
    pub(crate) fn state(&self) -> SessionState {
        if self.task.is_finished() {
            SessionState::Idle
        } else {
            *self.state.read()
        }
    }

    /// Asks the session to push pending local changes. Repeated wakes before
    /// the session runs collapse into one.
    pub(crate) fn wake(&self) {
        self.wake.notify_one();
    }

    /// Stops the session and waits for it to finish.
    ///
    /// An in-flight pull is abandoned; an in-flight push or apply completes
    /// first.
    pub(crate) async fn stop(self) {
        if !self.task.is_finished() {
            *self.state.write() = SessionState::Stopping;
        }
        self.stop.send_replace(true);
        if let Err(e) = self.task.await {
            if e.is_panic() {
                warn!(error = %e, "sync session panicked");
            }
        }
    }
}

async fn run(
    dbid: DbId,
    options: TransportOptions,
    scope: Scope,
    ctx: SessionContext,
    state: Arc<RwLock<SessionState>>,
    wake: Arc<Notify>,
    mut stop: watch::Receiver<bool>,
) {
    debug!(?scope, "starting sync session");
    let session_stop = stop.clone();
    let established = tokio::select! {
        biased;
        _ = stopped(&mut stop) => None,
        result = Session::establish(dbid, &options, scope, &ctx, &wake, session_stop) => {
            Some(result)
        }
    };

    match established {
        None => debug!("stopped while starting"),
        Some(Err(e)) => {
            warn!(error = %e, "failed to start sync session");
            let failure = FromWorker::SyncFailed {
                dbid,
                kind: e.kind(),
                message: e.to_string(),
            };
            if ctx.reports.send(failure).await.is_err() {
                trace!("report channel closed");
            }
        }
        Some(Ok((mut session, subscription))) => {
            {
                let mut state = state.write();
                if *state == SessionState::Starting {
                    *state = SessionState::Streaming;
                }
            }
            info!(remote = %session.remote_site, "sync session streaming");
            session.stream().await;
            drop(subscription);
            info!("sync session ended");
        }
    }

    *state.write() = SessionState::Idle;
}

/// Resolves once the stop flag is raised or its sender is gone.
async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

struct Session {
    dbid: DbId,
    scope: Scope,
    ctx: SessionContext,
    transport: Arc<dyn Transport>,
    stream: ChangeStream,
    local_site: SiteId,
    remote_site: SiteId,
    /// Position in the local stream the remote has acknowledged.
    sent_through: Checkpoint,
    failures: u32,
    retry_at: Option<Instant>,
    wake: Arc<Notify>,
    stop: watch::Receiver<bool>,
}

impl Session {
    async fn establish(
        dbid: DbId,
        options: &TransportOptions,
        scope: Scope,
        ctx: &SessionContext,
        wake: &Arc<Notify>,
        stop: watch::Receiver<bool>,
    ) -> SyncResult<(Self, Subscription)> {
        let handle = ctx.cache.get(&dbid).await?;
        let transport = ctx.transports.connect(&dbid, options).await?;
        let local_site = handle.site_id();

        let remote = transport
            .create_or_migrate(&CreateOrMigrateRequest {
                dbid,
                site_id: local_site,
            })
            .await?;
        let sent_through = transport.get_last_seen(&dbid, &local_site).await?;
        debug!(remote = %remote.site_id, from = %sent_through, "remote ready");

        let listener = Arc::clone(wake);
        let subscription = handle.on_change(Arc::new(move || listener.notify_one()));

        let session = Self {
            dbid,
            scope,
            ctx: ctx.clone(),
            transport,
            stream: ChangeStream::new(ctx.config.batch_size),
            local_site,
            remote_site: remote.site_id,
            sent_through,
            failures: 0,
            retry_at: None,
            wake: Arc::clone(wake),
            stop,
        };
        Ok((session, subscription))
    }

    async fn stream(&mut self) {
        let ttl = self.ctx.cache.ttl();
        let mut pull_tick = self.ctx.config.pull_interval.map(|period| {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        // Touching the handle more often than the TTL keeps it cached.
        let keepalive_period = (ttl / 2).max(Duration::from_millis(1));
        let mut keepalive =
            tokio::time::interval_at(Instant::now() + keepalive_period, keepalive_period);
        let mut evictions = self.ctx.cache.subscribe_evictions();
        let wake = Arc::clone(&self.wake);

        // Flush anything written before the session started.
        wake.notify_one();

        loop {
            tokio::select! {
                biased;
                _ = stopped(&mut self.stop) => break,
                evicted = evictions.recv() => {
                    if self.was_evicted(evicted) {
                        info!("database handle evicted");
                        break;
                    }
                }
                _ = wake.notified() => self.push_cycle().await,
                _ = sleep_until(self.retry_at) => {
                    self.retry_at = None;
                    self.push_cycle().await;
                }
                _ = tick(&mut pull_tick) => self.pull_cycle().await,
                _ = keepalive.tick() => {
                    if let Err(e) = self.ctx.cache.get(&self.dbid).await {
                        warn!(error = %e, "failed to keep database handle open");
                        self.report_failure(&e).await;
                    }
                }
            }
        }
    }

    fn was_evicted(&self, evicted: Result<DbId, RecvError>) -> bool {
        match evicted {
            Ok(dbid) => dbid == self.dbid,
            Err(RecvError::Lagged(_)) => !self.ctx.cache.contains(&self.dbid),
            Err(RecvError::Closed) => true,
        }
    }

    async fn push_cycle(&mut self) {
        match self.push_pending().await {
            Ok(()) => {
                self.failures = 0;
                self.retry_at = None;
            }
            Err(e) => {
                self.failures += 1;
                warn!(error = %e, attempt = self.failures, "push failed");
                self.report_failure(&e).await;

                let retry = &self.ctx.config.retry;
                if e.is_retryable() && retry.allows_retry(self.failures) {
                    let delay = retry.delay_for_attempt(self.failures);
                    debug!(?delay, "scheduling push retry");
                    self.retry_at = Some(Instant::now() + delay);
                } else {
                    // Wait for the next local change before trying again.
                    self.failures = 0;
                    self.retry_at = None;
                }
            }
        }
    }

    /// Pushes every pending local batch. The checkpoint only moves after the
    /// remote acknowledges a batch, and jumps to the acknowledged position
    /// when that lies further ahead.
    async fn push_pending(&mut self) -> SyncResult<()> {
        let handle = self.ctx.cache.get(&self.dbid).await?;
        loop {
            let batch = self
                .stream
                .collect_since(handle.as_ref(), self.sent_through, self.scope)
                .await?;
            let drained = batch.changes.len() < self.stream.batch_size();

            // The remote already holds its own writes.
            let remote_site = self.remote_site;
            let changes: Vec<ChangeRecord> = batch
                .changes
                .into_iter()
                .filter(|change| change.site_id != remote_site)
                .collect();

            let mut through = batch.through;
            if !changes.is_empty() {
                let request = PushRequest::new(self.dbid, self.local_site, changes);
                let response = self.transport.push(&request).await?;
                debug!(
                    count = request.changes.len(),
                    acked = %response.checkpoint,
                    "pushed changes"
                );
                // A remote that already held the batch acknowledges further on.
                through = through.max(response.checkpoint);
                self.report(FromWorker::SyncedRemote {
                    dbid: self.dbid,
                    direction: Direction::Pushed,
                    collected_changes: request.changes,
                })
                .await;
            }
            self.sent_through = through;

            if drained {
                return Ok(());
            }
        }
    }

    async fn pull_cycle(&mut self) {
        match self.pull_remote().await {
            Ok(()) => {}
            Err(SyncError::Cancelled) => debug!("pull cancelled"),
            Err(e) => {
                warn!(error = %e, "pull failed");
                self.report_failure(&e).await;
            }
        }
    }

    /// Pulls and applies remote batches until the remote has no more.
    async fn pull_remote(&mut self) -> SyncResult<()> {
        let handle: DbHandle = self.ctx.cache.get(&self.dbid).await?;
        let limit = u32::try_from(self.stream.batch_size()).unwrap_or(u32::MAX);

        loop {
            let since = CheckpointStore::new(handle.as_ref())
                .get(&self.remote_site)
                .await?;
            let request = PullRequest::new(self.dbid, self.local_site, since, limit);

            let response = tokio::select! {
                biased;
                _ = stopped(&mut self.stop) => return Err(SyncError::Cancelled),
                response = self.transport.pull(&request) => response?,
            };
            if response.site_id != self.remote_site {
                return Err(SyncError::transport_fatal(format!(
                    "pull answered by site {} instead of {}",
                    response.site_id, self.remote_site
                )));
            }

            let applied = self
                .stream
                .apply(
                    handle.as_ref(),
                    &self.remote_site,
                    &response.changes,
                    response.checkpoint,
                )
                .await?;

            if !response.changes.is_empty() {
                self.transport
                    .set_last_seen(&self.dbid, &self.local_site, applied)
                    .await?;
                debug!(count = response.changes.len(), through = %applied, "pulled changes");
                self.report(FromWorker::SyncedRemote {
                    dbid: self.dbid,
                    direction: Direction::Pulled,
                    collected_changes: response.changes,
                })
                .await;
            }

            if !response.has_more || applied == since {
                return Ok(());
            }
        }
    }

    async fn report_failure(&mut self, error: &SyncError) {
        self.report(FromWorker::SyncFailed {
            dbid: self.dbid,
            kind: error.kind(),
            message: error.to_string(),
        })
        .await;
    }

    /// Sends a report, giving up if the session is stopped while the channel
    /// is full.
    async fn report(&mut self, message: FromWorker) {
        tokio::select! {
            biased;
            sent = self.ctx.reports.send(message) => {
                if sent.is_err() {
                    trace!("report channel closed");
                }
            }
            _ = stopped(&mut self.stop) => trace!("dropping report from stopped session"),
        }
    }
}
