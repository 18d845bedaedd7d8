//! The sync worker.
//!
//! The worker owns every session and the connection cache. The host drives it
//! only with [`ToWorker`] messages and hears back only through
//! [`FromWorker`] messages; no state is shared across that boundary.

use crate::cache::ConnectionCache;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::provider::Providers;
use crate::session::{SessionContext, SessionHandle};
use crate::transport::TransportOptions;
use crsync_protocol::{DbId, FromWorker, Scope, ToWorker};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, trace, warn, Instrument};

/// Message loop that runs sync sessions.
///
/// Stopping a session happens off the loop, so a session that is slow to
/// finish never holds up messages for other databases.
pub struct SyncWorker {
    ctx: SessionContext,
    sessions: HashMap<DbId, SessionHandle>,
    stopping: HashMap<DbId, JoinHandle<()>>,
}

impl SyncWorker {
    /// Starts a worker on the current tokio runtime.
    ///
    /// Fails if `config` is invalid.
    pub fn spawn(config: SyncConfig, providers: Providers) -> SyncResult<WorkerHandle> {
        config.validate()?;
        let cache = ConnectionCache::new(config.cache_ttl, Arc::clone(&providers.handles))?;
        let (sender, inbound) = mpsc::channel(config.channel_capacity);
        let (reports, outbound) = mpsc::channel(config.channel_capacity);

        let worker = SyncWorker {
            ctx: SessionContext {
                config: Arc::new(config),
                cache,
                transports: providers.transports,
                reports,
            },
            sessions: HashMap::new(),
            stopping: HashMap::new(),
        };
        let task = tokio::spawn(worker.run(inbound).instrument(info_span!("sync_worker")));

        Ok(WorkerHandle {
            sender,
            reports: outbound,
            task,
        })
    }

    async fn run(mut self, mut inbound: mpsc::Receiver<ToWorker>) {
        info!("sync worker started");
        while let Some(message) = inbound.recv().await {
            self.handle(message);
        }
        self.shutdown().await;
        info!("sync worker stopped");
    }

    fn handle(&mut self, message: ToWorker) {
        match message {
            ToWorker::StartSync {
                dbid,
                endpoints,
                scope,
                content_type,
            } => {
                let options = TransportOptions::new(endpoints, content_type);
                if let Err(e) = self.start(dbid, options, scope) {
                    warn!(%dbid, error = %e, "rejected sync start");
                    self.report_failure(dbid, &e);
                }
            }
            ToWorker::LocalDbChanged { dbid } => match self.sessions.get(&dbid) {
                Some(session) if session.state().is_active() => session.wake(),
                _ => trace!(%dbid, "local change without an active session"),
            },
            ToWorker::StopSync { dbid } => self.stop(&dbid),
        }
    }

    fn start(&mut self, dbid: DbId, options: TransportOptions, scope: Scope) -> SyncResult<()> {
        self.stopping.retain(|_, task| !task.is_finished());
        if self.stopping.contains_key(&dbid) {
            return Err(SyncError::SessionStopping(dbid));
        }
        if let Some(session) = self.sessions.get(&dbid) {
            if session.state().is_active() {
                return Err(SyncError::SessionAlreadyActive(dbid));
            }
        }
        // Replaces any session that has already ended on its own.
        let session = SessionHandle::start(dbid, options, scope, self.ctx.clone());
        self.sessions.insert(dbid, session);
        info!(%dbid, ?scope, "sync started");
        Ok(())
    }

    /// Signals the session to stop and lets it finish in the background.
    fn stop(&mut self, dbid: &DbId) {
        let Some(session) = self.sessions.remove(dbid) else {
            if self.stopping.contains_key(dbid) {
                debug!(%dbid, "stop requested for stopping database");
            } else {
                debug!(%dbid, "stop requested for idle database");
            }
            return;
        };

        let dbid = *dbid;
        let task = tokio::spawn(
            async move {
                session.stop().await;
                info!(%dbid, "sync stopped");
            }
            .in_current_span(),
        );
        self.stopping.insert(dbid, task);
    }

    async fn shutdown(&mut self) {
        let active: Vec<DbId> = self.sessions.keys().copied().collect();
        for dbid in active {
            self.stop(&dbid);
        }
        for (dbid, task) in self.stopping.drain() {
            if let Err(e) = task.await {
                warn!(%dbid, error = %e, "session stop failed");
            }
        }
        self.ctx.cache.shutdown().await;
    }

    /// Reports a failure without waiting. A host that is not reading reports
    /// loses them rather than stalling the worker.
    fn report_failure(&self, dbid: DbId, error: &SyncError) {
        let failure = FromWorker::SyncFailed {
            dbid,
            kind: error.kind(),
            message: error.to_string(),
        };
        match self.ctx.reports.try_send(failure) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(%dbid, error = %error, "report channel full, dropping failure report");
            }
            Err(TrySendError::Closed(_)) => trace!("report channel closed"),
        }
    }
}

/// The host's side of a running [`SyncWorker`].
pub struct WorkerHandle {
    sender: mpsc::Sender<ToWorker>,
    reports: mpsc::Receiver<FromWorker>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Sends a message to the worker.
    pub async fn send(&self, message: ToWorker) -> SyncResult<()> {
        self.sender
            .send(message)
            .await
            .map_err(|_| SyncError::WorkerStopped)
    }

    /// Returns a sender for posting messages from elsewhere.
    pub fn sender(&self) -> mpsc::Sender<ToWorker> {
        self.sender.clone()
    }

    /// Waits for the next report. Returns `None` once the worker has stopped.
    pub async fn recv(&mut self) -> Option<FromWorker> {
        self.reports.recv().await
    }

    /// Returns a report if one is ready.
    pub fn try_recv(&mut self) -> Option<FromWorker> {
        self.reports.try_recv().ok()
    }

    /// Stops every session, closes every cached handle and waits for the
    /// worker to exit.
    ///
    /// Senders obtained through [`sender`](Self::sender) keep the worker
    /// alive until they are dropped too.
    pub async fn shutdown(self) {
        let WorkerHandle {
            sender,
            reports,
            task,
        } = self;
        drop(sender);
        drop(reports);
        if let Err(e) = task.await {
            warn!(error = %e, "sync worker panicked");
        }
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("running", &!self.task.is_finished())
            .finish()
    }
}
