//! Injected providers.

use crate::database::{DbHandle, HandleProvider};
use crate::error::{SyncError, SyncResult};
use crate::transport::{Transport, TransportOptions, TransportProvider};
use async_trait::async_trait;
use crsync_protocol::DbId;
use std::sync::Arc;

/// The handle and transport providers a worker runs with.
///
/// The default value uses [`Unconfigured`] for both, so a worker that was
/// never given real providers fails fast instead of silently doing nothing.
#[derive(Clone)]
pub struct Providers {
    /// Opens and closes database handles.
    pub handles: Arc<dyn HandleProvider>,
    /// Connects sessions to remotes.
    pub transports: Arc<dyn TransportProvider>,
}

impl Providers {
    /// Creates a provider set.
    pub fn new(handles: Arc<dyn HandleProvider>, transports: Arc<dyn TransportProvider>) -> Self {
        Self {
            handles,
            transports,
        }
    }

    /// Replaces the handle provider.
    pub fn with_handles(mut self, handles: Arc<dyn HandleProvider>) -> Self {
        self.handles = handles;
        self
    }

    /// Replaces the transport provider.
    pub fn with_transports(mut self, transports: Arc<dyn TransportProvider>) -> Self {
        self.transports = transports;
        self
    }
}

impl Default for Providers {
    fn default() -> Self {
        Self {
            handles: Arc::new(Unconfigured),
            transports: Arc::new(Unconfigured),
        }
    }
}

impl std::fmt::Debug for Providers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Providers").finish_non_exhaustive()
    }
}

/// Placeholder provider that fails every call with [`SyncError::NotConfigured`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Unconfigured;

#[async_trait]
impl HandleProvider for Unconfigured {
    async fn open(&self, _dbid: &DbId) -> SyncResult<DbHandle> {
        Err(SyncError::NotConfigured("database"))
    }

    async fn close(&self, _dbid: &DbId, _handle: DbHandle) -> SyncResult<()> {
        Err(SyncError::NotConfigured("database"))
    }
}

#[async_trait]
impl TransportProvider for Unconfigured {
    async fn connect(
        &self,
        _dbid: &DbId,
        _options: &TransportOptions,
    ) -> SyncResult<Arc<dyn Transport>> {
        Err(SyncError::NotConfigured("transport"))
    }
}
