//! # crsync Engine
//!
//! Synchronizes change logs between a conflict-free replicated database and
//! remote peers.
//!
//! This crate provides:
//! - A connection cache holding at most one live handle per database, with
//!   sliding idle eviction
//! - A checkpoint store that refuses to move backward
//! - Outbound change collection (all writes or local writes only) and
//!   atomic inbound apply
//! - A per-database sync session state machine
//!   (idle → starting → streaming → stopping → idle)
//! - A worker that is driven only by [`ToWorker`] messages and reports only
//!   through [`FromWorker`] messages
//! - Transport and handle provider contracts, with an HTTP transport over an
//!   abstract client and in-memory reference implementations
//!
//! ## Architecture
//!
//! A local write wakes the session, which pulls changes since its checkpoint
//! from the cached handle and pushes them through the transport. Remote
//! changes travel the other way and are applied in one transaction. A
//! checkpoint only advances after a durable apply or acknowledgement.
//!
//! ## Key Invariants
//!
//! - One live handle per `DbId`; a concurrent `get` never opens a duplicate
//! - Checkpoints never move backward
//! - Inbound batches apply entirely or not at all
//! - One active session per `DbId`
//! - Background failures are reported, never fatal to the host
//!
//! [`ToWorker`]: crsync_protocol::ToWorker
//! [`FromWorker`]: crsync_protocol::FromWorker

#![deny(unsafe_code)]
#![warn(missing_docs)]
// Production code MUST NOT use panic!/unwrap()/expect()
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod cache;
mod checkpoint;
mod config;
mod database;
mod error;
mod http;
mod memory;
mod provider;
mod session;
mod stream;
mod transport;
mod worker;

pub use cache::ConnectionCache;
pub use checkpoint::CheckpointStore;
pub use config::{RetryConfig, SyncConfig};
pub use database::{ChangeListener, DbHandle, HandleProvider, ReplicatedDb, Subscription};
pub use error::{SyncError, SyncResult};
pub use http::{
    HttpClient, HttpError, HttpTransport, HttpTransportProvider, LoopbackClient, LoopbackServer,
};
pub use memory::{MemoryDatabase, MemoryHandleProvider};
pub use provider::{Providers, Unconfigured};
pub use session::SessionState;
pub use stream::{ChangeStream, CollectedBatch};
pub use transport::{
    FixedTransportProvider, MockTransport, Transport, TransportOptions, TransportProvider,
};
pub use worker::{SyncWorker, WorkerHandle};
