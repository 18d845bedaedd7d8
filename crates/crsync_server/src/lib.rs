//! # crsync server
//!
//! Reference sync peer for crsync.
//!
//! The server keeps one in-memory replicated database per `DbId` and serves
//! the standard endpoint set:
//!
//! | Path | Request | Response |
//! |------|---------|----------|
//! | `/sync/create-or-migrate` | `CreateOrMigrateRequest` | `CreateOrMigrateResponse` |
//! | `/sync/apply` | `PushRequest` | `PushResponse` |
//! | `/sync/changes`, `/sync/stream` | `PullRequest` | `PullResponse` |
//! | `/sync/last-seen` | `LastSeenRequest` | `LastSeenResponse` |
//!
//! Pushed changes are merged into the server's replica and appended to its
//! change stream, so every client that pulls sees every other client's
//! writes. A client never pulls its own records back.
//!
//! The server implements [`LoopbackServer`](crsync_engine::LoopbackServer),
//! so sessions can reach it in-process through a
//! [`LoopbackClient`](crsync_engine::LoopbackClient).

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod config;
mod error;
mod handler;
mod server;

pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use handler::{HandlerContext, RequestHandler};
pub use server::SyncServer;
