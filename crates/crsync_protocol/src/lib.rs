//! # crsync Protocol
//!
//! Data types shared by every crsync component.
//!
//! This crate provides:
//! - `DbId` / `SiteId` identifiers
//! - `ChangeRecord` and `Checkpoint` for change streaming
//! - Worker messages crossing the sync engine boundary
//! - Wire requests/responses for transports
//! - JSON and CBOR codecs selected by `ContentType`
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change;
mod codec;
mod error;
mod ids;
mod messages;
mod wire;

pub use change::{ChangeKind, ChangeRecord, Checkpoint, Scope};
pub use codec::{decode, encode, ContentType};
pub use error::{ProtocolError, ProtocolResult};
pub use ids::{DbId, SiteId};
pub use messages::{Direction, FailureKind, FromWorker, ToWorker};
pub use wire::{
    CreateOrMigrateRequest, CreateOrMigrateResponse, Endpoints, LastSeenRequest, LastSeenResponse,
    PullRequest, PullResponse, PushRequest, PushResponse,
};
