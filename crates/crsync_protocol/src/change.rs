//! Change records and checkpoints.

use crate::ids::SiteId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of mutation a change record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// Row was created.
    Insert,
    /// Row was modified.
    Update,
    /// Row was removed.
    Delete,
}

/// A position in a database's change stream.
///
/// Recorded per (local database, remote site) pair to mean "everything from
/// that site up to here has been durably applied or acknowledged". Ordering is
/// lexicographic on `(version, sequence)`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Checkpoint {
    /// Database version.
    pub version: i64,
    /// Sequence within that version.
    pub sequence: i32,
}

impl Checkpoint {
    /// The position before any change.
    pub const ZERO: Checkpoint = Checkpoint {
        version: 0,
        sequence: 0,
    };

    /// Creates a checkpoint.
    #[must_use]
    pub const fn new(version: i64, sequence: i32) -> Self {
        Self { version, sequence }
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.version, self.sequence)
    }
}

/// Which writes an outbound stream carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Scope {
    /// Every change in the log, whatever its origin. Used for relays.
    AllWrites,
    /// Only changes that originated at the local site.
    LocalWritesOnly,
}

impl Scope {
    /// Returns true if a record from `origin` belongs in a stream produced at `local`.
    pub fn includes(&self, origin: &SiteId, local: &SiteId) -> bool {
        match self {
            Scope::AllWrites => true,
            Scope::LocalWritesOnly => origin == local,
        }
    }
}

/// One replicated mutation.
///
/// Change records are immutable once produced. `version` is scoped to the
/// originating site (`site_id`) and totally ordered within it. `db_version`
/// and `seq` locate the record in the change stream of the database that
/// emitted it, which is what checkpoints track.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Kind of mutation.
    pub kind: ChangeKind,
    /// Table the row belongs to.
    pub table: String,
    /// Serialized primary key.
    pub row_key: Vec<u8>,
    /// Row contents after the change. `None` for deletes.
    pub payload: Option<Vec<u8>>,
    /// Version scoped to the originating site.
    pub version: i64,
    /// Originating site.
    pub site_id: SiteId,
    /// Database version in the emitting change stream.
    pub db_version: i64,
    /// Sequence within `db_version`.
    pub seq: i32,
}

impl ChangeRecord {
    /// Creates an insert record.
    pub fn insert(
        table: impl Into<String>,
        row_key: Vec<u8>,
        payload: Vec<u8>,
        version: i64,
        site_id: SiteId,
    ) -> Self {
        Self {
            kind: ChangeKind::Insert,
            table: table.into(),
            row_key,
            payload: Some(payload),
            version,
            site_id,
            db_version: version,
            seq: 0,
        }
    }

    /// Creates an update record.
    pub fn update(
        table: impl Into<String>,
        row_key: Vec<u8>,
        payload: Vec<u8>,
        version: i64,
        site_id: SiteId,
    ) -> Self {
        Self {
            kind: ChangeKind::Update,
            ..Self::insert(table, row_key, payload, version, site_id)
        }
    }

    /// Creates a delete record.
    pub fn delete(table: impl Into<String>, row_key: Vec<u8>, version: i64, site_id: SiteId) -> Self {
        Self {
            kind: ChangeKind::Delete,
            table: table.into(),
            row_key,
            payload: None,
            version,
            site_id,
            db_version: version,
            seq: 0,
        }
    }

    /// Sets the stream position of this record.
    #[must_use]
    pub fn at(mut self, db_version: i64, seq: i32) -> Self {
        self.db_version = db_version;
        self.seq = seq;
        self
    }

    /// Returns the stream position of this record.
    pub fn position(&self) -> Checkpoint {
        Checkpoint::new(self.db_version, self.seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_kinds_travel_by_name() {
        let kinds = [ChangeKind::Insert, ChangeKind::Update, ChangeKind::Delete];
        let json = serde_json::to_string(&kinds).unwrap();
        assert_eq!(json, r#"["insert","update","delete"]"#);
        assert!(serde_json::from_str::<ChangeKind>("1").is_err());
    }

    #[test]
    fn checkpoint_ordering_is_lexicographic() {
        assert!(Checkpoint::new(1, 5) < Checkpoint::new(2, 0));
        assert!(Checkpoint::new(2, 0) < Checkpoint::new(2, 1));
        assert_eq!(Checkpoint::default(), Checkpoint::ZERO);
        assert_eq!(Checkpoint::new(7, 3).to_string(), "7:3");
    }

    #[test]
    fn scope_filtering() {
        let local = SiteId::from_bytes([1u8; 16]);
        let remote = SiteId::from_bytes([2u8; 16]);

        assert!(Scope::LocalWritesOnly.includes(&local, &local));
        assert!(!Scope::LocalWritesOnly.includes(&remote, &local));
        assert!(Scope::AllWrites.includes(&remote, &local));
    }

    #[test]
    fn record_position() {
        let site = SiteId::from_bytes([3u8; 16]);
        let record = ChangeRecord::insert("todo", vec![1], vec![0x42], 4, site).at(9, 2);

        assert_eq!(record.kind, ChangeKind::Insert);
        assert_eq!(record.version, 4);
        assert_eq!(record.position(), Checkpoint::new(9, 2));
    }

    #[test]
    fn delete_has_no_payload() {
        let site = SiteId::from_bytes([3u8; 16]);
        let record = ChangeRecord::delete("todo", vec![1], 5, site);
        assert_eq!(record.kind, ChangeKind::Delete);
        assert!(record.payload.is_none());
    }
}
