//! rollcall-store: Persistence boundary for the identity pipeline.
//!
//! The store is the only serialization point for enrollment: `(name, group)`
//! uniqueness is a UNIQUE index, so concurrent or multi-process enrollments
//! are safe as long as they share one database.

mod sqlite;

pub use sqlite::SqliteStore;

use chrono::{DateTime, Duration, Utc};
use rollcall_core::{AttendanceEvent, Embedding, Group, Identity, IdentityKey};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("identity already registered: {0}")]
    ConstraintViolation(IdentityKey),
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("store connection lock poisoned")]
    Poisoned,
}

/// Which fields select "the same person" for attendance lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttendanceKey<'a> {
    Name(&'a str),
    NameAndGroup(&'a str, &'a str),
}

/// Unique-key insert plus query-by-field over identities, groups and attendance.
pub trait FaceStore: Send + Sync {
    /// Insert a new identity, creating its group first if unseen.
    ///
    /// Both writes commit together. A `(name, group)` already present yields
    /// [`StoreError::ConstraintViolation`] and leaves the store untouched.
    fn insert_identity(&self, key: &IdentityKey, embedding: &Embedding)
        -> Result<Identity, StoreError>;

    fn find_identity(&self, key: &IdentityKey) -> Result<Option<Identity>, StoreError>;

    /// Every identity in insertion order.
    fn identities(&self) -> Result<Vec<Identity>, StoreError>;

    fn identities_in_group(&self, group: &str) -> Result<Vec<Identity>, StoreError>;

    fn identity_count(&self) -> Result<u64, StoreError>;

    fn groups(&self) -> Result<Vec<Group>, StoreError>;

    /// Ensure every group referenced by an identity exists. Returns how many were created.
    fn migrate_groups(&self) -> Result<usize, StoreError>;

    fn append_attendance(&self, event: &AttendanceEvent) -> Result<(), StoreError>;

    /// Append `event` unless the latest event for `key` is less than `cooldown` older.
    ///
    /// The lookup and the insert run in one write transaction. Returns the
    /// blocking event when the append is refused.
    fn append_attendance_if_clear(
        &self,
        event: &AttendanceEvent,
        key: AttendanceKey<'_>,
        cooldown: Duration,
    ) -> Result<Option<AttendanceEvent>, StoreError>;

    /// Most recent event for `key` by timestamp.
    fn latest_attendance(&self, key: AttendanceKey<'_>)
        -> Result<Option<AttendanceEvent>, StoreError>;

    /// Events newest first, optionally for one name, at most `limit`.
    fn attendance_log(
        &self,
        name: Option<&str>,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<AttendanceEvent>, StoreError>;
}
