//! Persistence contracts for enrolled identities and the attendance ledger.

use crate::types::Embedding;
use chrono::{NaiveDate, NaiveDateTime};
use serde::Serialize;
use thiserror::Error;

/// Timestamp format used for every persisted date-time.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Attendance method recorded for face matches.
pub const METHOD_BIOMETRIC: &str = "biometric";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("identity already exists: {0}")]
    Duplicate(String),
    #[error("identity not found: {0}")]
    NotFound(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("storage backend: {0}")]
    Backend(String),
}

/// An enrolled person, as written to the identity store.
#[derive(Debug, Clone)]
pub struct IdentityRecord {
    pub identity_id: String,
    pub display_name: String,
    pub embedding: Embedding,
    pub created_at: NaiveDateTime,
}

/// An identity row as read back; the embedding is still in stored form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredIdentity {
    pub identity_id: String,
    pub display_name: String,
    pub embedding_json: String,
    pub created_at: String,
}

pub trait IdentityStore: Send + Sync {
    /// Insert a new identity. Fails with [`StoreError::Duplicate`] if the id exists.
    fn insert(&self, record: &IdentityRecord) -> Result<(), StoreError>;

    /// Atomically delete and re-insert an identity, returning the previous row.
    /// Fails with [`StoreError::NotFound`] if the id does not exist.
    fn replace(&self, record: &IdentityRecord) -> Result<StoredIdentity, StoreError>;

    /// Remove an identity, returning the deleted row, or `None` if the id did not exist.
    fn delete(&self, identity_id: &str) -> Result<Option<StoredIdentity>, StoreError>;

    /// Restore a previously read row verbatim (used to undo a replace or delete).
    fn restore(&self, row: &StoredIdentity) -> Result<(), StoreError>;

    fn list_all(&self) -> Result<Vec<StoredIdentity>, StoreError>;
}

/// One identity's attendance interval for one calendar date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttendanceRecord {
    pub record_id: i64,
    pub identity_id: String,
    pub date: NaiveDate,
    pub check_in_time: NaiveDateTime,
    /// `None` while the interval is still open.
    pub check_out_time: Option<NaiveDateTime>,
    pub method: String,
}

impl AttendanceRecord {
    /// Both ends recorded; the record accepts no further transitions.
    pub fn is_complete(&self) -> bool {
        self.check_out_time.is_some()
    }
}

/// Outcome of a check-in insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckinInsert {
    Inserted(AttendanceRecord),
    /// A record for this identity and date already existed.
    Duplicate,
}

pub trait AttendanceLedger: Send + Sync {
    fn find(&self, identity_id: &str, date: NaiveDate)
        -> Result<Option<AttendanceRecord>, StoreError>;

    /// Open a new interval. Must be backed by a uniqueness constraint on
    /// `(identity_id, date)` so concurrent inserts yield one row.
    fn insert_checkin(
        &self,
        identity_id: &str,
        date: NaiveDate,
        at: NaiveDateTime,
        method: &str,
    ) -> Result<CheckinInsert, StoreError>;

    /// Close an open interval. Returns `false` when the record was already
    /// closed (or missing); the existing check-out is never overwritten.
    fn update_checkout(&self, record_id: i64, at: NaiveDateTime) -> Result<bool, StoreError>;

    /// Records between `from` and `to` inclusive, newest first.
    fn list(
        &self,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    ) -> Result<Vec<AttendanceRecord>, StoreError>;
}
