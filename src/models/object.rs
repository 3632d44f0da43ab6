//! Represents a committed object stored in a bucket.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A committed object. Rows only exist once an upload has been committed, so
/// anything listed here is visible to readers.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Object {
    /// Internal UUID for DB indexing.
    pub id: Uuid,

    /// Foreign key linking to the parent bucket.
    pub bucket_id: Uuid,

    /// Object key (path-like identifier within the bucket).
    pub key: String,

    /// Size in bytes.
    pub size_bytes: i64,

    /// Hex MD5 of the payload.
    pub etag: String,

    /// Names the payload file. Every commit writes a fresh one, so replacing
    /// an object never touches the bytes the current row points at.
    pub payload_id: Uuid,

    /// Timestamp of the commit that made this object visible.
    pub last_modified: DateTime<Utc>,
}
