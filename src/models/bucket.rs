//! A bucket: the top-level namespace objects are committed into.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A bucket inside a local project.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Bucket {
    /// Unique identifier for this bucket (UUID for internal DB use).
    pub id: Uuid,

    /// Bucket name, unique within the project.
    pub name: String,

    /// When this bucket was first ensured.
    pub created_at: DateTime<Utc>,
}
