//! Descriptive metadata carried from the video source onto the stored object.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::BTreeMap;
use uuid::Uuid;

pub const KEY_TITLE: &str = "OriginalTitle";
pub const KEY_AUTHOR: &str = "Author";
pub const KEY_UPLOAD_DATE: &str = "UploadDate";
pub const KEY_URL: &str = "URL";

/// Custom metadata as attached to an upload sink.
pub type CustomMetadata = BTreeMap<String, String>;

/// Fields describing the source video, filled once from the extractor.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct TransferMetadata {
    pub title: String,
    pub author: String,
    /// ISO date, `YYYY-MM-DD`.
    pub publish_date: String,
    pub source_url: String,
}

impl TransferMetadata {
    /// Map onto the fixed, case-sensitive key names stored with every object.
    pub fn to_custom_metadata(&self) -> CustomMetadata {
        BTreeMap::from([
            (KEY_TITLE.to_string(), self.title.clone()),
            (KEY_AUTHOR.to_string(), self.author.clone()),
            (KEY_UPLOAD_DATE.to_string(), self.publish_date.clone()),
            (KEY_URL.to_string(), self.source_url.clone()),
        ])
    }
}

/// A single key-value row attached to a committed object.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct ObjectMetadata {
    /// Reference to the associated object.
    pub object_id: Uuid,

    /// Metadata key (e.g. "OriginalTitle").
    pub key: String,

    /// Metadata value as plain text.
    pub value: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uses_fixed_key_names() {
        let meta = TransferMetadata {
            title: "T".into(),
            author: "A".into(),
            publish_date: "2023-01-01".into(),
            source_url: "u".into(),
        };
        let map = meta.to_custom_metadata();
        assert_eq!(map.len(), 4);
        assert_eq!(map["OriginalTitle"], "T");
        assert_eq!(map["Author"], "A");
        assert_eq!(map["UploadDate"], "2023-01-01");
        assert_eq!(map["URL"], "u");
    }
}
