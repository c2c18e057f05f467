//! The JSON catalog of tender groups kept at the bucket root.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Well-known key of the index document.
pub const INDEX_KEY: &str = "bucket_metadata.json";

/// The whole index document.
///
/// Group ids are the map keys, so each id appears at most once.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct IndexDocument {
    /// Bucket this index describes.
    pub bucket: String,

    /// When the document was last written by a mutating helper.
    pub updated_at: DateTime<Utc>,

    /// Known groups keyed by group id.
    pub groups: BTreeMap<String, GroupRecord>,
}

impl IndexDocument {
    /// A fresh, empty index for `bucket`.
    pub fn empty(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            updated_at: Utc::now(),
            groups: BTreeMap::new(),
        }
    }

    pub fn contains(&self, group_id: &str) -> bool {
        self.groups.contains_key(group_id)
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// One tender group and its flags.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct GroupRecord {
    /// The group's publication document has been stored.
    pub publication: bool,

    /// Supplementary documents were uploaded under `{id}/documents/`.
    pub documents: bool,

    /// Caller-supplied payload, kept as untyped JSON.
    pub data: Value,
}

impl GroupRecord {
    pub fn new(publication: bool, data: Value) -> Self {
        Self {
            publication,
            documents: false,
            data,
        }
    }
}
