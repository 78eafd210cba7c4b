//! Shapes of the documents stored in the index collections

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use slumber_core::{RecordId, SleepRecord, Timestamp, UserId};
use snafu::ResultExt as _;

use crate::{DocumentPatch, IndexResult, JsonSnafu};

/// Entry of the primary record collection, one per record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordDocument {
    pub id: RecordId,
    /// Author
    pub user_id: UserId,
    pub record_id: RecordId,
    pub duration: u64,
    pub start_at: Timestamp,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// Entry of the feed collection, one per (record, follower)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedDocument {
    /// `<record_id>_<viewer_id>`
    pub id: String,
    /// The viewer whose feed this belongs to
    pub user_id: UserId,
    pub author_id: UserId,
    pub record_id: RecordId,
    pub duration: u64,
    pub start_at: Timestamp,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl RecordDocument {
    pub fn doc_id(record_id: RecordId) -> String {
        record_id.to_string()
    }

    pub fn to_json(&self) -> IndexResult<Value> {
        serde_json::to_value(self).context(JsonSnafu)
    }
}

impl From<&SleepRecord> for RecordDocument {
    fn from(record: &SleepRecord) -> Self {
        Self {
            id: record.id,
            user_id: record.user_id,
            record_id: record.id,
            duration: record.duration,
            start_at: record.start_at,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

impl FeedDocument {
    pub fn doc_id(record_id: RecordId, viewer_id: UserId) -> String {
        format!("{record_id}_{viewer_id}")
    }

    pub fn new(record: &SleepRecord, viewer_id: UserId) -> Self {
        Self {
            id: Self::doc_id(record.id, viewer_id),
            user_id: viewer_id,
            author_id: record.user_id,
            record_id: record.id,
            duration: record.duration,
            start_at: record.start_at,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }

    /// Present a primary-collection hit as if it were in `viewer_id`'s feed
    pub fn relabel(doc: RecordDocument, viewer_id: UserId) -> Self {
        Self {
            id: Self::doc_id(doc.record_id, viewer_id),
            user_id: viewer_id,
            author_id: doc.user_id,
            record_id: doc.record_id,
            duration: doc.duration,
            start_at: doc.start_at,
            created_at: doc.created_at,
            updated_at: doc.updated_at,
        }
    }

    pub fn to_json(&self) -> IndexResult<Value> {
        serde_json::to_value(self).context(JsonSnafu)
    }
}

/// The mutable fields of a record, guarded by `updated_at`
pub fn record_patch(record: &SleepRecord) -> DocumentPatch {
    let mut doc = Map::new();
    doc.insert("duration".into(), record.duration.into());
    doc.insert("start_at".into(), record.start_at.to_string().into());
    doc.insert("updated_at".into(), record.updated_at.to_string().into());
    DocumentPatch {
        doc,
        guard: Some(("updated_at".into(), record.updated_at.to_string().into())),
    }
}
