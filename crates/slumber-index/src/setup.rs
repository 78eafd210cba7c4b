use serde_json::{Value, json};
use tracing::info;

use crate::{IndexResult, LOG_TARGET, SearchIndex};

/// Primary record collection
pub const RECORDS_INDEX: &str = "sleep_records";
/// Materialized per-follower feeds
pub const FEEDS_INDEX: &str = "feeds";

/// Settings and mappings used when creating an index
#[derive(Debug, Clone, PartialEq)]
pub struct IndexMapping(pub Value);

impl IndexMapping {
    pub fn records() -> Self {
        Self(json!({
            "settings": { "number_of_shards": 1, "number_of_replicas": 0 },
            "mappings": {
                "properties": {
                    "id": { "type": "keyword" },
                    "user_id": { "type": "long" },
                    "record_id": { "type": "long" },
                    "duration": { "type": "long" },
                    "start_at": { "type": "date" },
                    "created_at": { "type": "date" },
                    "updated_at": { "type": "date" },
                }
            }
        }))
    }

    pub fn feeds() -> Self {
        Self(json!({
            "settings": { "number_of_shards": 1, "number_of_replicas": 0 },
            "mappings": {
                "properties": {
                    "id": { "type": "keyword" },
                    "user_id": { "type": "long" },
                    "author_id": { "type": "long" },
                    "record_id": { "type": "long" },
                    "duration": { "type": "long" },
                    "start_at": { "type": "date" },
                    "created_at": { "type": "date" },
                    "updated_at": { "type": "date" },
                }
            }
        }))
    }
}

/// Create both collections if missing
///
/// With `recreate`, existing collections are dropped first, losing all
/// materialized state.
pub async fn ensure_indices(index: &dyn SearchIndex, recreate: bool) -> IndexResult<()> {
    for (name, mapping) in [
        (RECORDS_INDEX, IndexMapping::records()),
        (FEEDS_INDEX, IndexMapping::feeds()),
    ] {
        if recreate && index.delete_index(name).await? {
            info!(target: LOG_TARGET, index = name, "Deleted index");
        }
        if index.index_exists(name).await? {
            continue;
        }
        index.create_index(name, &mapping).await?;
        info!(target: LOG_TARGET, index = name, "Created index");
    }
    Ok(())
}
