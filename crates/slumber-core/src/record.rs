use serde::{Deserialize, Serialize};

use crate::{FollowId, RecordId, Timestamp, UserId};

/// A posted sleep record
#[cfg_attr(feature = "bincode", derive(::bincode::Encode, ::bincode::Decode))]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SleepRecord {
    pub id: RecordId,
    /// Author
    pub user_id: UserId,
    /// Seconds slept
    pub duration: u64,
    pub start_at: Timestamp,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// Directed follow edge: `follower_id` watches `followed_id`
#[cfg_attr(feature = "bincode", derive(::bincode::Encode, ::bincode::Decode))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowEdge {
    pub id: FollowId,
    pub followed_id: UserId,
    pub follower_id: UserId,
    pub created_at: Timestamp,
}
