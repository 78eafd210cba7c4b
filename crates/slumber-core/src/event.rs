//! Domain events published to the event log
//!
//! Every event is a JSON object tagged with an `event_type` field. Events are
//! partitioned by their author (the followed user for follow events) so that
//! consumers observe each author's events in publication order.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{FollowEdge, FollowId, RecordId, SleepRecord, Timestamp, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Follows,
    SleepRecords,
}

impl Topic {
    pub const ALL: [Topic; 2] = [Topic::Follows, Topic::SleepRecords];

    pub fn as_str(self) -> &'static str {
        match self {
            Topic::Follows => "follows",
            Topic::SleepRecords => "sleep_records",
        }
    }

    /// Where messages that could not be processed end up
    pub fn dead_letter(self) -> String {
        format!("{}.dead_letter", self.as_str())
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum DomainEvent {
    FollowCreated(FollowCreated),
    FollowDeleted(FollowDeleted),
    RecordCreated(RecordChanged),
    RecordUpdated(RecordChanged),
    RecordDeleted(RecordDeleted),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowCreated {
    pub id: FollowId,
    /// The followed account
    pub user_id: UserId,
    pub follower_id: UserId,
    pub created_at: Timestamp,
    /// Followed account's follower count including this follow
    pub follower_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowDeleted {
    pub id: FollowId,
    /// The followed account
    pub user_id: UserId,
    pub follower_id: UserId,
    /// Followed account's follower count after the unfollow
    pub follower_count: u64,
}

/// Full record state after a create or an update
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordChanged {
    pub id: RecordId,
    pub user_id: UserId,
    pub duration: u64,
    pub start_at: Timestamp,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    /// Author's follower count when the change was written
    pub follower_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordDeleted {
    pub id: RecordId,
    pub user_id: UserId,
}

impl RecordChanged {
    pub fn new(record: &SleepRecord, follower_count: u64) -> Self {
        Self {
            id: record.id,
            user_id: record.user_id,
            duration: record.duration,
            start_at: record.start_at,
            created_at: record.created_at,
            updated_at: record.updated_at,
            follower_count,
        }
    }

    pub fn record(&self) -> SleepRecord {
        SleepRecord {
            id: self.id,
            user_id: self.user_id,
            duration: self.duration,
            start_at: self.start_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

impl FollowCreated {
    pub fn new(edge: &FollowEdge, follower_count: u64) -> Self {
        Self {
            id: edge.id,
            user_id: edge.followed_id,
            follower_id: edge.follower_id,
            created_at: edge.created_at,
            follower_count,
        }
    }
}

impl FollowDeleted {
    pub fn new(edge: &FollowEdge, follower_count: u64) -> Self {
        Self {
            id: edge.id,
            user_id: edge.followed_id,
            follower_id: edge.follower_id,
            follower_count,
        }
    }
}

impl DomainEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            DomainEvent::FollowCreated(_) => "follow_created",
            DomainEvent::FollowDeleted(_) => "follow_deleted",
            DomainEvent::RecordCreated(_) => "record_created",
            DomainEvent::RecordUpdated(_) => "record_updated",
            DomainEvent::RecordDeleted(_) => "record_deleted",
        }
    }

    pub fn topic(&self) -> Topic {
        match self {
            DomainEvent::FollowCreated(_) | DomainEvent::FollowDeleted(_) => Topic::Follows,
            DomainEvent::RecordCreated(_)
            | DomainEvent::RecordUpdated(_)
            | DomainEvent::RecordDeleted(_) => Topic::SleepRecords,
        }
    }

    /// The author whose events must stay ordered
    pub fn partition_key(&self) -> UserId {
        match self {
            DomainEvent::FollowCreated(e) => e.user_id,
            DomainEvent::FollowDeleted(e) => e.user_id,
            DomainEvent::RecordCreated(e) | DomainEvent::RecordUpdated(e) => e.user_id,
            DomainEvent::RecordDeleted(e) => e.user_id,
        }
    }
}
