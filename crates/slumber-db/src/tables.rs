use bincode::{Decode, Encode};
use slumber_core::{FollowEdge, FollowId, RecordId, SleepRecord, Timestamp, UserId};

#[macro_export]
macro_rules! def_table {
    ($(#[$outer:meta])*
        $name:ident : $k:ty => $v:ty) => {
        #[allow(unused)]
        $(#[$outer])*
        pub mod $name {
            use super::*;
            pub type Key = $k;
            pub type Value = $v;
            pub type Definition<'a> = redb_bincode::TableDefinition<'a, Key, Value>;
            pub trait ReadableTable: redb_bincode::ReadableTable<Key, Value> {}
            impl<RT> ReadableTable for RT where RT: redb_bincode::ReadableTable<Key, Value> {}
            pub type Table<'a> = redb_bincode::Table<'a, Key, Value>;
            pub const TABLE: Definition = redb_bincode::TableDefinition::new(stringify!($name));
        }
    };
}

def_table! {
    /// Tracks database/schema version
    db_version: () => u64
}

def_table! {
    /// Last allocated id of each kind
    id_sequences: IdSequence => u64
}

// USERS
def_table!(users: UserId => UserRecord);

// FOLLOWS
def_table!(follows: FollowId => FollowEdge);
def_table! {
    /// Uniqueness of `(followed, follower)`
    follows_by_pair: (UserId, UserId) => FollowId
}
def_table! {
    /// `(followed, created_at, follow_id) => follower`, the followers listing
    follows_followers: (UserId, Timestamp, FollowId) => UserId
}
def_table! {
    /// `(follower, created_at, follow_id) => followed`, the following listing
    follows_following: (UserId, Timestamp, FollowId) => UserId
}
def_table! {
    /// Maintained on every follow/unfollow so classification never scans
    follower_counts: UserId => u64
}

// RECORDS
def_table!(records: RecordId => SleepRecord);
def_table!(records_by_author: (UserId, RecordId) => ());

#[derive(Debug, Encode, Decode, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum IdSequence {
    Users,
    Follows,
    Records,
}

#[derive(Debug, Encode, Decode, Clone, Copy, PartialEq, Eq)]
pub struct UserRecord {
    pub created_at: Timestamp,
}
