use async_trait::async_trait;
use slumber_core::{Cursor, SleepRecord, UserId};
use slumber_db::{Database, DbResult, FollowerBatch};

/// Read access to the relational follow graph
#[async_trait]
pub trait FollowGraph: Send + Sync + 'static {
    async fn follower_count(&self, user_id: UserId) -> DbResult<u64>;

    /// One batch of `user_id`'s followers, resuming after `after`
    async fn list_follower_ids(
        &self,
        user_id: UserId,
        after: Option<Cursor>,
        limit: usize,
    ) -> DbResult<FollowerBatch>;

    async fn list_followed_ids(&self, follower_id: UserId) -> DbResult<Vec<UserId>>;

    /// Every existing record of `author_id`, used for back-fills
    async fn list_records(&self, author_id: UserId) -> DbResult<Vec<SleepRecord>>;
}

#[async_trait]
impl FollowGraph for Database {
    async fn follower_count(&self, user_id: UserId) -> DbResult<u64> {
        Database::follower_count(self, user_id).await
    }

    async fn list_follower_ids(
        &self,
        user_id: UserId,
        after: Option<Cursor>,
        limit: usize,
    ) -> DbResult<FollowerBatch> {
        Database::list_follower_ids(self, user_id, after, limit).await
    }

    async fn list_followed_ids(&self, follower_id: UserId) -> DbResult<Vec<UserId>> {
        Database::list_followed_ids(self, follower_id).await
    }

    async fn list_records(&self, author_id: UserId) -> DbResult<Vec<SleepRecord>> {
        Database::list_records(self, author_id).await
    }
}
