use redb_bincode::ReadableTable as _;
use slumber_core::event::{DomainEvent, FollowCreated, FollowDeleted};
use slumber_core::{Cursor, FollowEdge, FollowId, Timestamp, UserId, next_cursor};
use snafu::{OptionExt as _, ensure};
use tracing::debug;

use crate::{
    AlreadyFollowingSnafu, Database, DbResult, IdSequence, LOG_TARGET, NotFollowingSnafu,
    OverflowSnafu, SelfFollowSnafu, follower_counts, follows, follows_by_pair, follows_followers,
    follows_following, id_sequences, users,
};

pub const DEFAULT_PAGE_SIZE: usize = 20;
pub const MAX_PAGE_SIZE: usize = 100;

/// Requested page size to the one actually served
///
/// Anything above [`MAX_PAGE_SIZE`] is capped, anything below 1 (or absent)
/// falls back to [`DEFAULT_PAGE_SIZE`].
pub fn clamp_page_size(limit: Option<i64>) -> usize {
    match limit {
        Some(limit) if 1 <= limit => usize::try_from(limit)
            .unwrap_or(MAX_PAGE_SIZE)
            .min(MAX_PAGE_SIZE),
        _ => DEFAULT_PAGE_SIZE,
    }
}

/// One row of a followers/following listing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FollowListItem {
    pub follow_id: FollowId,
    /// The follower (followers listing) or the followed user (following
    /// listing)
    pub user_id: UserId,
    pub created_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FollowPage {
    pub items: Vec<FollowListItem>,
    pub next_cursor: Option<String>,
}

/// One batch of follower ids
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FollowerBatch {
    pub ids: Vec<UserId>,
    /// Where the next batch starts, absent after the last one
    pub next: Option<Cursor>,
}

fn follow_partition(user_id: UserId) -> std::ops::RangeInclusive<(UserId, Timestamp, FollowId)> {
    (user_id, Timestamp::ZERO, FollowId::ZERO)..=(user_id, Timestamp::MAX, FollowId::MAX)
}

impl Database {
    pub(crate) fn next_id_tx(
        seq: IdSequence,
        id_sequences_table: &mut id_sequences::Table,
    ) -> DbResult<u64> {
        let next = id_sequences_table
            .get(&seq)?
            .map(|g| g.value())
            .unwrap_or_default()
            .checked_add(1)
            .context(OverflowSnafu)?;
        id_sequences_table.insert(&seq, &next)?;
        Ok(next)
    }

    /// `follower_id` starts following `followed_id`
    pub async fn create_follow(
        &self,
        follower_id: UserId,
        followed_id: UserId,
    ) -> DbResult<FollowEdge> {
        let edge = self
            .write_and_publish(|tx| {
                let users_table = tx.open_table(&users::TABLE)?;
                Self::ensure_user_tx(followed_id, &users_table)?;
                Self::ensure_user_tx(follower_id, &users_table)?;
                ensure!(follower_id != followed_id, SelfFollowSnafu);

                let mut by_pair_table = tx.open_table(&follows_by_pair::TABLE)?;
                ensure!(
                    by_pair_table.get(&(followed_id, follower_id))?.is_none(),
                    AlreadyFollowingSnafu
                );

                let id = FollowId::new(Self::next_id_tx(
                    IdSequence::Follows,
                    &mut tx.open_table(&id_sequences::TABLE)?,
                )?);
                let edge = FollowEdge {
                    id,
                    followed_id,
                    follower_id,
                    created_at: Timestamp::now(),
                };

                tx.open_table(&follows::TABLE)?.insert(&id, &edge)?;
                by_pair_table.insert(&(followed_id, follower_id), &id)?;
                tx.open_table(&follows_followers::TABLE)?
                    .insert(&(followed_id, edge.created_at, id), &follower_id)?;
                tx.open_table(&follows_following::TABLE)?
                    .insert(&(follower_id, edge.created_at, id), &followed_id)?;

                let mut counts_table = tx.open_table(&follower_counts::TABLE)?;
                let count = counts_table
                    .get(&followed_id)?
                    .map(|g| g.value())
                    .unwrap_or_default();
                let count = count + 1;
                counts_table.insert(&followed_id, &count)?;

                tx.stage_event(DomainEvent::FollowCreated(FollowCreated::new(&edge, count)));
                Ok(edge)
            })
            .await?;

        debug!(target: LOG_TARGET, %follower_id, %followed_id, follow_id = %edge.id, "Follow created");
        Ok(edge)
    }

    /// `follower_id` stops following `followed_id`
    pub async fn delete_follow(
        &self,
        follower_id: UserId,
        followed_id: UserId,
    ) -> DbResult<FollowEdge> {
        let edge = self
            .write_and_publish(|tx| {
                let users_table = tx.open_table(&users::TABLE)?;
                Self::ensure_user_tx(followed_id, &users_table)?;
                Self::ensure_user_tx(follower_id, &users_table)?;

                let mut by_pair_table = tx.open_table(&follows_by_pair::TABLE)?;
                let id = by_pair_table
                    .remove(&(followed_id, follower_id))?
                    .map(|g| g.value())
                    .context(NotFollowingSnafu)?;

                let edge = tx
                    .open_table(&follows::TABLE)?
                    .remove(&id)?
                    .map(|g| g.value())
                    .context(NotFollowingSnafu)?;

                tx.open_table(&follows_followers::TABLE)?
                    .remove(&(followed_id, edge.created_at, id))?;
                tx.open_table(&follows_following::TABLE)?
                    .remove(&(follower_id, edge.created_at, id))?;

                let mut counts_table = tx.open_table(&follower_counts::TABLE)?;
                let count = counts_table
                    .get(&followed_id)?
                    .map(|g| g.value())
                    .unwrap_or_default();
                let count = count.saturating_sub(1);
                counts_table.insert(&followed_id, &count)?;

                tx.stage_event(DomainEvent::FollowDeleted(FollowDeleted::new(&edge, count)));
                Ok(edge)
            })
            .await?;

        debug!(target: LOG_TARGET, %follower_id, %followed_id, follow_id = %edge.id, "Follow deleted");
        Ok(edge)
    }

    /// Users following `user_id`, newest follow first
    pub async fn list_followers(
        &self,
        user_id: UserId,
        cursor: Option<Cursor>,
        limit: usize,
    ) -> DbResult<FollowPage> {
        self.read_with(|tx| {
            Self::ensure_user_tx(user_id, &tx.open_table(&users::TABLE)?)?;
            let table = tx.open_table(&follows_followers::TABLE)?;
            Self::list_follows_tx(user_id, &table, cursor, limit)
        })
        .await
    }

    /// Users `user_id` follows, newest follow first
    pub async fn list_following(
        &self,
        user_id: UserId,
        cursor: Option<Cursor>,
        limit: usize,
    ) -> DbResult<FollowPage> {
        self.read_with(|tx| {
            Self::ensure_user_tx(user_id, &tx.open_table(&users::TABLE)?)?;
            let table = tx.open_table(&follows_following::TABLE)?;
            Self::list_follows_tx(user_id, &table, cursor, limit)
        })
        .await
    }

    fn list_follows_tx(
        user_id: UserId,
        table: &impl follows_followers::ReadableTable,
        cursor: Option<Cursor>,
        limit: usize,
    ) -> DbResult<FollowPage> {
        let items = Self::paginate_table_partition_rev(
            table,
            follow_partition(user_id),
            |c: Cursor| (user_id, c.created_at, FollowId::new(c.id)),
            cursor,
            limit,
            |(_, created_at, follow_id), other| {
                Ok(Some(FollowListItem {
                    follow_id,
                    user_id: other,
                    created_at,
                }))
            },
        )?;
        let next_cursor = next_cursor(&items, limit, |item| {
            Cursor::new(item.created_at, item.follow_id)
        });
        Ok(FollowPage { items, next_cursor })
    }

    pub async fn follower_count(&self, user_id: UserId) -> DbResult<u64> {
        self.read_with(|tx| {
            Ok(tx
                .open_table(&follower_counts::TABLE)?
                .get(&user_id)?
                .map(|g| g.value())
                .unwrap_or_default())
        })
        .await
    }

    /// A batch of `user_id`'s followers, oldest follow first
    ///
    /// Batches are keyed by the last follow returned, so walking all of them
    /// costs one range scan per batch regardless of how far in it is.
    pub async fn list_follower_ids(
        &self,
        user_id: UserId,
        after: Option<Cursor>,
        limit: usize,
    ) -> DbResult<FollowerBatch> {
        self.read_with(|tx| {
            let rows = Self::paginate_table_partition(
                &tx.open_table(&follows_followers::TABLE)?,
                follow_partition(user_id),
                |c: Cursor| (user_id, c.created_at, FollowId::new(c.id)),
                after,
                limit,
                |(_, created_at, follow_id), follower_id| {
                    Ok(Some((Cursor::new(created_at, follow_id), follower_id)))
                },
            )?;
            let next = (0 < limit && rows.len() == limit)
                .then(|| rows.last().map(|(cursor, _)| *cursor))
                .flatten();
            Ok(FollowerBatch {
                ids: rows.into_iter().map(|(_, follower_id)| follower_id).collect(),
                next,
            })
        })
        .await
    }

    /// Everyone `follower_id` follows
    pub async fn list_followed_ids(&self, follower_id: UserId) -> DbResult<Vec<UserId>> {
        self.read_with(|tx| {
            Ok(tx
                .open_table(&follows_following::TABLE)?
                .range(follow_partition(follower_id))?
                .map(|res| res.map(|(_, v)| v.value()))
                .collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    pub async fn is_following(&self, follower_id: UserId, followed_id: UserId) -> DbResult<bool> {
        self.read_with(|tx| {
            Ok(tx
                .open_table(&follows_by_pair::TABLE)?
                .get(&(followed_id, follower_id))?
                .is_some())
        })
        .await
    }
}
