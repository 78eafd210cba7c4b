use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use slumber_core::UserId;
use slumber_db::DbResult;
use tracing::trace;

use crate::{FollowGraph, LOG_TARGET};

/// Follower count at which an author switches to fan-in
pub const FOLLOWER_THRESHOLD: u64 = 10_000;

pub const DEFAULT_CACHE_CAPACITY: usize = 100_000;

/// Accounts a viewer follows, split by how their records reach the feed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FollowedPartition {
    /// Fan-in authors, queried at read time
    pub celebrities: Vec<UserId>,
    /// Fan-out authors, materialized into the viewer's feed
    pub regular: Vec<UserId>,
}

/// Classifications kept per author, oldest insert evicted first
struct ClassificationCache {
    capacity: usize,
    entries: HashMap<UserId, bool>,
    order: VecDeque<UserId>,
}

impl ClassificationCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&self, author_id: UserId) -> Option<bool> {
        self.entries.get(&author_id).copied()
    }

    fn insert(&mut self, author_id: UserId, fan_in: bool) {
        if self.entries.insert(author_id, fan_in).is_some() {
            return;
        }
        self.order.push_back(author_id);
        while self.capacity < self.entries.len() {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.entries.remove(&oldest);
        }
    }

    fn insert_if_absent(&mut self, author_id: UserId, fan_in: bool) {
        if !self.entries.contains_key(&author_id) {
            self.insert(author_id, fan_in);
        }
    }
}

/// Decides fan-out vs. fan-in per author
///
/// Classifications are cached per author, up to `cache_capacity` authors.
/// Follow events carry the follower count written by their transaction and
/// overwrite the cached entry through [`Self::observe`]. Counts read from
/// the graph only fill entries that are missing, so a read that raced an
/// uncommitted follow never replaces a newer observation.
pub struct FeedStrategy {
    graph: Arc<dyn FollowGraph>,
    threshold: u64,
    cache: Option<Mutex<ClassificationCache>>,
}

#[bon::bon]
impl FeedStrategy {
    #[builder(finish_fn(name = "build"))]
    pub fn new(
        graph: Arc<dyn FollowGraph>,
        #[builder(default = FOLLOWER_THRESHOLD)] threshold: u64,
        // Authors kept in the classification cache, `0` disables it
        #[builder(default = DEFAULT_CACHE_CAPACITY)]
        cache_capacity: usize,
    ) -> Self {
        Self {
            graph,
            threshold,
            cache: (0 < cache_capacity)
                .then(|| Mutex::new(ClassificationCache::new(cache_capacity))),
        }
    }
}

impl FeedStrategy {
    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    fn lock_cache(&self) -> Option<MutexGuard<'_, ClassificationCache>> {
        self.cache
            .as_ref()
            .map(|cache| cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner()))
    }

    /// Whether `count` followers make an author a fan-in author
    pub fn classify(&self, count: u64) -> bool {
        self.threshold <= count
    }

    pub async fn is_fan_in(&self, author_id: UserId) -> DbResult<bool> {
        let cached = self.lock_cache().and_then(|cache| cache.get(author_id));
        if let Some(fan_in) = cached {
            return Ok(fan_in);
        }

        let count = self.graph.follower_count(author_id).await?;
        let fan_in = self.classify(count);
        trace!(target: LOG_TARGET, %author_id, count, fan_in, "Classified author");

        if let Some(mut cache) = self.lock_cache() {
            cache.insert_if_absent(author_id, fan_in);
        }
        Ok(fan_in)
    }

    /// Record the follower count a follow change left `author_id` with
    pub fn observe(&self, author_id: UserId, follower_count: u64) -> bool {
        let fan_in = self.classify(follower_count);
        if let Some(mut cache) = self.lock_cache() {
            cache.insert(author_id, fan_in);
        }
        fan_in
    }

    /// Classify everyone `viewer_id` follows
    pub async fn partition_followed(&self, viewer_id: UserId) -> DbResult<FollowedPartition> {
        let mut partition = FollowedPartition::default();
        for followed_id in self.graph.list_followed_ids(viewer_id).await? {
            if self.is_fan_in(followed_id).await? {
                partition.celebrities.push(followed_id);
            } else {
                partition.regular.push(followed_id);
            }
        }
        Ok(partition)
    }

    pub async fn followed_celebrities(&self, viewer_id: UserId) -> DbResult<Vec<UserId>> {
        Ok(self.partition_followed(viewer_id).await?.celebrities)
    }

    pub async fn followed_regular(&self, viewer_id: UserId) -> DbResult<Vec<UserId>> {
        Ok(self.partition_followed(viewer_id).await?.regular)
    }
}
