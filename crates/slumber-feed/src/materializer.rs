use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use slumber_core::event::{DomainEvent, FollowCreated, FollowDeleted, RecordChanged, RecordDeleted};
use slumber_core::SleepRecord;
use slumber_db::FollowerBatch;
use slumber_index::documents::{FeedDocument, RecordDocument, record_patch};
use slumber_index::{
    FEEDS_INDEX, Filter, IndexResult, PatchOutcome, RECORDS_INDEX, SearchIndex, SearchQuery,
};
use slumber_log::EventHandler;
use slumber_util_error::BoxedErrorResult;
use snafu::ResultExt as _;
use tracing::{debug, trace};

use crate::{
    FeedStrategy, FollowGraph, LOG_TARGET, MaterializeGraphSnafu, MaterializeIndexSnafu,
    MaterializeResult,
};

const MIN_FAN_OUT_BATCH: usize = 100;
const MAX_FAN_OUT_BATCH: usize = 1000;

/// Followers fetched (and documents written) per fan-out round
pub fn fan_out_batch_size(follower_count: u64) -> usize {
    usize::try_from(follower_count / 10)
        .unwrap_or(MAX_FAN_OUT_BATCH)
        .clamp(MIN_FAN_OUT_BATCH, MAX_FAN_OUT_BATCH)
}

/// Keeps the search index in step with the relational store
///
/// The primary record index is always maintained. Feed documents are only
/// written for fan-out authors.
pub struct Materializer {
    index: Arc<dyn SearchIndex>,
    graph: Arc<dyn FollowGraph>,
    strategy: Arc<FeedStrategy>,
    delete_window: usize,
}

#[bon::bon]
impl Materializer {
    #[builder(finish_fn(name = "build"))]
    pub fn new(
        index: Arc<dyn SearchIndex>,
        graph: Arc<dyn FollowGraph>,
        strategy: Arc<FeedStrategy>,
        // Documents fetched per round when deleting by search
        #[builder(default = 1000)]
        delete_window: usize,
    ) -> Self {
        Self {
            index,
            graph,
            strategy,
            delete_window: delete_window.max(1),
        }
    }
}

impl Materializer {
    pub async fn apply(&self, event: &DomainEvent) -> MaterializeResult<()> {
        trace!(target: LOG_TARGET, event_type = event.event_type(), "Materializing event");
        match event {
            DomainEvent::RecordCreated(e) => self.on_record_created(e).await,
            DomainEvent::RecordUpdated(e) => self.on_record_updated(e).await,
            DomainEvent::RecordDeleted(e) => self.on_record_deleted(e).await,
            DomainEvent::FollowCreated(e) => self.on_follow_created(e).await,
            DomainEvent::FollowDeleted(e) => self.on_follow_deleted(e).await,
        }
    }

    async fn on_record_created(&self, e: &RecordChanged) -> MaterializeResult<()> {
        let record = e.record();
        self.index
            .index_document(
                RECORDS_INDEX,
                &RecordDocument::doc_id(record.id),
                RecordDocument::from(&record)
                    .to_json()
                    .context(MaterializeIndexSnafu)?,
            )
            .await
            .context(MaterializeIndexSnafu)?;

        if self.strategy.classify(e.follower_count) {
            debug!(target: LOG_TARGET, author_id = %record.user_id, record_id = %record.id, "Fan-in author, skipping fan-out");
            return Ok(());
        }
        self.fan_out(&record, e.follower_count).await
    }

    /// Write a feed document for every current follower of the author
    async fn fan_out(&self, record: &SleepRecord, follower_count: u64) -> MaterializeResult<()> {
        let batch = fan_out_batch_size(follower_count);

        let mut after = None;
        let mut written = 0;
        loop {
            let FollowerBatch { ids: follower_ids, next } = self
                .graph
                .list_follower_ids(record.user_id, after, batch)
                .await
                .context(MaterializeGraphSnafu)?;
            if follower_ids.is_empty() {
                break;
            }
            written += follower_ids.len();

            let docs = follower_ids
                .iter()
                .map(|follower_id| -> IndexResult<(String, Value)> {
                    let doc = FeedDocument::new(record, *follower_id);
                    Ok((doc.id.clone(), doc.to_json()?))
                })
                .collect::<IndexResult<Vec<_>>>()
                .context(MaterializeIndexSnafu)?;
            self.index
                .bulk_index(FEEDS_INDEX, docs)
                .await
                .context(MaterializeIndexSnafu)?;

            match next {
                Some(next) => after = Some(next),
                None => break,
            }
        }
        debug!(target: LOG_TARGET, author_id = %record.user_id, record_id = %record.id, followers = written, "Fanned out record");
        Ok(())
    }

    async fn on_record_updated(&self, e: &RecordChanged) -> MaterializeResult<()> {
        let record = e.record();
        let patch = record_patch(&record);

        let outcome = self
            .index
            .update_document(RECORDS_INDEX, &RecordDocument::doc_id(record.id), &patch)
            .await
            .context(MaterializeIndexSnafu)?;
        match outcome {
            PatchOutcome::Updated => {}
            PatchOutcome::Stale => {
                debug!(target: LOG_TARGET, record_id = %record.id, "Ignoring stale record update");
                return Ok(());
            }
            PatchOutcome::Missing => {
                self.index
                    .index_document(
                        RECORDS_INDEX,
                        &RecordDocument::doc_id(record.id),
                        RecordDocument::from(&record)
                            .to_json()
                            .context(MaterializeIndexSnafu)?,
                    )
                    .await
                    .context(MaterializeIndexSnafu)?;
            }
        }

        if self.strategy.classify(e.follower_count) {
            return Ok(());
        }

        let batch = fan_out_batch_size(e.follower_count);
        let mut after = None;
        loop {
            let FollowerBatch { ids: follower_ids, next } = self
                .graph
                .list_follower_ids(record.user_id, after, batch)
                .await
                .context(MaterializeGraphSnafu)?;

            for follower_id in &follower_ids {
                // Followers without a document joined after the record was
                // posted and are back-filled from the current state anyway
                self.index
                    .update_document(
                        FEEDS_INDEX,
                        &FeedDocument::doc_id(record.id, *follower_id),
                        &patch,
                    )
                    .await
                    .context(MaterializeIndexSnafu)?;
            }

            match next {
                Some(next) => after = Some(next),
                None => break,
            }
        }
        Ok(())
    }

    async fn on_record_deleted(&self, e: &RecordDeleted) -> MaterializeResult<()> {
        self.index
            .delete_document(RECORDS_INDEX, &RecordDocument::doc_id(e.id))
            .await
            .context(MaterializeIndexSnafu)?;

        if self
            .strategy
            .is_fan_in(e.user_id)
            .await
            .context(MaterializeGraphSnafu)?
        {
            return Ok(());
        }

        let deleted = self
            .delete_feed_documents(SearchQuery::new().filter(Filter::term("record_id", e.id.as_u64())))
            .await?;
        debug!(target: LOG_TARGET, record_id = %e.id, deleted, "Removed record from feeds");
        Ok(())
    }

    async fn on_follow_created(&self, e: &FollowCreated) -> MaterializeResult<()> {
        if self.strategy.observe(e.user_id, e.follower_count) {
            return Ok(());
        }

        let records = self
            .graph
            .list_records(e.user_id)
            .await
            .context(MaterializeGraphSnafu)?;
        for chunk in records.chunks(MAX_FAN_OUT_BATCH) {
            let docs = chunk
                .iter()
                .map(|record| -> IndexResult<(String, Value)> {
                    let doc = FeedDocument::new(record, e.follower_id);
                    Ok((doc.id.clone(), doc.to_json()?))
                })
                .collect::<IndexResult<Vec<_>>>()
                .context(MaterializeIndexSnafu)?;
            self.index
                .bulk_index(FEEDS_INDEX, docs)
                .await
                .context(MaterializeIndexSnafu)?;
        }
        debug!(target: LOG_TARGET, author_id = %e.user_id, follower_id = %e.follower_id, records = records.len(), "Back-filled feed");
        Ok(())
    }

    async fn on_follow_deleted(&self, e: &FollowDeleted) -> MaterializeResult<()> {
        if self.strategy.observe(e.user_id, e.follower_count) {
            return Ok(());
        }

        let deleted = self
            .delete_feed_documents(
                SearchQuery::new()
                    .filter(Filter::term("user_id", e.follower_id.as_u64()))
                    .filter(Filter::term("author_id", e.user_id.as_u64())),
            )
            .await?;
        debug!(target: LOG_TARGET, author_id = %e.user_id, follower_id = %e.follower_id, deleted, "Removed author from feed");
        Ok(())
    }

    /// Delete every feed document matching `query`, one window at a time
    ///
    /// The index is refreshed before every search, so documents deleted in
    /// the previous round no longer fill the window. A round that brings
    /// back nothing but already attempted ids ends the walk.
    async fn delete_feed_documents(&self, query: SearchQuery) -> MaterializeResult<usize> {
        let query = query.page(0, self.delete_window);
        let mut attempted = HashSet::new();
        let mut total = 0;
        loop {
            self.index
                .refresh(FEEDS_INDEX)
                .await
                .context(MaterializeIndexSnafu)?;
            let hits = self
                .index
                .search(FEEDS_INDEX, &query)
                .await
                .context(MaterializeIndexSnafu)?;

            let mut fresh = 0;
            for hit in &hits.hits {
                if !attempted.insert(hit.id.clone()) {
                    continue;
                }
                fresh += 1;
                if self
                    .index
                    .delete_document(FEEDS_INDEX, &hit.id)
                    .await
                    .context(MaterializeIndexSnafu)?
                {
                    total += 1;
                }
            }

            if hits.hits.len() < self.delete_window || fresh == 0 {
                return Ok(total);
            }
        }
    }
}

#[async_trait]
impl EventHandler for Materializer {
    async fn handle_event(&self, event: &DomainEvent) -> BoxedErrorResult<()> {
        Ok(self.apply(event).await?)
    }
}
