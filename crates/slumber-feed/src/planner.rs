use std::cmp::Ordering;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use slumber_core::UserId;
use slumber_index::documents::{FeedDocument, RecordDocument};
use slumber_index::{
    FEEDS_INDEX, Filter, IndexResult, RECORDS_INDEX, SearchHits, SearchIndex, SearchQuery,
    SortField,
};
use slumber_util_error::FmtCompact as _;
use snafu::ResultExt as _;
use tracing::{debug, instrument, warn};

use crate::{
    FeedGraphSnafu, FeedIndexSnafu, FeedResult, FeedStrategy, LOG_TARGET, MalformedHitSnafu,
    QueryTimeoutSnafu, TimeWindow,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedRequest {
    pub limit: usize,
    pub offset: usize,
    pub window: Option<TimeWindow>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedPage {
    pub entries: Vec<FeedDocument>,
    /// Exact for single-source feeds; for mixed feeds the size of the merged
    /// candidate set, at most `4 * limit`
    pub total: u64,
    /// One of the sources could not be queried and was left out
    pub degraded: bool,
}

/// Feed entry order: longest sleep first, then newest, then highest id
pub fn feed_order(a: &FeedDocument, b: &FeedDocument) -> Ordering {
    b.duration
        .cmp(&a.duration)
        .then_with(|| b.created_at.cmp(&a.created_at))
        .then_with(|| b.record_id.cmp(&a.record_id))
}

fn sorted(query: SearchQuery) -> SearchQuery {
    query
        .sort_by(SortField::desc("duration"))
        .sort_by(SortField::desc("created_at"))
        .sort_by(SortField::desc("record_id"))
}

fn parse_hits<T: DeserializeOwned>(index: &str, hits: SearchHits) -> FeedResult<Vec<T>> {
    hits.hits
        .into_iter()
        .map(|hit| {
            serde_json::from_value(hit.source).context(MalformedHitSnafu {
                index,
                id: hit.id,
            })
        })
        .collect()
}

/// Merge candidates from both sources and cut out the requested page
///
/// A record found by both sources is kept once, in its most recently
/// updated form.
fn merge_page(
    mut candidates: Vec<FeedDocument>,
    offset: usize,
    limit: usize,
) -> (Vec<FeedDocument>, u64) {
    candidates.sort_by(|a, b| {
        a.record_id
            .cmp(&b.record_id)
            .then_with(|| b.updated_at.cmp(&a.updated_at))
    });
    candidates.dedup_by_key(|doc| doc.record_id);
    candidates.sort_by(feed_order);
    let total = candidates.len() as u64;
    let entries = candidates.into_iter().skip(offset).take(limit).collect();
    (entries, total)
}

/// Answers feed reads by combining materialized and on-demand results
pub struct FeedPlanner {
    index: Arc<dyn SearchIndex>,
    strategy: Arc<FeedStrategy>,
    query_timeout: Duration,
}

#[bon::bon]
impl FeedPlanner {
    #[builder(finish_fn(name = "build"))]
    pub fn new(
        index: Arc<dyn SearchIndex>,
        strategy: Arc<FeedStrategy>,
        #[builder(default = Duration::from_secs(3))] query_timeout: Duration,
    ) -> Self {
        Self {
            index,
            strategy,
            query_timeout,
        }
    }
}

impl FeedPlanner {
    #[instrument(skip_all, fields(%viewer_id, limit = req.limit, offset = req.offset))]
    pub async fn get_feed(&self, viewer_id: UserId, req: &FeedRequest) -> FeedResult<FeedPage> {
        let followed = self
            .strategy
            .partition_followed(viewer_id)
            .await
            .context(FeedGraphSnafu)?;

        if followed.celebrities.is_empty() {
            let (entries, total) = self
                .fan_out_query(viewer_id, None, req.window, req.offset, req.limit)
                .await?;
            return Ok(FeedPage {
                entries,
                total,
                degraded: false,
            });
        }

        if followed.regular.is_empty() {
            let (entries, total) = self
                .fan_in_query(viewer_id, &followed.celebrities, req.window, req.offset, req.limit)
                .await?;
            return Ok(FeedPage {
                entries,
                total,
                degraded: false,
            });
        }

        let candidates = req.limit.saturating_mul(2);
        let (fan_out, fan_in) = tokio::join!(
            self.fan_out_query(
                viewer_id,
                Some(followed.regular.as_slice()),
                req.window,
                0,
                candidates,
            ),
            self.fan_in_query(viewer_id, &followed.celebrities, req.window, 0, candidates),
        );

        let (merged, degraded) = match (fan_out, fan_in) {
            (Ok((mut fan_out, _)), Ok((fan_in, _))) => {
                fan_out.extend(fan_in);
                (fan_out, false)
            }
            (Ok((fan_out, _)), Err(err)) => {
                warn!(target: LOG_TARGET, err = %err.fmt_compact(), "Fan-in query failed, serving fan-out entries only");
                (fan_out, true)
            }
            (Err(err), Ok((fan_in, _))) => {
                warn!(target: LOG_TARGET, err = %err.fmt_compact(), "Fan-out query failed, serving fan-in entries only");
                (fan_in, true)
            }
            (Err(err), Err(fan_in_err)) => {
                warn!(target: LOG_TARGET, err = %fan_in_err.fmt_compact(), "Fan-in query failed");
                return Err(err);
            }
        };

        let (entries, total) = merge_page(merged, req.offset, req.limit);
        debug!(target: LOG_TARGET, total, degraded, "Merged mixed feed");
        Ok(FeedPage {
            entries,
            total,
            degraded,
        })
    }

    async fn with_timeout(
        &self,
        fut: impl Future<Output = IndexResult<SearchHits>>,
    ) -> FeedResult<SearchHits> {
        match tokio::time::timeout(self.query_timeout, fut).await {
            Ok(res) => res.context(FeedIndexSnafu),
            Err(_) => QueryTimeoutSnafu {
                timeout: self.query_timeout,
            }
            .fail(),
        }
    }

    /// The viewer's materialized feed documents, optionally only those of
    /// `authors`
    async fn fan_out_query(
        &self,
        viewer_id: UserId,
        authors: Option<&[UserId]>,
        window: Option<TimeWindow>,
        from: usize,
        size: usize,
    ) -> FeedResult<(Vec<FeedDocument>, u64)> {
        let mut query = SearchQuery::new().filter(Filter::term("user_id", viewer_id.as_u64()));
        // Documents written before an author turned fan-in outlive the switch
        if let Some(authors) = authors {
            query = query.filter(Filter::terms(
                "author_id",
                authors.iter().map(|id| id.as_u64()),
            ));
        }
        if let Some(window) = window {
            query = query.filter(window.to_filter());
        }
        let query = sorted(query).page(from, size);
        let hits = self
            .with_timeout(self.index.search(FEEDS_INDEX, &query))
            .await?;
        let total = hits.total;
        Ok((parse_hits(FEEDS_INDEX, hits)?, total))
    }

    /// Records of the given authors, straight from the primary index,
    /// presented as entries of the viewer's feed
    async fn fan_in_query(
        &self,
        viewer_id: UserId,
        authors: &[UserId],
        window: Option<TimeWindow>,
        from: usize,
        size: usize,
    ) -> FeedResult<(Vec<FeedDocument>, u64)> {
        let mut query = SearchQuery::new().filter(Filter::terms(
            "user_id",
            authors.iter().map(|id| id.as_u64()),
        ));
        if let Some(window) = window {
            query = query.filter(window.to_filter());
        }
        let query = sorted(query).page(from, size);
        let hits = self
            .with_timeout(self.index.search(RECORDS_INDEX, &query))
            .await?;
        let total = hits.total;
        let entries = parse_hits::<RecordDocument>(RECORDS_INDEX, hits)?
            .into_iter()
            .map(|doc| FeedDocument::relabel(doc, viewer_id))
            .collect();
        Ok((entries, total))
    }
}
