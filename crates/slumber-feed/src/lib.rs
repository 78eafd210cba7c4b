//! Feed maintenance and querying
//!
//! Authors with fewer followers than the fan-in threshold get their records
//! copied into every follower's feed as they are posted ([`Materializer`]).
//! Records of authors at or above the threshold stay in the primary record
//! index only and are pulled in when a feed is read ([`FeedPlanner`]).
//! [`FeedStrategy`] makes the per-author decision for both sides.

mod graph;
mod materializer;
mod planner;
mod strategy;
mod window;

use std::time::Duration;

use slumber_db::DbError;
use slumber_index::IndexError;
use snafu::{Location, Snafu};

pub use self::graph::FollowGraph;
pub use self::materializer::Materializer;
pub use self::planner::{FeedPage, FeedPlanner, FeedRequest};
pub use self::strategy::{
    DEFAULT_CACHE_CAPACITY, FOLLOWER_THRESHOLD, FeedStrategy, FollowedPartition,
};
pub use self::window::TimeWindow;

const LOG_TARGET: &str = "slumber::feed";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum MaterializeError {
    #[snafu(display("Search index operation failed"))]
    MaterializeIndex {
        source: IndexError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("Follow graph lookup failed"))]
    MaterializeGraph {
        source: DbError,
        #[snafu(implicit)]
        location: Location,
    },
}
pub type MaterializeResult<T> = std::result::Result<T, MaterializeError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum FeedError {
    #[snafu(display("Follow graph lookup failed"))]
    FeedGraph {
        source: DbError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("Feed temporarily unavailable"))]
    FeedIndex {
        source: IndexError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("Feed query timed out after {timeout:?}"))]
    QueryTimeout {
        timeout: Duration,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("Malformed document {id} in index {index}"))]
    MalformedHit {
        index: String,
        id: String,
        source: serde_json::Error,
        #[snafu(implicit)]
        location: Location,
    },
}
pub type FeedResult<T> = std::result::Result<T, FeedError>;
