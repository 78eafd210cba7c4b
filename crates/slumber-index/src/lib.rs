//! Search index access
//!
//! The search engine is an external document store with term/range filters
//! and field sorting. [`SearchIndex`] is the narrow interface the rest of the
//! system uses; [`ElasticsearchIndex`] talks to a real cluster over HTTP and
//! [`MemoryIndex`] evaluates the same query model in-process.

pub mod documents;
mod elasticsearch;
mod memory;
pub mod query;
pub mod setup;

use async_trait::async_trait;
use snafu::{Location, Snafu};

pub use self::elasticsearch::ElasticsearchIndex;
pub use self::memory::MemoryIndex;
pub use self::query::{
    DocumentPatch, Filter, Hit, PatchOutcome, SearchHits, SearchQuery, SortField, SortOrder,
};
pub use self::setup::{FEEDS_INDEX, IndexMapping, RECORDS_INDEX};

const LOG_TARGET: &str = "slumber::index";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum IndexError {
    #[snafu(display("Index {index} does not exist"))]
    IndexNotFound {
        index: String,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("Index {index} already exists"))]
    IndexExists {
        index: String,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("Search engine unavailable: {message}"))]
    Unavailable {
        message: String,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("HTTP request failed"))]
    Http {
        source: reqwest::Error,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("Search engine returned {status}: {body}"))]
    Status {
        status: u16,
        body: String,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("Bulk request rejected {failed} of {total} documents"))]
    BulkRejected {
        failed: usize,
        total: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("Malformed search engine response: {message}"))]
    MalformedResponse {
        message: String,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("Invalid search engine URL"))]
    InvalidUrl {
        source: url::ParseError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("Document serialization failed"))]
    Json {
        source: serde_json::Error,
        #[snafu(implicit)]
        location: Location,
    },
}
pub type IndexResult<T> = std::result::Result<T, IndexError>;

#[async_trait]
pub trait SearchIndex: Send + Sync + 'static {
    async fn create_index(&self, index: &str, mapping: &IndexMapping) -> IndexResult<()>;

    async fn index_exists(&self, index: &str) -> IndexResult<bool>;

    /// Returns `false` if there was nothing to delete
    async fn delete_index(&self, index: &str) -> IndexResult<bool>;

    /// Insert or fully replace the document `id`
    async fn index_document(
        &self,
        index: &str,
        id: &str,
        doc: serde_json::Value,
    ) -> IndexResult<()>;

    /// Upsert many documents in one round-trip
    async fn bulk_index(
        &self,
        index: &str,
        docs: Vec<(String, serde_json::Value)>,
    ) -> IndexResult<()>;

    async fn update_document(
        &self,
        index: &str,
        id: &str,
        patch: &DocumentPatch,
    ) -> IndexResult<PatchOutcome>;

    /// Returns `false` if the document did not exist
    async fn delete_document(&self, index: &str, id: &str) -> IndexResult<bool>;

    async fn search(&self, index: &str, query: &SearchQuery) -> IndexResult<SearchHits>;

    /// Make every completed write visible to [`Self::search`]
    async fn refresh(&self, index: &str) -> IndexResult<()>;
}
