mod cli;

use std::io;
use std::sync::Arc;

use clap::Parser;
use cli::{Opts, OptsCmd, ServeOpts};
use slumber::{AppState, Server, ServerError};
use slumber_core::event::Topic;
use slumber_db::{Database, DbError};
use slumber_feed::{FeedPlanner, FeedStrategy, Materializer};
use slumber_index::{ElasticsearchIndex, IndexError, MemoryIndex, SearchIndex};
use slumber_log::{ConsumerLoop, MemoryLog};
use snafu::{FromString, OptionExt as _, ResultExt, Snafu, Whatever};
use tokio::sync::watch;
use tokio::task::JoinError;
use tracing::level_filters::LevelFilter;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

pub const LOG_TARGET: &str = "slumber::cli";

const MATERIALIZER_GROUP: &str = "feed-materializer";
const DB_FILE_NAME: &str = "slumber.redb";

type WhateverResult<T> = std::result::Result<T, snafu::Whatever>;

#[derive(Debug, Snafu)]
pub enum CliError {
    #[snafu(display("Server error: {source}"))]
    Server { source: ServerError },
    #[snafu(display("Search index error: {source}"))]
    Index { source: IndexError },
    #[snafu(display("Database error: {source}"))]
    Database { source: DbError },
    #[snafu(display("Data dir error: {source:?}"))]
    DataDir { source: io::Error },
    #[snafu(display("No data dir given and no platform default available"))]
    DataDirUnknown,
    #[snafu(display("Consumer task failed: {source}"))]
    Join { source: JoinError },
    #[snafu(display("Miscellaneous error: {source}"))]
    Whatever { source: Whatever },
}

pub type CliResult<T> = std::result::Result<T, CliError>;

#[snafu::report]
#[tokio::main]
async fn main() -> CliResult<()> {
    init_logging().context(WhateverSnafu)?;

    let opts = Opts::parse();
    match opts.cmd {
        OptsCmd::Serve(opts) => serve(opts).await,
        OptsCmd::SetupIndex {
            elasticsearch_url,
            force,
        } => {
            let index = ElasticsearchIndex::builder()
                .url(elasticsearch_url)
                .build()
                .context(IndexSnafu)?;
            slumber_index::setup::ensure_indices(&index, force)
                .await
                .context(IndexSnafu)?;
            Ok(())
        }
    }
}

async fn serve(opts: ServeOpts) -> CliResult<()> {
    let data_dir = opts.data_dir().context(DataDirUnknownSnafu)?;
    tokio::fs::create_dir_all(&data_dir)
        .await
        .context(DataDirSnafu)?;

    let log = Arc::new(MemoryLog::new(opts.partitions));

    let index: Arc<dyn SearchIndex> = match &opts.elasticsearch_url {
        Some(url) => Arc::new(
            ElasticsearchIndex::builder()
                .url(url)
                .build()
                .context(IndexSnafu)?,
        ),
        None => {
            warn!(target: LOG_TARGET, "No Elasticsearch url given, using an in-memory index");
            Arc::new(MemoryIndex::new())
        }
    };
    slumber_index::setup::ensure_indices(index.as_ref(), false)
        .await
        .context(IndexSnafu)?;

    let db = Arc::new(
        Database::open(data_dir.join(DB_FILE_NAME))
            .publisher(log.clone())
            .publish_timeout(opts.publish_timeout())
            .build()
            .await
            .context(DatabaseSnafu)?,
    );

    let strategy = Arc::new(
        FeedStrategy::builder()
            .graph(db.clone())
            .threshold(opts.fan_in_threshold)
            .cache_capacity(opts.classification_cache_size)
            .build(),
    );
    let materializer = Arc::new(
        Materializer::builder()
            .index(index.clone())
            .graph(db.clone())
            .strategy(strategy.clone())
            .build(),
    );
    let planner = FeedPlanner::builder()
        .index(index)
        .strategy(strategy)
        .query_timeout(opts.query_timeout())
        .build();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let consumers = Topic::ALL
        .into_iter()
        .map(|topic| {
            let consumer = ConsumerLoop::builder()
                .log(log.clone())
                .topic(topic)
                .group(MATERIALIZER_GROUP)
                .handler(materializer.clone())
                .max_attempts(opts.consumer_max_attempts)
                .build();
            tokio::spawn(consumer.run(shutdown_rx.clone()))
        })
        .collect::<Vec<_>>();

    let server = Server::init(&opts.listen, Arc::new(AppState { db, planner }))
        .await
        .context(ServerSnafu)?;
    let res = server
        .run(slumber::shutdown_signal())
        .await
        .context(ServerSnafu);

    info!(target: LOG_TARGET, "Stopping consumers");
    // Receivers also stop once the sender is gone
    let _ = shutdown_tx.send(true);
    for consumer in consumers {
        consumer.await.context(JoinSnafu)?;
    }

    res
}

pub fn init_logging() -> WhateverResult<()> {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .try_init()
        .map_err(|_| Whatever::without_source("Failed to initialize logging".to_string()))?;

    Ok(())
}
