use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

/// Command line options of the slumber service
#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Opts {
    #[command(subcommand)]
    pub cmd: OptsCmd,
}

#[derive(Debug, Subcommand)]
pub enum OptsCmd {
    /// Run the HTTP API together with the feed materializer
    Serve(ServeOpts),
    /// Create the search index collections
    SetupIndex {
        /// Elasticsearch base url
        #[arg(long, env = "SLUMBER_ELASTICSEARCH_URL")]
        elasticsearch_url: String,

        /// Delete existing collections first
        #[arg(long)]
        force: bool,
    },
}

#[derive(Debug, Args)]
pub struct ServeOpts {
    /// Listen address
    #[arg(long, short, default_value = "127.0.0.1:3000", env = "SLUMBER_LISTEN")]
    pub listen: String,

    /// Where the database lives; defaults to the platform state dir
    #[arg(long, env = "SLUMBER_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Elasticsearch base url; an in-memory index is used when not set
    #[arg(long, env = "SLUMBER_ELASTICSEARCH_URL")]
    pub elasticsearch_url: Option<String>,

    /// Follower count at which authors switch to fan-in
    #[arg(long, default_value_t = slumber_feed::FOLLOWER_THRESHOLD, env = "SLUMBER_FAN_IN_THRESHOLD")]
    pub fan_in_threshold: u64,

    /// Authors whose fan-in classification is kept in memory
    #[arg(long, default_value_t = slumber_feed::DEFAULT_CACHE_CAPACITY, env = "SLUMBER_CLASSIFICATION_CACHE_SIZE")]
    pub classification_cache_size: usize,

    #[arg(long, default_value_t = 5000, env = "SLUMBER_PUBLISH_TIMEOUT_MS")]
    pub publish_timeout_ms: u64,

    /// Per sub-query timeout of feed reads
    #[arg(long, default_value_t = 3000, env = "SLUMBER_QUERY_TIMEOUT_MS")]
    pub query_timeout_ms: u64,

    /// Handler attempts before an event goes to the dead-letter topic
    #[arg(long, default_value_t = 5, env = "SLUMBER_CONSUMER_MAX_ATTEMPTS")]
    pub consumer_max_attempts: usize,

    /// Partitions per event log topic
    #[arg(long, default_value_t = 8, env = "SLUMBER_PARTITIONS")]
    pub partitions: u32,
}

impl ServeOpts {
    /// The explicit data dir, or the platform default if there is one
    pub fn data_dir(&self) -> Option<PathBuf> {
        self.data_dir.clone().or_else(|| {
            let dirs = directories::ProjectDirs::from("org", "Slumber", "slumber")?;
            Some(
                dirs.state_dir()
                    .unwrap_or_else(|| dirs.data_local_dir())
                    .to_owned(),
            )
        })
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}
