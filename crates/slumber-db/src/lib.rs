mod follow_ops;
mod migration_ops;
mod paginate;
mod record_ops;
mod tables;
mod user_ops;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use std::{ops, result};

use redb_bincode::{ReadTransaction, WriteTransaction};
use slumber_core::event::DomainEvent;
use slumber_core::{RecordId, UserId};
use slumber_log::{EventPublisher, PublishError, PublishResult, PublishTimeoutSnafu, publish_event};
use slumber_util_error::{BoxedError, FmtCompact as _};
use snafu::{Location, ResultExt as _, Snafu};
use tokio::runtime::Handle;
use tokio::task::JoinError;
use tracing::{debug, instrument, warn};

pub use self::follow_ops::{
    DEFAULT_PAGE_SIZE, FollowListItem, FollowPage, FollowerBatch, MAX_PAGE_SIZE, clamp_page_size,
};
pub use self::record_ops::{NewRecord, RecordUpdate, UserRecordsPage};
pub use self::tables::*;

const LOG_TARGET: &str = "slumber::db";

/// Unit of work of a single relational write
///
/// Operations stage the domain events describing their changes here. The
/// events are published by [`Database::write_and_publish`] before the
/// transaction commits; if publishing fails the transaction is dropped, so
/// the relational store and the event log never disagree.
pub struct WriteTransactionCtx {
    dbtx: WriteTransaction,
    staged_events: std::sync::Mutex<Vec<DomainEvent>>,
}

impl From<WriteTransaction> for WriteTransactionCtx {
    fn from(dbtx: WriteTransaction) -> Self {
        Self {
            dbtx,
            staged_events: std::sync::Mutex::new(vec![]),
        }
    }
}

impl ops::Deref for WriteTransactionCtx {
    type Target = WriteTransaction;

    fn deref(&self) -> &Self::Target {
        &self.dbtx
    }
}

impl ops::DerefMut for WriteTransactionCtx {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.dbtx
    }
}

impl WriteTransactionCtx {
    /// Publish `event` as part of this transaction
    pub fn stage_event(&self, event: DomainEvent) {
        self.staged_events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event);
    }

    fn take_staged_events(&self) -> Vec<DomainEvent> {
        std::mem::take(
            &mut *self
                .staged_events
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        )
    }

    fn commit(self) -> result::Result<(), redb::CommitError> {
        self.dbtx.commit()
    }
}

/// Broad classes of failures, as seen by callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    BrokerUnavailable,
    Internal,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum DbError {
    Database {
        source: redb::DatabaseError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(transparent)]
    Table {
        source: redb::TableError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(transparent)]
    Storage {
        source: redb::StorageError,
        #[snafu(implicit)]
        location: Location,
    },
    Transaction {
        source: redb::TransactionError,
        #[snafu(implicit)]
        location: Location,
    },
    Commit {
        source: redb::CommitError,
        #[snafu(implicit)]
        location: Location,
    },
    DbVersionTooHigh {
        db_ver: u64,
        code_ver: u64,
        #[snafu(implicit)]
        location: Location,
    },
    Join {
        source: JoinError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(transparent)]
    DbTxLogic {
        source: BoxedError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("Event publication failed, write rolled back"))]
    Publish {
        source: PublishError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("Cannot follow yourself"))]
    SelfFollow,
    #[snafu(display("Already following"))]
    AlreadyFollowing,
    #[snafu(display("Not following"))]
    NotFollowing,
    #[snafu(display("User {user_id} not found"))]
    UserNotFound { user_id: UserId },
    #[snafu(display("Sleep record {record_id} not found"))]
    RecordNotFound { record_id: RecordId },
    #[snafu(display("Duration must be a non-negative number, got {duration}"))]
    InvalidDuration { duration: i64 },
    Overflow,
}
pub type DbResult<T> = std::result::Result<T, DbError>;

impl DbError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DbError::SelfFollow
            | DbError::AlreadyFollowing
            | DbError::InvalidDuration { .. } => ErrorKind::Validation,
            DbError::NotFollowing
            | DbError::UserNotFound { .. }
            | DbError::RecordNotFound { .. } => ErrorKind::NotFound,
            DbError::Publish { source, .. } if source.is_broker_unavailable() => {
                ErrorKind::BrokerUnavailable
            }
            _ => ErrorKind::Internal,
        }
    }
}

pub struct Database {
    inner: redb_bincode::Database,
    publisher: Arc<dyn EventPublisher>,
    publish_timeout: Duration,
}

#[bon::bon]
impl Database {
    #[builder(finish_fn(name = "build"))]
    #[instrument(skip_all)]
    pub async fn open(
        #[builder(start_fn, into)] path: PathBuf,
        publisher: Arc<dyn EventPublisher>,
        #[builder(default = Duration::from_secs(5))] publish_timeout: Duration,
    ) -> DbResult<Database> {
        debug!(target: LOG_TARGET, path = %path.display(), "Opening database");
        let inner = tokio::task::spawn_blocking(move || redb_bincode::Database::create(path))
            .await
            .context(JoinSnafu)?
            .context(DatabaseSnafu)?;

        Self::write_with_inner(&inner, |tx| {
            Self::init_tables_tx(tx)?;
            Self::handle_db_ver_migrations(tx)?;
            Ok(())
        })
        .await?;

        Ok(Self {
            inner,
            publisher,
            publish_timeout,
        })
    }
}

impl Database {
    pub async fn write_with_inner<T>(
        inner: &redb_bincode::Database,
        f: impl FnOnce(&'_ WriteTransactionCtx) -> DbResult<T>,
    ) -> DbResult<T> {
        tokio::task::block_in_place(|| {
            let dbtx = WriteTransactionCtx::from(inner.begin_write().context(TransactionSnafu)?);
            let res = f(&dbtx)?;

            dbtx.commit().context(CommitSnafu)?;

            Ok(res)
        })
    }

    /// Write without publishing anything
    pub async fn write_with<T>(
        &self,
        f: impl FnOnce(&'_ WriteTransactionCtx) -> DbResult<T>,
    ) -> DbResult<T> {
        Self::write_with_inner(&self.inner, f).await
    }

    /// Write and publish the staged events as one atomic pair
    ///
    /// Blocks until the broker acknowledged every staged event (or the
    /// publish timeout elapsed). Requires a multi-threaded runtime.
    pub async fn write_and_publish<T>(
        &self,
        f: impl FnOnce(&'_ WriteTransactionCtx) -> DbResult<T>,
    ) -> DbResult<T> {
        let handle = Handle::current();
        tokio::task::block_in_place(|| {
            let dbtx = WriteTransactionCtx::from(self.inner.begin_write().context(TransactionSnafu)?);
            let res = f(&dbtx)?;

            for event in dbtx.take_staged_events() {
                if let Err(err) = handle.block_on(self.publish(&event)) {
                    warn!(
                        target: LOG_TARGET,
                        err = %err.fmt_compact(),
                        event_type = event.event_type(),
                        "Publishing failed, rolling back"
                    );
                    // Dropping `dbtx` aborts the transaction
                    return Err(err).context(PublishSnafu);
                }
            }

            dbtx.commit().context(CommitSnafu)?;

            Ok(res)
        })
    }

    async fn publish(&self, event: &DomainEvent) -> PublishResult<()> {
        match tokio::time::timeout(
            self.publish_timeout,
            publish_event(self.publisher.as_ref(), event),
        )
        .await
        {
            Ok(res) => res,
            Err(_) => PublishTimeoutSnafu {
                timeout: self.publish_timeout,
            }
            .fail(),
        }
    }

    pub async fn read_with_inner<T>(
        inner: &redb_bincode::Database,
        f: impl FnOnce(&'_ ReadTransaction) -> DbResult<T>,
    ) -> DbResult<T> {
        tokio::task::block_in_place(|| {
            let dbtx = inner.begin_read().context(TransactionSnafu)?;

            f(&dbtx)
        })
    }

    pub async fn read_with<T>(
        &self,
        f: impl FnOnce(&'_ ReadTransaction) -> DbResult<T>,
    ) -> DbResult<T> {
        Self::read_with_inner(&self.inner, f).await
    }
}
