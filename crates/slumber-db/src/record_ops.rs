use std::time::Duration;

use redb_bincode::ReadableTable as _;
use slumber_core::event::{DomainEvent, RecordChanged, RecordDeleted};
use slumber_core::{RecordId, SleepRecord, Timestamp, UserId};
use snafu::{OptionExt as _, ensure};
use tracing::debug;

use crate::{
    Database, DbResult, IdSequence, InvalidDurationSnafu, LOG_TARGET, RecordNotFoundSnafu,
    follower_counts, id_sequences, records, records_by_author, users,
};

/// Fields of a record to be posted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewRecord {
    /// Seconds slept; must not be negative
    pub duration: i64,
    /// Defaults to the creation time
    pub start_at: Option<Timestamp>,
}

/// Changes to an existing record; `None` leaves a field as is
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordUpdate {
    pub duration: Option<i64>,
    pub start_at: Option<Timestamp>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecordsPage {
    pub records: Vec<SleepRecord>,
    /// All records of the user, regardless of paging
    pub total: u64,
}

fn validate_duration(duration: i64) -> DbResult<u64> {
    u64::try_from(duration)
        .ok()
        .context(InvalidDurationSnafu { duration })
}

fn author_partition(user_id: UserId) -> std::ops::RangeInclusive<(UserId, RecordId)> {
    (user_id, RecordId::ZERO)..=(user_id, RecordId::MAX)
}

impl Database {
    fn follower_count_tx(
        user_id: UserId,
        follower_counts_table: &impl follower_counts::ReadableTable,
    ) -> DbResult<u64> {
        Ok(follower_counts_table
            .get(&user_id)?
            .map(|g| g.value())
            .unwrap_or_default())
    }

    /// Load `record_id`, treating records of other authors as missing
    fn get_owned_record_tx(
        author_id: UserId,
        record_id: RecordId,
        records_table: &impl records::ReadableTable,
    ) -> DbResult<SleepRecord> {
        records_table
            .get(&record_id)?
            .map(|g| g.value())
            .filter(|record| record.user_id == author_id)
            .context(RecordNotFoundSnafu { record_id })
    }

    pub async fn create_record(&self, author_id: UserId, new: NewRecord) -> DbResult<SleepRecord> {
        let record = self
            .write_and_publish(|tx| {
                let duration = validate_duration(new.duration)?;
                Self::ensure_user_tx(author_id, &tx.open_table(&users::TABLE)?)?;

                let id = RecordId::new(Self::next_id_tx(
                    IdSequence::Records,
                    &mut tx.open_table(&id_sequences::TABLE)?,
                )?);
                let now = Timestamp::now();
                let record = SleepRecord {
                    id,
                    user_id: author_id,
                    duration,
                    start_at: new.start_at.unwrap_or(now),
                    created_at: now,
                    updated_at: now,
                };

                tx.open_table(&records::TABLE)?.insert(&id, &record)?;
                tx.open_table(&records_by_author::TABLE)?
                    .insert(&(author_id, id), &())?;

                let follower_count =
                    Self::follower_count_tx(author_id, &tx.open_table(&follower_counts::TABLE)?)?;
                tx.stage_event(DomainEvent::RecordCreated(RecordChanged::new(
                    &record,
                    follower_count,
                )));
                Ok(record)
            })
            .await?;

        debug!(target: LOG_TARGET, %author_id, record_id = %record.id, "Record created");
        Ok(record)
    }

    pub async fn update_record(
        &self,
        author_id: UserId,
        record_id: RecordId,
        update: RecordUpdate,
    ) -> DbResult<SleepRecord> {
        let record = self
            .write_and_publish(|tx| {
                let mut records_table = tx.open_table(&records::TABLE)?;
                let mut record = Self::get_owned_record_tx(author_id, record_id, &records_table)?;

                if let Some(duration) = update.duration {
                    record.duration = validate_duration(duration)?;
                }
                if let Some(start_at) = update.start_at {
                    record.start_at = start_at;
                }
                // Index patches are guarded by `updated_at`, so it must grow
                // even for updates within the same millisecond
                record.updated_at = Timestamp::now()
                    .max(record.updated_at.saturating_add(Duration::from_millis(1)));

                records_table.insert(&record_id, &record)?;

                let follower_count =
                    Self::follower_count_tx(author_id, &tx.open_table(&follower_counts::TABLE)?)?;
                tx.stage_event(DomainEvent::RecordUpdated(RecordChanged::new(
                    &record,
                    follower_count,
                )));
                Ok(record)
            })
            .await?;

        debug!(target: LOG_TARGET, %author_id, %record_id, "Record updated");
        Ok(record)
    }

    pub async fn delete_record(&self, author_id: UserId, record_id: RecordId) -> DbResult<()> {
        self.write_and_publish(|tx| {
            let mut records_table = tx.open_table(&records::TABLE)?;
            Self::get_owned_record_tx(author_id, record_id, &records_table)?;

            records_table.remove(&record_id)?;
            tx.open_table(&records_by_author::TABLE)?
                .remove(&(author_id, record_id))?;

            tx.stage_event(DomainEvent::RecordDeleted(RecordDeleted {
                id: record_id,
                user_id: author_id,
            }));
            Ok(())
        })
        .await?;

        debug!(target: LOG_TARGET, %author_id, %record_id, "Record deleted");
        Ok(())
    }

    pub async fn get_record(&self, record_id: RecordId) -> DbResult<SleepRecord> {
        self.read_with(|tx| {
            tx.open_table(&records::TABLE)?
                .get(&record_id)?
                .map(|g| g.value())
                .context(RecordNotFoundSnafu { record_id })
        })
        .await
    }

    /// Every record of `author_id`, oldest first
    pub async fn list_records(&self, author_id: UserId) -> DbResult<Vec<SleepRecord>> {
        self.read_with(|tx| {
            let records_table = tx.open_table(&records::TABLE)?;
            let mut ret = vec![];
            for entry in tx
                .open_table(&records_by_author::TABLE)?
                .range(author_partition(author_id))?
            {
                let (k, _) = entry?;
                let (_, record_id) = k.value();
                if let Some(record) = records_table.get(&record_id)?.map(|g| g.value()) {
                    ret.push(record);
                }
            }
            Ok(ret)
        })
        .await
    }

    /// A page of `author_id`'s own records, newest first
    pub async fn list_user_records(
        &self,
        author_id: UserId,
        limit: usize,
        offset: usize,
    ) -> DbResult<UserRecordsPage> {
        self.read_with(|tx| {
            Self::ensure_user_tx(author_id, &tx.open_table(&users::TABLE)?)?;
            let records_table = tx.open_table(&records::TABLE)?;
            let by_author_table = tx.open_table(&records_by_author::TABLE)?;

            let total = by_author_table.range(author_partition(author_id))?.count() as u64;

            let mut records = vec![];
            for entry in by_author_table
                .range(author_partition(author_id))?
                .rev()
                .skip(offset)
                .take(limit)
            {
                let (k, _) = entry?;
                let (_, record_id) = k.value();
                if let Some(record) = records_table.get(&record_id)?.map(|g| g.value()) {
                    records.push(record);
                }
            }
            Ok(UserRecordsPage { records, total })
        })
        .await
    }
}
