use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash as _, Hasher as _};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use snafu::ensure;
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::{
    BrokerUnavailableSnafu, ConsumeBrokerUnavailableSnafu, ConsumeResult, EventConsumer, EventLog,
    EventPublisher, ForeignRecordSnafu, LOG_TARGET, LogRecord, PublishResult,
};

#[derive(Default)]
struct LogState {
    available: bool,
    /// Topic -> partitions -> records
    topics: HashMap<String, Vec<Vec<LogRecord>>>,
    /// (group, topic) -> next offset to deliver, per partition
    committed: HashMap<(String, String), Vec<u64>>,
}

struct Inner {
    partitions: u32,
    state: Mutex<LogState>,
    /// Bumped on every append and availability change, to wake pollers
    appended: watch::Sender<u64>,
}

/// In-process event log
///
/// Partitions are selected by hashing the message key, so all messages with
/// the same key are delivered in publication order. Consumer groups track
/// committed offsets; a fresh subscription resumes from the last commit, which
/// redelivers anything that was polled but never committed.
#[derive(Clone)]
pub struct MemoryLog {
    inner: Arc<Inner>,
}

impl MemoryLog {
    pub fn new(partitions: u32) -> Self {
        let (appended, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                partitions: partitions.max(1),
                state: Mutex::new(LogState {
                    available: true,
                    ..LogState::default()
                }),
                appended,
            }),
        }
    }

    pub fn partitions(&self) -> u32 {
        self.inner.partitions
    }

    /// Simulate a broker outage (or recovery)
    pub fn set_available(&self, available: bool) {
        self.inner.lock().available = available;
        debug!(target: LOG_TARGET, available, "Broker availability changed");
        self.inner.appended.send_modify(|v| *v += 1);
    }

    /// All records of a topic, partition by partition
    pub fn records(&self, topic: &str) -> Vec<LogRecord> {
        self.inner
            .lock()
            .topics
            .get(topic)
            .map(|partitions| partitions.iter().flatten().cloned().collect())
            .unwrap_or_default()
    }

    pub fn committed_offset(&self, group: &str, topic: &str, partition: u32) -> u64 {
        self.inner
            .lock()
            .committed
            .get(&(group.to_owned(), topic.to_owned()))
            .and_then(|offsets| offsets.get(partition as usize).copied())
            .unwrap_or_default()
    }

    pub fn partition_for(&self, key: &str) -> u32 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % u64::from(self.inner.partitions)) as u32
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, LogState> {
        // Every mutation is a single push or store
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn topic_mut<'s>(&self, state: &'s mut LogState, topic: &str) -> &'s mut Vec<Vec<LogRecord>> {
        state
            .topics
            .entry(topic.to_owned())
            .or_insert_with(|| vec![vec![]; self.partitions as usize])
    }
}

#[async_trait]
impl EventPublisher for MemoryLog {
    async fn publish(&self, topic: &str, key: &str, payload: Vec<u8>) -> PublishResult<()> {
        let partition = self.partition_for(key);
        let offset = {
            let mut state = self.inner.lock();
            ensure!(
                state.available,
                BrokerUnavailableSnafu {
                    message: "broker is down",
                }
            );
            let records = &mut self.inner.topic_mut(&mut state, topic)[partition as usize];
            let offset = records.len() as u64;
            records.push(LogRecord {
                topic: topic.to_owned(),
                partition,
                offset,
                key: key.to_owned(),
                payload,
            });
            offset
        };
        trace!(target: LOG_TARGET, %topic, %key, partition, offset, "Published");
        self.inner.appended.send_modify(|v| *v += 1);
        Ok(())
    }
}

#[async_trait]
impl EventLog for MemoryLog {
    async fn subscribe(&self, topic: &str, group: &str) -> ConsumeResult<Box<dyn EventConsumer>> {
        let positions = {
            let mut state = self.inner.lock();
            ensure!(
                state.available,
                ConsumeBrokerUnavailableSnafu {
                    message: "broker is down",
                }
            );
            self.inner.topic_mut(&mut state, topic);
            state
                .committed
                .entry((group.to_owned(), topic.to_owned()))
                .or_insert_with(|| vec![0; self.inner.partitions as usize])
                .clone()
        };
        debug!(target: LOG_TARGET, %topic, %group, ?positions, "Subscribed");
        Ok(Box::new(MemoryConsumer {
            inner: self.inner.clone(),
            appended: self.inner.appended.subscribe(),
            topic: topic.to_owned(),
            group: group.to_owned(),
            positions,
            next_partition: 0,
        }))
    }
}

struct MemoryConsumer {
    inner: Arc<Inner>,
    appended: watch::Receiver<u64>,
    topic: String,
    group: String,
    /// Next offset to deliver, per partition
    positions: Vec<u64>,
    /// Round-robin start, so one busy partition can't starve the others
    next_partition: usize,
}

impl MemoryConsumer {
    fn try_fetch(&mut self) -> ConsumeResult<Option<LogRecord>> {
        let state = self.inner.lock();
        ensure!(
            state.available,
            ConsumeBrokerUnavailableSnafu {
                message: "broker is down",
            }
        );
        let Some(partitions) = state.topics.get(&self.topic) else {
            return Ok(None);
        };
        let count = partitions.len();
        for i in 0..count {
            let partition = (self.next_partition + i) % count;
            let position = self.positions[partition];
            if let Some(record) = partitions[partition].get(position as usize) {
                self.positions[partition] = position + 1;
                self.next_partition = (partition + 1) % count;
                return Ok(Some(record.clone()));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl EventConsumer for MemoryConsumer {
    async fn poll(&mut self) -> ConsumeResult<LogRecord> {
        loop {
            self.appended.borrow_and_update();
            if let Some(record) = self.try_fetch()? {
                return Ok(record);
            }
            if self.appended.changed().await.is_err() {
                return ConsumeBrokerUnavailableSnafu {
                    message: "log was shut down",
                }
                .fail();
            }
        }
    }

    async fn commit(&mut self, record: &LogRecord) -> ConsumeResult<()> {
        ensure!(
            record.topic == self.topic && (record.partition as usize) < self.positions.len(),
            ForeignRecordSnafu {
                topic: self.topic.clone(),
                partition: record.partition,
                offset: record.offset,
            }
        );
        let mut state = self.inner.lock();
        ensure!(
            state.available,
            ConsumeBrokerUnavailableSnafu {
                message: "broker is down",
            }
        );
        let offsets = state
            .committed
            .entry((self.group.clone(), self.topic.clone()))
            .or_insert_with(|| vec![0; self.inner.partitions as usize]);
        let committed = &mut offsets[record.partition as usize];
        *committed = (*committed).max(record.offset + 1);
        Ok(())
    }
}
