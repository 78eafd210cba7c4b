use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable as _};
use serde::Serialize;
use slumber_core::event::{DomainEvent, Topic};
use slumber_util_error::{BoxedErrorResult, FmtCompact as _};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::{EventConsumer, EventLog, LOG_TARGET, LogRecord, decode_event};

/// Reacts to domain events delivered by a [`ConsumerLoop`]
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle_event(&self, event: &DomainEvent) -> BoxedErrorResult<()>;
}

/// What gets published to a dead-letter topic
#[derive(Debug, Serialize)]
struct DeadLetter<'r> {
    topic: &'r str,
    partition: u32,
    offset: u64,
    key: &'r str,
    error: String,
    payload: String,
}

/// Long-lived consumer of a single topic on behalf of a consumer group
///
/// Records are processed one at a time and committed only after processing
/// finished, so per-partition order is preserved and a crash redelivers at
/// most the record in flight.
///
/// A failing handler is retried with capped exponential backoff, up to
/// `max_attempts` times in total. After that, or immediately for payloads
/// that are not valid events, the record is moved to the topic's dead-letter
/// topic and committed, so one poisoned record cannot stall the partition.
/// Losing the broker connection triggers a resubscription, retried forever
/// with capped exponential backoff.
pub struct ConsumerLoop {
    log: Arc<dyn EventLog>,
    topic: Topic,
    group: String,
    handler: Arc<dyn EventHandler>,
    max_attempts: usize,
    min_backoff: Duration,
    max_backoff: Duration,
}

#[bon::bon]
impl ConsumerLoop {
    #[builder(finish_fn(name = "build"))]
    pub fn new(
        log: Arc<dyn EventLog>,
        topic: Topic,
        #[builder(into)] group: String,
        handler: Arc<dyn EventHandler>,
        #[builder(default = 5)] max_attempts: usize,
        #[builder(default = Duration::from_millis(100))] min_backoff: Duration,
        #[builder(default = Duration::from_secs(30))] max_backoff: Duration,
    ) -> Self {
        Self {
            log,
            topic,
            group,
            handler,
            max_attempts: max_attempts.max(1),
            min_backoff,
            max_backoff: max_backoff.max(min_backoff),
        }
    }
}

impl ConsumerLoop {
    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.min_backoff)
            .with_max_delay(self.max_backoff)
            .with_jitter()
    }

    /// Run until `shutdown` becomes `true` (or its sender is dropped)
    #[instrument(name = "consumer-loop", skip_all, fields(topic = %self.topic, group = %self.group))]
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(target: LOG_TARGET, "Starting consumer loop");
        'connect: loop {
            let mut consumer = tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => break 'connect,
                consumer = self.connect() => consumer,
            };

            loop {
                let record = tokio::select! {
                    _ = wait_for_shutdown(&mut shutdown) => break 'connect,
                    res = consumer.poll() => match res {
                        Ok(record) => record,
                        Err(err) => {
                            warn!(target: LOG_TARGET, err = %err.fmt_compact(), "Lost broker connection");
                            continue 'connect;
                        }
                    },
                };

                self.process(&record).await;

                if let Err(err) = consumer.commit(&record).await {
                    warn!(
                        target: LOG_TARGET,
                        err = %err.fmt_compact(),
                        partition = record.partition,
                        offset = record.offset,
                        "Commit failed, record will be redelivered"
                    );
                    continue 'connect;
                }
            }
        }
        info!(target: LOG_TARGET, "Consumer loop stopped");
    }

    async fn connect(&self) -> Box<dyn EventConsumer> {
        loop {
            let res = (|| async {
                self.log
                    .subscribe(self.topic.as_str(), &self.group)
                    .await
            })
            .retry(self.backoff().without_max_times())
            .notify(|err, delay| {
                warn!(
                    target: LOG_TARGET,
                    err = %err.fmt_compact(),
                    ?delay,
                    "Subscribing failed, retrying"
                )
            })
            .await;

            if let Ok(consumer) = res {
                return consumer;
            }
        }
    }

    /// Handle one record; never fails, failures end up on the dead-letter topic
    async fn process(&self, record: &LogRecord) {
        let event = match decode_event(record) {
            Ok(event) => event,
            Err(err) => {
                error!(
                    target: LOG_TARGET,
                    err = %err.fmt_compact(),
                    partition = record.partition,
                    offset = record.offset,
                    "Malformed event"
                );
                self.dead_letter(record, err.to_string()).await;
                return;
            }
        };

        debug!(
            target: LOG_TARGET,
            event_type = event.event_type(),
            partition = record.partition,
            offset = record.offset,
            "Processing event"
        );

        let res = (|| async { self.handler.handle_event(&event).await })
            .retry(self.backoff().with_max_times(self.max_attempts - 1))
            .notify(|err, delay| {
                warn!(
                    target: LOG_TARGET,
                    err = %err.as_ref().fmt_compact(),
                    event_type = event.event_type(),
                    ?delay,
                    "Event handler failed, retrying"
                )
            })
            .await;

        if let Err(err) = res {
            error!(
                target: LOG_TARGET,
                err = %err.as_ref().fmt_compact(),
                event_type = event.event_type(),
                attempts = self.max_attempts,
                "Event handler failed, giving up"
            );
            self.dead_letter(record, err.as_ref().fmt_compact().to_string())
                .await;
        }
    }

    async fn dead_letter(&self, record: &LogRecord, error: String) {
        let letter = DeadLetter {
            topic: &record.topic,
            partition: record.partition,
            offset: record.offset,
            key: &record.key,
            error,
            payload: String::from_utf8_lossy(&record.payload).into_owned(),
        };
        let payload = match serde_json::to_vec(&letter) {
            Ok(payload) => payload,
            Err(err) => {
                error!(target: LOG_TARGET, err = %err.fmt_compact(), "Can't encode dead letter");
                return;
            }
        };
        let dead_letter_topic = self.topic.dead_letter();
        if let Err(err) = self
            .log
            .publish(&dead_letter_topic, &record.key, payload)
            .await
        {
            error!(
                target: LOG_TARGET,
                err = %err.fmt_compact(),
                topic = %dead_letter_topic,
                offset = record.offset,
                "Dead-lettering failed, dropping record"
            );
        } else {
            warn!(
                target: LOG_TARGET,
                topic = %dead_letter_topic,
                offset = record.offset,
                "Record moved to dead-letter topic"
            );
        }
    }
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
