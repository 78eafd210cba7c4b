use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use slumber_core::event::{DomainEvent, Topic};
use slumber_core::{RecordId, Timestamp, UserId};
use slumber_db::{Database, NewRecord, RecordUpdate};
use slumber_feed::{
    FeedPage, FeedPlanner, FeedRequest, FeedStrategy, Materializer, TimeWindow,
};
use slumber_index::documents::FeedDocument;
use slumber_index::setup::ensure_indices;
use slumber_index::{FEEDS_INDEX, MemoryIndex, RECORDS_INDEX};
use slumber_log::{
    ConsumerLoop, EventLog, EventPublisher, MemoryLog, PublishResult, decode_event,
};
use slumber_util_error::BoxedErrorResult;
use snafu::ResultExt as _;
use tempfile::{TempDir, tempdir};
use tokio::sync::watch;

const THRESHOLD: u64 = 3;

struct Env {
    _dir: TempDir,
    db: Arc<Database>,
    log: MemoryLog,
    index: Arc<MemoryIndex>,
    strategy: Arc<FeedStrategy>,
    materializer: Arc<Materializer>,
    /// Records of each topic already handed to the materializer
    applied: Mutex<[usize; 2]>,
}

impl Env {
    async fn new() -> BoxedErrorResult<Self> {
        Self::with_delete_window(1000).await
    }

    async fn with_delete_window(delete_window: usize) -> BoxedErrorResult<Self> {
        let dir = tempdir()?;
        let log = MemoryLog::new(1);
        let db = Arc::new(
            Database::open(dir.path().join("db.redb"))
                .publisher(Arc::new(log.clone()))
                .build()
                .await
                .boxed()?,
        );
        let index = Arc::new(MemoryIndex::new());
        ensure_indices(index.as_ref(), false).await?;
        let strategy = Arc::new(
            FeedStrategy::builder()
                .graph(db.clone())
                .threshold(THRESHOLD)
                .build(),
        );
        let materializer = Arc::new(
            Materializer::builder()
                .index(index.clone())
                .graph(db.clone())
                .strategy(strategy.clone())
                .delete_window(delete_window)
                .build(),
        );
        Ok(Self {
            _dir: dir,
            db,
            log,
            index,
            strategy,
            materializer,
            applied: Mutex::new([0; 2]),
        })
    }

    fn planner(&self, query_timeout: Duration) -> FeedPlanner {
        FeedPlanner::builder()
            .index(self.index.clone())
            .strategy(self.strategy.clone())
            .query_timeout(query_timeout)
            .build()
    }

    /// Hand every not yet materialized event to the materializer
    async fn sync(&self) -> BoxedErrorResult<()> {
        for (slot, topic) in Topic::ALL.into_iter().enumerate() {
            let records = self.log.records(topic.as_str());
            let start = self.applied.lock().expect("not poisoned")[slot];
            for record in &records[start..] {
                let event = decode_event(record).boxed()?;
                self.materializer.apply(&event).await?;
            }
            self.applied.lock().expect("not poisoned")[slot] = records.len();
        }
        Ok(())
    }

    async fn users<const N: usize>(&self) -> BoxedErrorResult<[UserId; N]> {
        let mut ret = [UserId::ZERO; N];
        for slot in &mut ret {
            *slot = self.db.create_user().await?;
        }
        Ok(ret)
    }

    async fn post(&self, author: UserId, duration: i64) -> BoxedErrorResult<RecordId> {
        let record = self
            .db
            .create_record(
                author,
                NewRecord {
                    duration,
                    start_at: None,
                },
            )
            .await?;
        self.sync().await?;
        Ok(record.id)
    }

    async fn follow(&self, follower: UserId, followed: UserId) -> BoxedErrorResult<()> {
        self.db.create_follow(follower, followed).await?;
        self.sync().await
    }

    /// Give `user` enough fresh followers to become a fan-in author
    async fn make_celebrity(&self, user: UserId, existing_followers: u64) -> BoxedErrorResult<()> {
        for _ in existing_followers..THRESHOLD {
            let fan = self.db.create_user().await?;
            self.follow(fan, user).await?;
        }
        Ok(())
    }

    async fn feed(&self, viewer: UserId) -> BoxedErrorResult<FeedPage> {
        Ok(self
            .planner(Duration::from_secs(3))
            .get_feed(
                viewer,
                &FeedRequest {
                    limit: 10,
                    offset: 0,
                    window: None,
                },
            )
            .await?)
    }
}

/// Materializes each event before acknowledging it, while the transaction
/// that published it is still open
struct MaterializeOnPublish {
    log: MemoryLog,
    materializer: OnceLock<Arc<Materializer>>,
}

#[async_trait]
impl EventPublisher for MaterializeOnPublish {
    async fn publish(&self, topic: &str, key: &str, payload: Vec<u8>) -> PublishResult<()> {
        if let Some(materializer) = self.materializer.get() {
            let event: DomainEvent = serde_json::from_slice(&payload).expect("valid event");
            materializer.apply(&event).await.expect("materialized");
        }
        self.log.publish(topic, key, payload).await
    }
}

fn authors(page: &FeedPage) -> Vec<UserId> {
    page.entries.iter().map(|e| e.author_id).collect()
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn regular_follow_post_unfollow() -> BoxedErrorResult<()> {
    let env = Env::new().await?;
    let [a, b] = env.users().await?;

    env.follow(a, b).await?;
    let record_id = env.post(b, 420).await?;

    let page = env.feed(a).await?;
    assert_eq!(authors(&page), vec![b]);
    assert_eq!(page.entries[0].user_id, a);
    assert_eq!(page.entries[0].record_id, record_id);
    assert_eq!(page.entries[0].duration, 420);
    assert_eq!(page.total, 1);
    assert!(!page.degraded);
    assert!(
        env.index
            .get(FEEDS_INDEX, &FeedDocument::doc_id(record_id, a))
            .is_some()
    );

    env.db.delete_follow(a, b).await?;
    env.sync().await?;

    let page = env.feed(a).await?;
    assert!(!authors(&page).contains(&b));
    assert_eq!(env.index.len(FEEDS_INDEX), 0);

    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn celebrity_records_are_fanned_in() -> BoxedErrorResult<()> {
    let env = Env::new().await?;
    let [a, c] = env.users().await?;

    env.follow(a, c).await?;
    env.make_celebrity(c, 1).await?;
    assert!(env.strategy.is_fan_in(c).await?);

    let record_id = env.post(c, 500).await?;

    assert_eq!(env.index.len(FEEDS_INDEX), 0);
    assert_eq!(env.index.len(RECORDS_INDEX), 1);

    let page = env.feed(a).await?;
    assert_eq!(page.entries.len(), 1);
    let entry = &page.entries[0];
    assert_eq!(entry.author_id, c);
    assert_eq!(entry.user_id, a);
    assert_eq!(entry.record_id, record_id);
    assert_eq!(entry.id, FeedDocument::doc_id(record_id, a));

    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn mixed_feed_is_merged_by_duration() -> BoxedErrorResult<()> {
    let env = Env::new().await?;
    let [a, b, c] = env.users().await?;

    env.follow(a, b).await?;
    env.follow(a, c).await?;
    env.make_celebrity(c, 1).await?;

    env.post(b, 480).await?;
    env.post(c, 500).await?;

    let page = env.feed(a).await?;
    let durations: Vec<_> = page.entries.iter().map(|e| e.duration).collect();
    assert_eq!(durations, vec![500, 480]);
    assert_eq!(authors(&page), vec![c, b]);
    assert!(page.entries.iter().all(|e| e.user_id == a));
    assert_eq!(page.total, 2);
    assert!(!page.degraded);

    let second = env
        .planner(Duration::from_secs(3))
        .get_feed(
            a,
            &FeedRequest {
                limit: 1,
                offset: 1,
                window: None,
            },
        )
        .await?;
    assert_eq!(authors(&second), vec![b]);

    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn classifier_boundary_tracks_follow_events() -> BoxedErrorResult<()> {
    let env = Env::new().await?;
    let [author] = env.users().await?;

    env.make_celebrity(author, 1).await?;
    assert_eq!(env.db.follower_count(author).await?, THRESHOLD - 1);
    assert!(!env.strategy.is_fan_in(author).await?);

    let fan = env.db.create_user().await?;
    env.db.create_follow(fan, author).await?;
    // Classification is cached until the follow event is materialized
    assert!(!env.strategy.is_fan_in(author).await?);

    env.sync().await?;
    assert_eq!(env.db.follower_count(author).await?, THRESHOLD);
    assert!(env.strategy.is_fan_in(author).await?);

    assert!(!env.strategy.classify(THRESHOLD - 1));
    assert!(env.strategy.classify(THRESHOLD));

    let partition = env.strategy.partition_followed(fan).await?;
    assert_eq!(partition.celebrities, vec![author]);
    assert!(partition.regular.is_empty());

    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn degraded_when_one_source_fails() -> BoxedErrorResult<()> {
    let env = Env::new().await?;
    let [a, b, c] = env.users().await?;
    env.follow(a, b).await?;
    env.follow(a, c).await?;
    env.make_celebrity(c, 1).await?;
    env.post(b, 480).await?;
    env.post(c, 500).await?;

    env.index.set_failing(RECORDS_INDEX, true);
    let page = env.feed(a).await?;
    assert_eq!(authors(&page), vec![b]);
    assert!(page.degraded);

    env.index.set_failing(FEEDS_INDEX, true);
    assert!(env.feed(a).await.is_err());

    env.index.set_failing(RECORDS_INDEX, false);
    env.index.set_failing(FEEDS_INDEX, false);
    env.index
        .set_search_delay(FEEDS_INDEX, Some(Duration::from_millis(500)));
    let page = env
        .planner(Duration::from_millis(50))
        .get_feed(
            a,
            &FeedRequest {
                limit: 10,
                offset: 0,
                window: None,
            },
        )
        .await?;
    assert_eq!(authors(&page), vec![c]);
    assert!(page.degraded);

    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn deleting_a_record_removes_feed_documents() -> BoxedErrorResult<()> {
    let env = Env::with_delete_window(2).await?;
    let [author] = env.users().await?;
    let mut followers = vec![];
    for _ in 0..THRESHOLD - 1 {
        let follower = env.db.create_user().await?;
        env.follow(follower, author).await?;
        followers.push(follower);
    }

    let kept = env.post(author, 100).await?;
    let deleted = env.post(author, 200).await?;
    assert_eq!(env.index.len(FEEDS_INDEX), 2 * followers.len());

    env.db.delete_record(author, deleted).await?;
    env.sync().await?;

    assert_eq!(env.index.len(FEEDS_INDEX), followers.len());
    assert_eq!(env.index.len(RECORDS_INDEX), 1);
    for follower in followers {
        let page = env.feed(follower).await?;
        let records: Vec<_> = page.entries.iter().map(|e| e.record_id).collect();
        assert_eq!(records, vec![kept]);
    }

    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn following_back_fills_existing_records() -> BoxedErrorResult<()> {
    let env = Env::new().await?;
    let [a, b] = env.users().await?;

    env.post(b, 300).await?;
    env.post(b, 400).await?;
    env.follow(a, b).await?;

    let page = env.feed(a).await?;
    let durations: Vec<_> = page.entries.iter().map(|e| e.duration).collect();
    assert_eq!(durations, vec![400, 300]);

    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn updates_reach_feeds_and_stale_ones_are_ignored() -> BoxedErrorResult<()> {
    let env = Env::new().await?;
    let [a, b] = env.users().await?;
    env.follow(a, b).await?;
    let record_id = env.post(b, 300).await?;

    for duration in [350, 360] {
        env.db
            .update_record(
                b,
                record_id,
                RecordUpdate {
                    duration: Some(duration),
                    ..Default::default()
                },
            )
            .await?;
    }
    env.sync().await?;
    assert_eq!(env.feed(a).await?.entries[0].duration, 360);

    // Redeliver the first update, out of order
    let first_update = env
        .log
        .records(Topic::SleepRecords.as_str())
        .iter()
        .map(decode_event)
        .collect::<Result<Vec<_>, _>>()
        .boxed()?
        .into_iter()
        .find(|event| matches!(event, DomainEvent::RecordUpdated(_)))
        .expect("update was published");
    env.materializer.apply(&first_update).await?;

    assert_eq!(env.feed(a).await?.entries[0].duration, 360);
    let primary = env
        .index
        .get(RECORDS_INDEX, &record_id.to_string())
        .expect("indexed");
    assert_eq!(primary["duration"], 360);

    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn time_window_applies_to_both_sources() -> BoxedErrorResult<()> {
    let env = Env::new().await?;
    let [a, b, c] = env.users().await?;
    env.follow(a, b).await?;
    env.follow(a, c).await?;
    env.make_celebrity(c, 1).await?;
    env.post(b, 480).await?;
    env.post(c, 500).await?;

    let planner = env.planner(Duration::from_secs(3));
    let request = |window| FeedRequest {
        limit: 10,
        offset: 0,
        window: Some(window),
    };

    let last_week = TimeWindow::last_calendar_week(Timestamp::now()).expect("in range");
    let page = planner.get_feed(a, &request(last_week)).await?;
    assert!(page.entries.is_empty());

    let around_now = TimeWindow {
        from: Timestamp::now().saturating_sub(Duration::from_secs(3600)),
        to: Timestamp::now().saturating_add(Duration::from_secs(3600)),
    };
    let page = planner.get_feed(a, &request(around_now)).await?;
    assert_eq!(page.entries.len(), 2);

    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn consumer_loops_materialize_in_the_background() -> BoxedErrorResult<()> {
    let env = Env::new().await?;
    let [a, b] = env.users().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let log: Arc<dyn EventLog> = Arc::new(env.log.clone());
    let mut tasks = vec![];
    for topic in Topic::ALL {
        let consumer = ConsumerLoop::builder()
            .log(log.clone())
            .topic(topic)
            .group("feed-test")
            .handler(env.materializer.clone())
            .build();
        tasks.push(tokio::spawn(consumer.run(shutdown_rx.clone())));
    }

    env.db.create_follow(a, b).await?;
    // Let the follow land before the record, as the two topics are consumed
    // independently
    tokio::time::timeout(Duration::from_secs(5), async {
        while env.log.committed_offset("feed-test", Topic::Follows.as_str(), 0) < 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;

    env.db
        .create_record(
            b,
            NewRecord {
                duration: 420,
                start_at: None,
            },
        )
        .await?;

    let page = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match env.feed(a).await {
                Ok(page) if !page.entries.is_empty() => return page,
                _ => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        }
    })
    .await?;
    assert_eq!(authors(&page), vec![b]);

    shutdown_tx.send(true)?;
    for task in tasks {
        task.await?;
    }

    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn classification_uses_counts_written_by_follows() -> BoxedErrorResult<()> {
    let dir = tempdir()?;
    let publisher = Arc::new(MaterializeOnPublish {
        log: MemoryLog::new(1),
        materializer: OnceLock::new(),
    });
    let db = Arc::new(
        Database::open(dir.path().join("db.redb"))
            .publisher(publisher.clone())
            .build()
            .await
            .boxed()?,
    );
    let index = Arc::new(MemoryIndex::new());
    ensure_indices(index.as_ref(), false).await?;
    let strategy = Arc::new(
        FeedStrategy::builder()
            .graph(db.clone())
            .threshold(2)
            .build(),
    );
    let materializer = Arc::new(
        Materializer::builder()
            .index(index.clone())
            .graph(db.clone())
            .strategy(strategy.clone())
            .build(),
    );
    assert!(publisher.materializer.set(materializer).is_ok());

    let author = db.create_user().await?;
    let [a, b] = [db.create_user().await?, db.create_user().await?];

    db.create_follow(a, author).await?;
    db.create_follow(b, author).await?;
    assert!(strategy.is_fan_in(author).await?);

    let post = NewRecord {
        duration: 300,
        start_at: None,
    };
    db.create_record(author, post).await?;
    assert_eq!(index.len(RECORDS_INDEX), 1);
    assert_eq!(index.len(FEEDS_INDEX), 0);

    db.delete_follow(b, author).await?;
    assert!(!strategy.is_fan_in(author).await?);

    let record = db.create_record(author, post).await?;
    assert_eq!(index.len(FEEDS_INDEX), 1);
    assert!(
        index
            .get(FEEDS_INDEX, &FeedDocument::doc_id(record.id, a))
            .is_some()
    );

    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn author_turning_fan_in_appears_once_in_mixed_feed() -> BoxedErrorResult<()> {
    let env = Env::new().await?;
    let [viewer, rising, regular] = env.users().await?;

    env.follow(viewer, rising).await?;
    env.follow(viewer, regular).await?;
    let early = env.post(rising, 450).await?;
    assert!(
        env.index
            .get(FEEDS_INDEX, &FeedDocument::doc_id(early, viewer))
            .is_some()
    );

    env.make_celebrity(rising, 1).await?;
    let late = env.post(rising, 500).await?;
    let other = env.post(regular, 400).await?;

    let page = env.feed(viewer).await?;
    let records: Vec<_> = page.entries.iter().map(|e| e.record_id).collect();
    assert_eq!(records, vec![late, early, other]);
    assert_eq!(page.total, 3);
    assert!(!page.degraded);

    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn unfollow_cleanup_survives_delayed_search_visibility() -> BoxedErrorResult<()> {
    let env = Env::with_delete_window(2).await?;
    let [viewer, author] = env.users().await?;
    env.follow(viewer, author).await?;
    for duration in 1..=5 {
        env.post(author, duration * 60).await?;
    }
    assert_eq!(env.index.len(FEEDS_INDEX), 5);

    env.index.set_delayed_visibility(FEEDS_INDEX, true);
    env.db.delete_follow(viewer, author).await?;
    env.sync().await?;

    assert_eq!(env.index.len(FEEDS_INDEX), 0);

    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn followed_accounts_split_at_threshold() -> BoxedErrorResult<()> {
    let env = Env::new().await?;
    let [viewer, celebrity, almost, plain] = env.users().await?;

    for followed in [celebrity, almost, plain] {
        env.follow(viewer, followed).await?;
    }
    env.make_celebrity(celebrity, 1).await?;
    for _ in 1..THRESHOLD - 1 {
        let fan = env.db.create_user().await?;
        env.follow(fan, almost).await?;
    }
    assert_eq!(env.db.follower_count(celebrity).await?, THRESHOLD);
    assert_eq!(env.db.follower_count(almost).await?, THRESHOLD - 1);

    assert_eq!(env.strategy.followed_celebrities(viewer).await?, vec![celebrity]);
    assert_eq!(env.strategy.followed_regular(viewer).await?, vec![almost, plain]);

    // Same answer from follower counts alone
    let uncached = FeedStrategy::builder()
        .graph(env.db.clone())
        .threshold(THRESHOLD)
        .cache_capacity(0)
        .build();
    assert_eq!(uncached.followed_celebrities(viewer).await?, vec![celebrity]);
    assert_eq!(uncached.followed_regular(viewer).await?, vec![almost, plain]);
    assert!(uncached.followed_celebrities(plain).await?.is_empty());

    Ok(())
}
