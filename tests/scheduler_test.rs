use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::bail;
use blog_api::db::{self, PostFilter};
use blog_api::model::Post;
use blog_api::scheduler::{
    DuePostSource, PostScheduler, SchedulerConfig, SchedulerStats, SqlitePostSource,
};
use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const INTERVAL: Duration = Duration::from_secs(10);

#[derive(Default)]
struct State {
    posts: BTreeMap<i64, Post>,
    fetch_calls: usize,
    fetched: Vec<usize>,
    marks: Vec<i64>,
    fail_fetches: usize,
    fail_marks: HashMap<i64, usize>,
}

/// In-memory post store that records every call the scheduler makes.
#[derive(Default)]
struct RecordingSource {
    state: Mutex<State>,
    gate: Option<Arc<Semaphore>>,
    publish_delay: Option<Duration>,
}

impl RecordingSource {
    fn with_posts(posts: Vec<Post>) -> Self {
        let source = Self::default();
        {
            let mut state = source.state.lock().unwrap();
            for post in posts {
                state.posts.insert(post.id, post);
            }
        }
        source
    }

    fn fetched(&self) -> Vec<usize> {
        self.state.lock().unwrap().fetched.clone()
    }

    fn marks(&self) -> Vec<i64> {
        self.state.lock().unwrap().marks.clone()
    }

    fn is_published(&self, id: i64) -> bool {
        self.state.lock().unwrap().posts[&id].published
    }
}

#[async_trait::async_trait]
impl DuePostSource for RecordingSource {
    async fn fetch_due(
        &self,
        due_before: DateTime<Utc>,
        limit: i64,
        offset: i64,
    ) -> anyhow::Result<Vec<Post>> {
        let mut state = self.state.lock().unwrap();
        state.fetch_calls += 1;
        if state.fail_fetches > 0 {
            state.fail_fetches -= 1;
            bail!("storage unavailable");
        }
        let mut due: Vec<Post> = state
            .posts
            .values()
            .filter(|p| !p.published && p.publish_at.is_some_and(|at| at <= due_before))
            .cloned()
            .collect();
        due.sort_by_key(|p| (p.publish_at, p.id));
        let page: Vec<Post> = due
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect();
        state.fetched.push(page.len());
        Ok(page)
    }

    async fn mark_published(&self, post: &Post) -> anyhow::Result<()> {
        if let Some(gate) = &self.gate {
            gate.acquire().await?.forget();
        }
        if let Some(delay) = self.publish_delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock().unwrap();
        state.marks.push(post.id);
        if let Some(left) = state.fail_marks.get_mut(&post.id) {
            if *left > 0 {
                *left -= 1;
                bail!("write failed");
            }
        }
        if let Some(stored) = state.posts.get_mut(&post.id) {
            stored.published = true;
        }
        Ok(())
    }
}

fn post(id: i64, publish_at: DateTime<Utc>) -> Post {
    Post {
        id,
        title: format!("post {id}"),
        content: "body".into(),
        author_id: 1,
        published: false,
        publish_at: Some(publish_at),
        created_at: publish_at,
        updated_at: publish_at,
    }
}

fn due_posts(n: i64) -> Vec<Post> {
    let base = Utc::now() - chrono::Duration::hours(1);
    (1..=n)
        .map(|id| post(id, base + chrono::Duration::seconds(id)))
        .collect()
}

fn config(workers: usize, queue_capacity: usize, page_size: i64) -> SchedulerConfig {
    SchedulerConfig {
        interval: INTERVAL,
        workers,
        queue_capacity,
        backlog_warn_threshold: queue_capacity / 2,
        page_size,
    }
}

fn start(
    source: Arc<RecordingSource>,
    cfg: SchedulerConfig,
) -> (Arc<SchedulerStats>, CancellationToken, JoinHandle<()>) {
    let scheduler = PostScheduler::new(source, cfg);
    let stats = scheduler.stats();
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(scheduler.run(cancel.clone()));
    (stats, cancel, handle)
}

/// Let exactly one more tick fire and everything it triggers settle.
async fn next_tick() {
    tokio::time::sleep(INTERVAL).await;
}

async fn first_tick() {
    tokio::time::sleep(INTERVAL + Duration::from_millis(1)).await;
}

#[tokio::test(start_paused = true)]
async fn test_nothing_happens_before_first_interval() {
    let source = Arc::new(RecordingSource::with_posts(due_posts(3)));
    let (stats, cancel, handle) = start(source.clone(), config(2, 10, 100));

    tokio::time::sleep(INTERVAL - Duration::from_millis(1)).await;
    assert!(source.fetched().is_empty());
    assert_eq!(stats.snapshot().dispatched, 0);

    cancel.cancel();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_each_tick_dispatches_at_most_one_page() {
    let source = Arc::new(RecordingSource::with_posts(due_posts(150)));
    let (stats, cancel, handle) = start(source.clone(), config(5, 1000, 100));

    first_tick().await;
    assert_eq!(source.fetched(), vec![100]);
    assert_eq!(stats.snapshot().dispatched, 100);
    assert_eq!(stats.snapshot().published, 100);
    // oldest-due first
    assert!(source.is_published(1));
    assert!(!source.is_published(150));

    next_tick().await;
    assert_eq!(source.fetched(), vec![100, 50]);
    assert_eq!(stats.snapshot().published, 150);

    next_tick().await;
    assert_eq!(source.fetched(), vec![100, 50, 0]);

    cancel.cancel();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_full_queue_blocks_dispatch_without_losing_jobs() {
    let gate = Arc::new(Semaphore::new(0));
    let source = Arc::new(RecordingSource {
        gate: Some(gate.clone()),
        ..RecordingSource::with_posts(due_posts(10))
    });
    let (stats, cancel, handle) = start(source.clone(), config(1, 2, 100));

    first_tick().await;
    // one job held by the worker, two buffered, the loop parked on send
    let snap = stats.snapshot();
    assert_eq!(snap.dispatched, 3);
    assert_eq!(snap.backlog, 2);
    assert!(source.marks().is_empty());

    gate.add_permits(10);
    tokio::time::sleep(Duration::from_millis(1)).await;

    let mut marks = source.marks();
    marks.sort_unstable();
    assert_eq!(marks, (1..=10).collect::<Vec<_>>());
    assert_eq!(stats.snapshot().published, 10);
    assert_eq!(source.fetched(), vec![10]);

    cancel.cancel();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_drains_buffered_jobs() {
    let source = Arc::new(RecordingSource {
        publish_delay: Some(Duration::from_secs(1)),
        ..RecordingSource::with_posts(due_posts(5))
    });
    let (stats, cancel, handle) = start(source.clone(), config(1, 10, 100));

    first_tick().await;
    assert_eq!(stats.snapshot().dispatched, 5);
    assert!(source.marks().is_empty());

    cancel.cancel();
    handle.await.unwrap();

    assert_eq!(source.marks(), vec![1, 2, 3, 4, 5]);
    assert_eq!(stats.snapshot().published, 5);
    assert_eq!(stats.snapshot().backlog, 0);

    // no tick runs after cancellation
    tokio::time::sleep(INTERVAL * 3).await;
    assert_eq!(source.fetched(), vec![5]);
}

#[tokio::test(start_paused = true)]
async fn test_backlog_returns_to_zero_once_drained() {
    let source = Arc::new(RecordingSource::with_posts(due_posts(50)));
    let (stats, cancel, handle) = start(source.clone(), config(5, 1000, 100));

    first_tick().await;
    next_tick().await;
    next_tick().await;

    assert_eq!(source.fetched(), vec![50, 0, 0]);
    let snap = stats.snapshot();
    assert_eq!(snap.published, 50);
    assert_eq!(snap.backlog, 0);

    cancel.cancel();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_backlog_warning_counts_only_enqueues_above_threshold() {
    let gate = Arc::new(Semaphore::new(0));
    let source = Arc::new(RecordingSource {
        gate: Some(gate.clone()),
        ..RecordingSource::with_posts(due_posts(1))
    });
    let cfg = SchedulerConfig {
        backlog_warn_threshold: 1,
        ..config(1, 4, 100)
    };
    let (stats, cancel, handle) = start(source.clone(), cfg);

    // the only worker takes post 1 and parks on the gate
    first_tick().await;
    let snap = stats.snapshot();
    assert_eq!(snap.dispatched, 1);
    assert_eq!(snap.backlog, 0);
    assert_eq!(snap.backlog_warnings, 0);

    {
        let base = Utc::now() - chrono::Duration::hours(1);
        let mut state = source.state.lock().unwrap();
        for id in 2..=6 {
            state
                .posts
                .insert(id, post(id, base + chrono::Duration::seconds(id)));
        }
    }

    // post 1 is in flight; 2..=5 fill the queue to 1, 2, 3, 4; post 6 waits
    next_tick().await;
    let snap = stats.snapshot();
    assert_eq!(snap.skipped_in_flight, 1);
    assert_eq!(snap.dispatched, 5);
    assert_eq!(snap.backlog, 4);
    assert_eq!(snap.backlog_warnings, 3);

    gate.add_permits(10);
    tokio::time::sleep(Duration::from_millis(1)).await;
    let snap = stats.snapshot();
    assert_eq!(snap.published, 6);
    assert_eq!(snap.backlog, 0);

    cancel.cancel();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_backlog_at_threshold_does_not_warn() {
    let gate = Arc::new(Semaphore::new(0));
    let source = Arc::new(RecordingSource {
        gate: Some(gate.clone()),
        ..RecordingSource::with_posts(due_posts(10))
    });
    let cfg = SchedulerConfig {
        backlog_warn_threshold: 4,
        ..config(1, 4, 100)
    };
    let (stats, cancel, handle) = start(source.clone(), cfg);

    first_tick().await;
    let snap = stats.snapshot();
    assert_eq!(snap.backlog, 4);
    assert_eq!(snap.backlog_warnings, 0);

    gate.add_permits(10);
    tokio::time::sleep(Duration::from_millis(1)).await;
    let snap = stats.snapshot();
    assert_eq!(snap.published, 10);
    assert_eq!(snap.backlog, 0);
    assert_eq!(snap.backlog_warnings, 0);

    cancel.cancel();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_cancel_while_blocked_on_full_queue() {
    let gate = Arc::new(Semaphore::new(0));
    let source = Arc::new(RecordingSource {
        gate: Some(gate.clone()),
        ..RecordingSource::with_posts(due_posts(10))
    });
    let (stats, cancel, handle) = start(source.clone(), config(1, 2, 100));

    first_tick().await;
    assert_eq!(stats.snapshot().dispatched, 3);

    cancel.cancel();
    gate.add_permits(10);
    handle.await.unwrap();

    // everything that made it into the queue is published, nothing more
    assert_eq!(source.marks(), vec![1, 2, 3]);
    assert!(!source.is_published(4));
}

#[tokio::test(start_paused = true)]
async fn test_fetch_failure_does_not_stop_the_loop() {
    let source = Arc::new(RecordingSource::with_posts(due_posts(3)));
    source.state.lock().unwrap().fail_fetches = 1;
    let (stats, cancel, handle) = start(source.clone(), config(2, 10, 100));

    first_tick().await;
    assert_eq!(source.state.lock().unwrap().fetch_calls, 1);
    assert_eq!(stats.snapshot().dispatched, 0);

    next_tick().await;
    assert_eq!(source.state.lock().unwrap().fetch_calls, 2);
    assert_eq!(stats.snapshot().published, 3);

    cancel.cancel();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_failed_publish_is_retried_on_next_tick() {
    let source = Arc::new(RecordingSource::with_posts(due_posts(3)));
    source.state.lock().unwrap().fail_marks.insert(2, 1);
    let (stats, cancel, handle) = start(source.clone(), config(2, 10, 100));

    first_tick().await;
    assert!(source.is_published(1));
    assert!(!source.is_published(2));
    assert!(source.is_published(3));
    assert_eq!(stats.snapshot().failed, 1);

    next_tick().await;
    assert!(source.is_published(2));
    assert_eq!(source.fetched(), vec![3, 1]);
    let snap = stats.snapshot();
    assert_eq!(snap.published, 3);
    assert_eq!(snap.failed, 1);

    cancel.cancel();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_future_post_is_never_selected() {
    let now = Utc::now();
    let source = Arc::new(RecordingSource::with_posts(vec![
        post(1, now - chrono::Duration::minutes(1)),
        post(2, now + chrono::Duration::days(1)),
    ]));
    let (_stats, cancel, handle) = start(source.clone(), config(2, 10, 100));

    first_tick().await;
    next_tick().await;
    next_tick().await;

    assert_eq!(source.fetched(), vec![1, 0, 0]);
    assert_eq!(source.marks(), vec![1]);
    assert!(!source.is_published(2));

    cancel.cancel();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_slow_publish_is_not_dispatched_twice() {
    let source = Arc::new(RecordingSource {
        publish_delay: Some(INTERVAL * 5 / 2),
        ..RecordingSource::with_posts(due_posts(1))
    });
    let (stats, cancel, handle) = start(source.clone(), config(2, 10, 100));

    // ticks at 10s, 20s and 30s all see the post as due; the publish ends at 35s
    first_tick().await;
    next_tick().await;
    next_tick().await;
    tokio::time::sleep(Duration::from_secs(6)).await;

    assert_eq!(source.fetched(), vec![1, 1, 1]);
    assert_eq!(source.marks(), vec![1]);
    let snap = stats.snapshot();
    assert_eq!(snap.dispatched, 1);
    assert_eq!(snap.skipped_in_flight, 2);
    assert_eq!(snap.published, 1);

    cancel.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_sqlite_due_post_is_published() {
    let pool = db::init_memory_pool().await.unwrap();
    let mut tx = pool.begin().await.unwrap();
    let user = db::insert_user_tx(&mut tx, "writer", "writer@example.com", "hash")
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let now = Utc::now();
    let due = db::insert_post(
        &pool,
        user.id,
        "due",
        "body",
        false,
        Some(now - chrono::Duration::seconds(1)),
    )
    .await
    .unwrap();
    let later = db::insert_post(
        &pool,
        user.id,
        "later",
        "body",
        false,
        Some(now + chrono::Duration::hours(1)),
    )
    .await
    .unwrap();

    let scheduler = PostScheduler::new(
        Arc::new(SqlitePostSource::new(pool.clone())),
        SchedulerConfig {
            interval: Duration::from_millis(50),
            ..config(2, 10, 100)
        },
    );
    let stats = scheduler.stats();
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(scheduler.run(cancel.clone()));

    let mut published = None;
    for _ in 0..100 {
        published = db::get_post(&pool, due.id, &PostFilter::published())
            .await
            .unwrap();
        if published.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cancel.cancel();
    handle.await.unwrap();

    let published = published.expect("due post was not published");
    assert!(published.published);
    assert_eq!(published.title, "due");
    assert!(stats.snapshot().published >= 1);

    let later = db::get_post(&pool, later.id, &PostFilter::default())
        .await
        .unwrap()
        .unwrap();
    assert!(!later.published);
}
