//! Delayed-publication scheduler.
//!
//! A poll loop wakes up on a fixed interval, asks the [`DuePostSource`] for
//! one page of posts whose `publish_at` has passed and pushes them into a
//! bounded queue. A fixed pool of workers drains the queue and flips each
//! post to published. The queue is rebuilt from the posts table on every
//! tick, so a failed publish is simply picked up again on a later tick.
//!
//! Shutdown is cooperative: once the cancellation token fires the loop stops
//! producing, closes the queue, lets the workers drain what is buffered and
//! returns only after every worker has exited.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinSet;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config;
use crate::db::{self, Pool};
use crate::model::Post;

/// Where due posts come from and where the publish transition is persisted.
#[async_trait]
pub trait DuePostSource: Send + Sync {
    /// Unpublished posts with `publish_at <= due_before`.
    async fn fetch_due(
        &self,
        due_before: DateTime<Utc>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Post>>;

    /// Persist `published = true` for one post. Must be idempotent.
    async fn mark_published(&self, post: &Post) -> Result<()>;
}

/// [`DuePostSource`] over the SQLite posts table.
#[derive(Debug, Clone)]
pub struct SqlitePostSource {
    pool: Pool,
}

impl SqlitePostSource {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DuePostSource for SqlitePostSource {
    async fn fetch_due(
        &self,
        due_before: DateTime<Utc>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Post>> {
        db::fetch_due_posts(&self.pool, due_before, limit, offset).await
    }

    async fn mark_published(&self, post: &Post) -> Result<()> {
        if db::mark_post_published(&self.pool, post.id, Utc::now()).await? {
            Ok(())
        } else {
            Err(anyhow!("post {} no longer exists", post.id))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub interval: Duration,
    pub workers: usize,
    pub queue_capacity: usize,
    pub backlog_warn_threshold: usize,
    pub page_size: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from(&config::Scheduler::default())
    }
}

impl From<&config::Scheduler> for SchedulerConfig {
    fn from(cfg: &config::Scheduler) -> Self {
        Self {
            interval: cfg.interval(),
            workers: cfg.workers,
            queue_capacity: cfg.queue_capacity,
            backlog_warn_threshold: cfg.backlog_warn_threshold,
            page_size: cfg.page_size,
        }
    }
}

/// Counters shared between the scheduler tasks and whoever wants to report
/// on them (the health endpoint).
#[derive(Debug, Default)]
pub struct SchedulerStats {
    /// Jobs sitting in the queue: counted up before a job becomes receivable
    /// and down as soon as a worker takes it.
    backlog: AtomicUsize,
    dispatched: AtomicU64,
    published: AtomicU64,
    failed: AtomicU64,
    skipped_in_flight: AtomicU64,
    backlog_warnings: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub backlog: usize,
    pub dispatched: u64,
    pub published: u64,
    pub failed: u64,
    pub skipped_in_flight: u64,
    pub backlog_warnings: u64,
}

impl SchedulerStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            backlog: self.backlog.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped_in_flight: self.skipped_in_flight.load(Ordering::Relaxed),
            backlog_warnings: self.backlog_warnings.load(Ordering::Relaxed),
        }
    }
}

/// One due post on its way to a worker.
#[derive(Debug)]
struct PublishJob {
    post: Post,
}

/// Post ids that are queued or being published right now.
#[derive(Debug, Default)]
struct InFlight(Mutex<HashSet<i64>>);

impl InFlight {
    /// Returns false if the id was already claimed.
    fn claim(&self, id: i64) -> bool {
        self.0.lock().map(|mut set| set.insert(id)).unwrap_or(true)
    }

    fn release(&self, id: i64) {
        if let Ok(mut set) = self.0.lock() {
            set.remove(&id);
        }
    }
}

struct Shared {
    source: Arc<dyn DuePostSource>,
    stats: Arc<SchedulerStats>,
    in_flight: InFlight,
}

type JobReceiver = Arc<AsyncMutex<mpsc::Receiver<PublishJob>>>;

enum TickOutcome {
    Dispatched(usize),
    Cancelled,
}

pub struct PostScheduler {
    config: SchedulerConfig,
    shared: Arc<Shared>,
}

impl PostScheduler {
    pub fn new(source: Arc<dyn DuePostSource>, config: SchedulerConfig) -> Self {
        Self {
            config,
            shared: Arc::new(Shared {
                source,
                stats: Arc::new(SchedulerStats::default()),
                in_flight: InFlight::default(),
            }),
        }
    }

    pub fn stats(&self) -> Arc<SchedulerStats> {
        self.shared.stats.clone()
    }

    /// Run until `cancel` fires, then shut down gracefully.
    pub async fn run(self, cancel: CancellationToken) {
        let cfg = &self.config;
        info!(
            interval = ?cfg.interval,
            workers = cfg.workers,
            queue_capacity = cfg.queue_capacity,
            "post scheduler started"
        );

        let (tx, rx) = mpsc::channel::<PublishJob>(cfg.queue_capacity.max(1));
        let rx: JobReceiver = Arc::new(AsyncMutex::new(rx));

        let mut workers = JoinSet::new();
        for worker_id in 1..=cfg.workers {
            workers.spawn(run_worker(
                worker_id,
                rx.clone(),
                self.shared.clone(),
                cancel.clone(),
            ));
        }

        // first tick one interval after start
        let mut ticker = time::interval_at(Instant::now() + cfg.interval, cfg.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match self.poll_once(&tx, &cancel).await {
                        TickOutcome::Dispatched(n) if n > 0 => debug!(dispatched = n, "scheduler tick"),
                        TickOutcome::Dispatched(_) => {}
                        TickOutcome::Cancelled => break,
                    }
                }
            }
        }

        info!("post scheduler stopping; draining queue");
        // closing the queue lets workers finish what is buffered and exit
        drop(tx);
        while let Some(res) = workers.join_next().await {
            if let Err(err) = res {
                error!(?err, "scheduler worker terminated abnormally");
            }
        }
        info!("post scheduler stopped");
    }

    /// Fetch one page of due posts and enqueue them. Blocks while the queue
    /// is full unless cancellation wins the race.
    async fn poll_once(
        &self,
        tx: &mpsc::Sender<PublishJob>,
        cancel: &CancellationToken,
    ) -> TickOutcome {
        let shared = &self.shared;
        let posts = match shared
            .source
            .fetch_due(Utc::now(), self.config.page_size, 0)
            .await
        {
            Ok(posts) => posts,
            Err(err) => {
                error!(?err, "scheduler failed to fetch due posts");
                return TickOutcome::Dispatched(0);
            }
        };

        let mut dispatched = 0;
        for post in posts {
            let post_id = post.id;
            if !shared.in_flight.claim(post_id) {
                debug!(post_id, "post already queued; skipping");
                shared.stats.skipped_in_flight.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            let backlog = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    shared.in_flight.release(post_id);
                    return TickOutcome::Cancelled;
                }
                res = tx.reserve() => match res {
                    Ok(permit) => {
                        let backlog = shared.stats.backlog.fetch_add(1, Ordering::Relaxed) + 1;
                        permit.send(PublishJob { post });
                        backlog
                    }
                    Err(_) => {
                        shared.in_flight.release(post_id);
                        warn!(post_id, "job queue closed; dropping dispatch");
                        return TickOutcome::Cancelled;
                    }
                }
            };

            dispatched += 1;
            shared.stats.dispatched.fetch_add(1, Ordering::Relaxed);
            if backlog > self.config.backlog_warn_threshold {
                shared.stats.backlog_warnings.fetch_add(1, Ordering::Relaxed);
                warn!(
                    backlog,
                    threshold = self.config.backlog_warn_threshold,
                    "post scheduler backlog is large"
                );
            }
        }
        TickOutcome::Dispatched(dispatched)
    }
}

async fn next_job(rx: &JobReceiver) -> Option<PublishJob> {
    rx.lock().await.recv().await
}

async fn run_worker(
    worker_id: usize,
    rx: JobReceiver,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) {
    loop {
        let job = tokio::select! {
            biased;
            job = next_job(&rx) => job,
            _ = cancel.cancelled() => break,
        };
        match job {
            Some(job) => publish(worker_id, job, &shared).await,
            None => {
                debug!(worker = worker_id, "job queue closed; worker exiting");
                return;
            }
        }
    }

    // cancelled: keep taking buffered jobs until the producer closes the queue
    while let Some(job) = next_job(&rx).await {
        publish(worker_id, job, &shared).await;
    }
    debug!(worker = worker_id, "worker drained and exiting");
}

async fn publish(worker_id: usize, job: PublishJob, shared: &Shared) {
    shared.stats.backlog.fetch_sub(1, Ordering::Relaxed);
    let mut post = job.post;
    let post_id = post.id;
    post.published = true;

    match shared.source.mark_published(&post).await {
        Ok(()) => {
            shared.stats.published.fetch_add(1, Ordering::Relaxed);
            info!(worker = worker_id, post_id, "published post");
        }
        Err(err) => {
            // stays due in storage; the next poll picks it up again
            shared.stats.failed.fetch_add(1, Ordering::Relaxed);
            error!(?err, worker = worker_id, post_id, "failed to publish post");
        }
    }
    shared.in_flight.release(post_id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_from_settings() {
        let cfg = SchedulerConfig::default();
        assert_eq!(cfg.interval, Duration::from_secs(60));
        assert_eq!(cfg.workers, 5);
        assert_eq!(cfg.queue_capacity, 1000);
        assert_eq!(cfg.backlog_warn_threshold, 500);
        assert_eq!(cfg.page_size, 100);
    }

    #[test]
    fn in_flight_claims_once() {
        let set = InFlight::default();
        assert!(set.claim(1));
        assert!(!set.claim(1));
        set.release(1);
        assert!(set.claim(1));
    }

    #[tokio::test]
    async fn sqlite_source_publish_is_idempotent() {
        let pool = db::init_memory_pool().await.unwrap();
        let mut tx = pool.begin().await.unwrap();
        let user = db::insert_user_tx(&mut tx, "writer", "w@example.com", "h")
            .await
            .unwrap();
        tx.commit().await.unwrap();
        let post = db::insert_post(
            &pool,
            user.id,
            "t",
            "c",
            false,
            Some(Utc::now() - chrono::Duration::seconds(1)),
        )
        .await
        .unwrap();

        let source = SqlitePostSource::new(pool.clone());
        let due = source.fetch_due(Utc::now(), 100, 0).await.unwrap();
        assert_eq!(due.len(), 1);

        source.mark_published(&post).await.unwrap();
        source.mark_published(&post).await.unwrap();
        assert!(source.fetch_due(Utc::now(), 100, 0).await.unwrap().is_empty());

        db::delete_post(&pool, post.id).await.unwrap();
        assert!(source.mark_published(&post).await.is_err());
    }
}
