//! Periodic refresh of the stalest feeds.
//!
//! Every tick selects up to `batch-size` feeds ordered by their last fetch (never fetched
//! first) and refreshes them with at most `workers` concurrent fetches. The next tick
//! is not scheduled until the whole batch has finished, so a feed is never in flight twice.

mod worker;

use std::sync::Arc;
use std::time::Duration;

use ::time::OffsetDateTime;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::{select, time};
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, error, info, info_span, Instrument};
use uuid::Uuid;

use crate::config::ScraperConfig;
use crate::fetch::FeedSource;
use crate::storage::entities::{Feed, InsertOutcome, NewPost};

pub use self::worker::{FetchOutcome, Worker};

/// The scraper's view of the feed store.
#[async_trait]
pub trait FeedStore: Send + Sync + 'static {
    /// Up to `limit` feeds, never fetched ones first, then by the oldest last fetch.
    async fn select_stalest_feeds(&self, limit: usize) -> Result<Vec<Feed>>;

    async fn mark_feed_fetched(&self, feed_id: Uuid, at: OffsetDateTime) -> Result<()>;

    /// Storing a post whose URL is already known is a no-op.
    async fn insert_post(&self, post: NewPost) -> Result<InsertOutcome>;
}

/// What to do with a feed whose fetch failed.
#[derive(Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Mark the feed as fetched anyway so that it rotates to the back of the queue.
    #[default]
    MarkFetched,

    /// Keep the previous marker so that the feed is retried on the next tick.
    LeaveUnmarked,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub selected: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub inserted: usize,
}

impl TickSummary {
    fn record(&mut self, outcome: &FetchOutcome) {
        match *outcome {
            FetchOutcome::Success { inserted, .. } => {
                self.succeeded += 1;
                self.inserted += inserted;
            }

            FetchOutcome::Failure { .. } => self.failed += 1,
            FetchOutcome::Cancelled => self.cancelled += 1,
        }
    }
}

pub struct Scraper<S, F> {
    store: Arc<S>,
    source: Arc<F>,
    batch_size: usize,
    workers: usize,
    interval: Duration,
    policy: FailurePolicy,
    max_items: Option<usize>,
}

impl<S: FeedStore, F: FeedSource> Scraper<S, F> {
    pub fn new(store: Arc<S>, source: Arc<F>, cfg: &ScraperConfig) -> Self {
        Self {
            store,
            source,
            batch_size: cfg.batch_size.get(),
            workers: cfg.workers().get(),
            interval: cfg.interval.into(),
            policy: cfg.on_failure,
            max_items: cfg.max_items_per_feed,
        }
    }

    /// Runs until `cancel` is triggered. The first tick starts immediately.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        async move {
            info!(
                batch_size = self.batch_size,
                workers = self.workers,
                "Scraper started (interval: {}s)",
                self.interval.as_secs()
            );

            for n in 1u64.. {
                let tick = self.tick(&cancel).instrument(debug_span!("tick", %n));

                match tick.await {
                    Ok(summary) if summary.selected > 0 => info!(
                        selected = summary.selected,
                        succeeded = summary.succeeded,
                        failed = summary.failed,
                        inserted = summary.inserted,
                        "Finished refreshing a batch"
                    ),

                    Ok(_) => debug!("No feeds to refresh"),

                    // the store may come back by the next tick.
                    Err(e) => error!("Could not refresh feeds: {e:#}"),
                }

                debug!("Scheduling the next tick in {}s", self.interval.as_secs());

                select! {
                    _ = cancel.cancelled() => break,
                    _ = time::sleep(self.interval) => {}
                }
            }

            debug!("Received a cancellation signal; exiting");

            Ok(())
        }
        .instrument(info_span!("scraper"))
        .await
    }

    /// Refreshes one batch and waits for all of it to finish.
    pub async fn tick(&self, cancel: &CancellationToken) -> Result<TickSummary> {
        let mut summary = TickSummary::default();

        let batch = select! {
            _ = cancel.cancelled() => return Ok(summary),

            batch = self.store.select_stalest_feeds(self.batch_size) => {
                batch.context("could not select the feeds to refresh")?
            }
        };

        summary.selected = batch.len();

        if batch.is_empty() {
            return Ok(summary);
        }

        debug!("Refreshing {} feed(s)", batch.len());

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut tasks = JoinSet::new();

        for feed in batch {
            let worker = self.worker(cancel.clone());
            let semaphore = semaphore.clone();
            let span = info_span!("refresh", feed_id = %feed.id, url = %feed.url);

            tasks.spawn(
                async move {
                    // the semaphore is never closed, so this only waits for a free slot.
                    let _permit = semaphore.acquire_owned().await;

                    worker.refresh(&feed).await
                }
                .instrument(span),
            );
        }

        loop {
            let joined = select! {
                _ = cancel.cancelled() => {
                    debug!("Aborting {} unfinished refresh(es)", tasks.len());
                    tasks.abort_all();

                    break;
                }

                joined = tasks.join_next() => joined,
            };

            match joined {
                Some(Ok(outcome)) => summary.record(&outcome),

                Some(Err(e)) => {
                    error!("A refresh task failed: {e}");
                    summary.failed += 1;
                }

                None => break,
            }
        }

        Ok(summary)
    }

    fn worker(&self, cancel: CancellationToken) -> Worker<S, F> {
        Worker {
            store: self.store.clone(),
            source: self.source.clone(),
            policy: self.policy,
            max_items: self.max_items,
            cancel,
        }
    }
}
