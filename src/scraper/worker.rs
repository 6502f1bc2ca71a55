use std::sync::Arc;

use ::time::OffsetDateTime;
use anyhow::Result;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::fetch::{FeedSource, ParsedItem};
use crate::storage::entities::{Feed, InsertOutcome, NewPost};

use super::{FailurePolicy, FeedStore};

/// The result of refreshing a single feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Success {
        inserted: usize,
        /// Items whose URL was already stored.
        existing: usize,
        /// Items that could not be stored for other reasons.
        failed: usize,
    },

    Failure {
        error: String,
    },

    /// The fetch was interrupted by shutdown; the feed was left untouched.
    Cancelled,
}

/// Refreshes one feed at a time, keeping its failures to itself.
pub struct Worker<S, F> {
    pub(super) store: Arc<S>,
    pub(super) source: Arc<F>,
    pub(super) policy: FailurePolicy,
    pub(super) max_items: Option<usize>,
    pub(super) cancel: CancellationToken,
}

impl<S: FeedStore, F: FeedSource> Worker<S, F> {
    pub async fn refresh(&self, feed: &Feed) -> FetchOutcome {
        debug!("Fetching the feed");

        let fetched = select! {
            _ = self.cancel.cancelled() => {
                debug!("Received a cancellation signal; abandoning the fetch");
                return FetchOutcome::Cancelled;
            }

            fetched = self.source.fetch(&feed.url) => fetched,
        };

        let now = OffsetDateTime::now_utc();

        let items = match fetched {
            Ok(items) => items,

            Err(e) => {
                let error = format!("{:#}", anyhow::Error::new(e));
                warn!("Could not refresh the feed: {error}");

                if self.policy == FailurePolicy::MarkFetched {
                    if let Err(e) = self.mark_fetched(feed, now).await {
                        error!("{e:#}");
                    }
                }

                return FetchOutcome::Failure { error };
            }
        };

        if let Err(e) = self.mark_fetched(feed, now).await {
            let error = format!("{e:#}");
            warn!("Could not refresh the feed: {error}");

            return FetchOutcome::Failure { error };
        }

        let item_count = items.len();
        let items = items
            .into_iter()
            .take(self.max_items.unwrap_or(usize::MAX));
        let (mut inserted, mut existing, mut failed) = (0, 0, 0);

        for (idx, item) in items.enumerate() {
            let post = normalize(feed.id, item, now);

            match self.store.insert_post(post).await {
                Ok(InsertOutcome::Inserted) => inserted += 1,
                Ok(InsertOutcome::AlreadyExists) => existing += 1,

                Err(e) => {
                    warn!("Could not store item #{}: {e:#}", idx + 1);
                    failed += 1;
                }
            }
        }

        info!(
            item_count,
            inserted, existing, failed, "Refreshed the feed"
        );

        FetchOutcome::Success {
            inserted,
            existing,
            failed,
        }
    }

    async fn mark_fetched(&self, feed: &Feed, now: OffsetDateTime) -> Result<()> {
        self.store
            .mark_feed_fetched(feed.id, now)
            .await
            .map_err(|e| e.context("could not mark the feed as fetched"))
    }
}

/// Fills in the fields a document is allowed to omit.
pub fn normalize(feed_id: Uuid, item: ParsedItem, now: OffsetDateTime) -> NewPost {
    NewPost {
        feed_id,
        title: item.title.trim().into(),
        description: item
            .description
            .map(|description| description.trim().to_owned())
            .filter(|description| !description.is_empty()),
        published_at: item.published.unwrap_or(now),
        url: item.link.trim().into(),
    }
}

#[cfg(test)]
mod tests {
    use time::Duration;

    use super::*;

    fn item() -> ParsedItem {
        ParsedItem {
            title: "  Hello  ".into(),
            description: Some("\n  Body \n".into()),
            link: " https://example.com/hello ".into(),
            published: None,
        }
    }

    #[test]
    fn test_normalize_defaults_published_to_now() {
        let feed_id = Uuid::new_v4();
        let now = OffsetDateTime::now_utc();
        let post = normalize(feed_id, item(), now);

        assert_eq!(post.feed_id, feed_id);
        assert_eq!(post.title, "Hello");
        assert_eq!(post.description.as_deref(), Some("Body"));
        assert_eq!(post.url, "https://example.com/hello");
        assert_eq!(post.published_at, now);
    }

    #[test]
    fn test_normalize_keeps_published() {
        let now = OffsetDateTime::now_utc();
        let published = now - Duration::days(3);
        let post = normalize(
            Uuid::new_v4(),
            ParsedItem {
                published: Some(published),
                ..item()
            },
            now,
        );

        assert_eq!(post.published_at, published);
    }

    #[test]
    fn test_normalize_drops_blank_description() {
        let post = normalize(
            Uuid::new_v4(),
            ParsedItem {
                description: Some("   ".into()),
                ..item()
            },
            OffsetDateTime::now_utc(),
        );

        assert_eq!(post.description, None);
    }
}
