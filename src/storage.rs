pub mod entities;

use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use rand::Rng;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool, Transaction};
use time::OffsetDateTime;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::scraper::FeedStore;

use self::entities::{Feed, FeedFollow, InsertOutcome, NewPost, Post, User};

const API_KEY_BYTES: usize = 32;

/// Returns `true` if the error was caused by a `UNIQUE` constraint violation.
pub fn is_unique_violation(e: &anyhow::Error) -> bool {
    matches!(
        e.downcast_ref::<sqlx::Error>(),
        Some(sqlx::Error::Database(e)) if e.is_unique_violation()
    )
}

fn generate_api_key() -> String {
    let bytes: [u8; API_KEY_BYTES] = rand::thread_rng().gen();

    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    pub async fn new(db_path: impl AsRef<Path>, max_connections: u32) -> Result<Self> {
        let db_path = db_path.as_ref();

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(
                SqliteConnectOptions::new()
                    .filename(db_path)
                    .foreign_keys(true)
                    .journal_mode(SqliteJournalMode::Wal)
                    .create_if_missing(true),
            )
            .await
            .with_context(|| anyhow!("could not open a SQLite database `{}`", db_path.display()))?;
        info!(
            max_connections,
            "Using an SQLite database `{}`",
            db_path.display()
        );
        sqlx::migrate!()
            .run(&pool)
            .await
            .with_context(|| anyhow!("could not prepare a database schema"))?;

        Ok(Self { pool })
    }

    pub async fn begin(&self) -> Result<Tx> {
        self.pool
            .begin()
            .await
            .context("could not begin a new DB transaction")
            .map(Tx)
    }
}

#[async_trait]
impl FeedStore for Storage {
    async fn select_stalest_feeds(&self, limit: usize) -> Result<Vec<Feed>> {
        let mut tx = self.begin().await?;
        let feeds = tx.select_stalest_feeds(limit).await?;
        tx.commit().await?;

        Ok(feeds)
    }

    async fn mark_feed_fetched(&self, feed_id: Uuid, at: OffsetDateTime) -> Result<()> {
        let mut tx = self.begin().await?;

        if !tx.mark_feed_fetched(feed_id, at).await? {
            bail!("the feed {feed_id} no longer exists");
        }

        tx.commit().await
    }

    async fn insert_post(&self, post: NewPost) -> Result<InsertOutcome> {
        let mut tx = self.begin().await?;
        let outcome = tx.insert_post(post).await?;
        tx.commit().await?;

        Ok(outcome)
    }
}

pub struct Tx(Transaction<'static, Sqlite>);

impl Tx {
    pub async fn commit(self) -> Result<()> {
        self.0
            .commit()
            .await
            .context("could not commit a DB transaction")
    }

    #[instrument(level = "TRACE", skip(self))]
    pub async fn create_user(&mut self, name: &str) -> Result<User> {
        let now = OffsetDateTime::now_utc();

        sqlx::query_as(
            "INSERT
            INTO users (id, created_at, updated_at, name, api_key)
            VALUES (?1, ?2, ?2, ?3, ?4)
            RETURNING id, created_at, updated_at, name, api_key",
        )
        .bind(Uuid::new_v4())
        .bind(now)
        .bind(name)
        .bind(generate_api_key())
        .fetch_one(self.0.as_mut())
        .await
        .context("could not create a user")
    }

    #[instrument(level = "TRACE", skip_all)]
    pub async fn get_user_by_api_key(&mut self, api_key: &str) -> Result<Option<User>> {
        sqlx::query_as(
            "SELECT id, created_at, updated_at, name, api_key
            FROM users
            WHERE api_key = ?1",
        )
        .bind(api_key)
        .fetch_optional(self.0.as_mut())
        .await
        .context("could not retrieve the user")
    }

    #[instrument(level = "TRACE", skip(self))]
    pub async fn create_feed(&mut self, user_id: Uuid, name: &str, url: &str) -> Result<Feed> {
        let now = OffsetDateTime::now_utc();

        sqlx::query_as(
            "INSERT
            INTO feeds (id, created_at, updated_at, name, url, user_id)
            VALUES (?1, ?2, ?2, ?3, ?4, ?5)
            RETURNING id, created_at, updated_at, name, url, user_id, last_fetched_at",
        )
        .bind(Uuid::new_v4())
        .bind(now)
        .bind(name)
        .bind(url)
        .bind(user_id)
        .fetch_one(self.0.as_mut())
        .await
        .context("could not create a feed")
    }

    #[instrument(level = "TRACE", skip(self))]
    pub async fn get_feed(&mut self, feed_id: Uuid) -> Result<Option<Feed>> {
        sqlx::query_as(
            "SELECT id, created_at, updated_at, name, url, user_id, last_fetched_at
            FROM feeds
            WHERE id = ?1",
        )
        .bind(feed_id)
        .fetch_optional(self.0.as_mut())
        .await
        .context("could not retrieve the feed")
    }

    #[instrument(level = "TRACE", skip(self))]
    pub async fn get_feeds(&mut self) -> Result<Vec<Feed>> {
        sqlx::query_as(
            "SELECT id, created_at, updated_at, name, url, user_id, last_fetched_at
            FROM feeds
            ORDER BY julianday(created_at) ASC",
        )
        .fetch_all(self.0.as_mut())
        .await
        .context("could not retrieve the feed list")
    }

    /// Deletes a feed owned by `user_id`. Returns `false` if there was no such feed.
    #[instrument(level = "TRACE", skip(self))]
    pub async fn delete_feed(&mut self, feed_id: Uuid, user_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "DELETE
            FROM feeds
            WHERE id = ?1 AND user_id = ?2",
        )
        .bind(feed_id)
        .bind(user_id)
        .execute(self.0.as_mut())
        .await
        .context("could not delete the feed")?;

        Ok(result.rows_affected() > 0)
    }

    /// Feeds that were never fetched come first, then the least recently fetched ones.
    #[instrument(level = "TRACE", skip(self))]
    pub async fn select_stalest_feeds(&mut self, limit: usize) -> Result<Vec<Feed>> {
        // timestamps are compared through `julianday` since the stored RFC 3339 text
        // does not sort lexicographically when the fractional part is omitted.
        sqlx::query_as(
            "SELECT id, created_at, updated_at, name, url, user_id, last_fetched_at
            FROM feeds
            ORDER BY
              julianday(last_fetched_at) ASC NULLS FIRST,
              julianday(created_at) ASC
            LIMIT ?1",
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(self.0.as_mut())
        .await
        .context("could not select the feeds to fetch")
    }

    /// Returns `false` if the feed does not exist.
    #[instrument(level = "TRACE", skip(self))]
    pub async fn mark_feed_fetched(&mut self, feed_id: Uuid, at: OffsetDateTime) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE feeds
            SET last_fetched_at = ?1, updated_at = ?1
            WHERE id = ?2",
        )
        .bind(at)
        .bind(feed_id)
        .execute(self.0.as_mut())
        .await
        .context("could not mark the feed as fetched")?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(level = "TRACE", skip(self))]
    pub async fn create_feed_follow(&mut self, user_id: Uuid, feed_id: Uuid) -> Result<FeedFollow> {
        let now = OffsetDateTime::now_utc();

        sqlx::query_as(
            "INSERT
            INTO feed_follows (id, created_at, updated_at, user_id, feed_id)
            VALUES (?1, ?2, ?2, ?3, ?4)
            RETURNING id, created_at, updated_at, user_id, feed_id",
        )
        .bind(Uuid::new_v4())
        .bind(now)
        .bind(user_id)
        .bind(feed_id)
        .fetch_one(self.0.as_mut())
        .await
        .context("could not create a feed follow")
    }

    #[instrument(level = "TRACE", skip(self))]
    pub async fn get_feed_follows(&mut self, user_id: Uuid) -> Result<Vec<FeedFollow>> {
        sqlx::query_as(
            "SELECT id, created_at, updated_at, user_id, feed_id
            FROM feed_follows
            WHERE user_id = ?1
            ORDER BY julianday(created_at) ASC",
        )
        .bind(user_id)
        .fetch_all(self.0.as_mut())
        .await
        .context("could not retrieve the feed follows")
    }

    /// Returns `false` if the follow does not exist or belongs to another user.
    #[instrument(level = "TRACE", skip(self))]
    pub async fn delete_feed_follow(&mut self, feed_follow_id: Uuid, user_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "DELETE
            FROM feed_follows
            WHERE id = ?1 AND user_id = ?2",
        )
        .bind(feed_follow_id)
        .bind(user_id)
        .execute(self.0.as_mut())
        .await
        .context("could not delete the feed follow")?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(level = "TRACE", skip(self, post), fields(url = %post.url))]
    pub async fn insert_post(&mut self, post: NewPost) -> Result<InsertOutcome> {
        let now = OffsetDateTime::now_utc();

        let id: Option<Uuid> = sqlx::query_scalar(
            "INSERT
            INTO posts (id, created_at, updated_at, title, description, published_at, url, feed_id)
            VALUES (?1, ?2, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT (url) DO NOTHING
            RETURNING id",
        )
        .bind(Uuid::new_v4())
        .bind(now)
        .bind(post.title)
        .bind(post.description)
        .bind(post.published_at)
        .bind(post.url)
        .bind(post.feed_id)
        .fetch_optional(self.0.as_mut())
        .await
        .context("could not insert a post")?;

        Ok(match id {
            Some(_) => InsertOutcome::Inserted,
            None => InsertOutcome::AlreadyExists,
        })
    }

    /// The newest posts from the feeds `user_id` follows.
    #[instrument(level = "TRACE", skip(self))]
    pub async fn get_posts_for_user(&mut self, user_id: Uuid, limit: usize) -> Result<Vec<Post>> {
        sqlx::query_as(
            "SELECT
              posts.id,
              posts.created_at,
              posts.updated_at,
              posts.title,
              posts.description,
              posts.published_at,
              posts.url,
              posts.feed_id
            FROM posts
              JOIN feed_follows ON (posts.feed_id = feed_follows.feed_id)
            WHERE feed_follows.user_id = ?1
            ORDER BY julianday(posts.published_at) DESC
            LIMIT ?2",
        )
        .bind(user_id)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(self.0.as_mut())
        .await
        .context("could not retrieve the posts")
    }

    #[cfg(test)]
    pub async fn get_feed_posts(&mut self, feed_id: Uuid) -> Result<Vec<Post>> {
        sqlx::query_as(
            "SELECT id, created_at, updated_at, title, description, published_at, url, feed_id
            FROM posts
            WHERE feed_id = ?1
            ORDER BY julianday(published_at) ASC",
        )
        .bind(feed_id)
        .fetch_all(self.0.as_mut())
        .await
        .context("could not retrieve the feed posts")
    }
}
