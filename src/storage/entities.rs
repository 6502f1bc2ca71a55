use serde::Serialize;
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(FromRow, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    pub name: String,
    pub api_key: String,
}

#[derive(FromRow, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Feed {
    pub id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    pub name: String,
    pub url: String,
    pub user_id: Uuid,
    /// `None` until the scraper has made its first attempt.
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_fetched_at: Option<OffsetDateTime>,
}

#[derive(FromRow, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct FeedFollow {
    pub id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    pub user_id: Uuid,
    pub feed_id: Uuid,
}

#[derive(FromRow, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Post {
    pub id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    pub title: String,
    pub description: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub published_at: OffsetDateTime,
    pub url: String,
    pub feed_id: Uuid,
}

/// A post ready to be stored, as produced by the scraper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPost {
    pub feed_id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub published_at: OffsetDateTime,
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,

    /// A post with the same URL was already stored (possibly by another feed).
    AlreadyExists,
}
