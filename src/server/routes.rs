use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use reqwest::Url;
use serde::Deserialize;
use uuid::Uuid;

use crate::state::State as AppState;
use crate::storage::entities::{Feed, FeedFollow, Post, User};
use crate::storage::is_unique_violation;

use super::auth::AuthedUser;
use super::responses::{ApiError, NewFeedWithFollow, Readiness};

const MAX_POSTS_LIMIT: usize = 100;

type Result<T, E = ApiError> = std::result::Result<T, E>;

fn required(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(ApiError::bad_request(format!("`{field}` must not be empty")));
    }

    Ok(())
}

pub async fn readiness() -> Json<Readiness> {
    Json(Readiness { status: "ok" })
}

pub async fn err() -> ApiError {
    ApiError::internal()
}

#[derive(Deserialize, Debug)]
pub struct CreateUser {
    name: String,
}

pub async fn create_user(
    State(state): State<AppState>,
    payload: Result<Json<CreateUser>, JsonRejection>,
) -> Result<(StatusCode, Json<User>)> {
    let Json(payload) = payload?;
    required("name", &payload.name)?;

    let mut tx = state.storage.begin().await?;
    let user = tx.create_user(payload.name.trim()).await?;
    tx.commit().await?;

    Ok((StatusCode::CREATED, Json(user)))
}

pub async fn get_user(AuthedUser(user): AuthedUser) -> Json<User> {
    Json(user)
}

#[derive(Deserialize, Debug)]
pub struct CreateFeed {
    name: String,
    url: String,
}

pub async fn create_feed(
    State(state): State<AppState>,
    AuthedUser(user): AuthedUser,
    payload: Result<Json<CreateFeed>, JsonRejection>,
) -> Result<(StatusCode, Json<NewFeedWithFollow>)> {
    let Json(payload) = payload?;
    required("name", &payload.name)?;

    let url = Url::parse(payload.url.trim())
        .map_err(|e| ApiError::bad_request(format!("Invalid feed URL: {e}")))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(ApiError::bad_request(format!(
            "Unsupported feed URL scheme `{}`",
            url.scheme()
        )));
    }

    let mut tx = state.storage.begin().await?;
    let feed = match tx.create_feed(user.id, payload.name.trim(), url.as_str()).await {
        Ok(feed) => feed,
        Err(e) if is_unique_violation(&e) => {
            return Err(ApiError::conflict(format!("The feed `{url}` already exists")));
        }
        Err(e) => return Err(e.into()),
    };
    let feed_follow = tx.create_feed_follow(user.id, feed.id).await?;
    tx.commit().await?;

    Ok((
        StatusCode::CREATED,
        Json(NewFeedWithFollow { feed, feed_follow }),
    ))
}

pub async fn get_feeds(State(state): State<AppState>) -> Result<Json<Vec<Feed>>> {
    let mut tx = state.storage.begin().await?;
    let feeds = tx.get_feeds().await?;
    tx.commit().await?;

    Ok(Json(feeds))
}

pub async fn delete_feed(
    State(state): State<AppState>,
    AuthedUser(user): AuthedUser,
    feed_id: Result<Path<Uuid>, PathRejection>,
) -> Result<StatusCode> {
    let Path(feed_id) = feed_id?;

    let mut tx = state.storage.begin().await?;
    let deleted = tx.delete_feed(feed_id, user.id).await?;
    tx.commit().await?;

    if !deleted {
        return Err(ApiError::not_found(format!("You own no feed {feed_id}")));
    }

    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize, Debug)]
pub struct CreateFeedFollow {
    feed_id: Uuid,
}

pub async fn create_feed_follow(
    State(state): State<AppState>,
    AuthedUser(user): AuthedUser,
    payload: Result<Json<CreateFeedFollow>, JsonRejection>,
) -> Result<(StatusCode, Json<FeedFollow>)> {
    let Json(CreateFeedFollow { feed_id }) = payload?;

    let mut tx = state.storage.begin().await?;

    if tx.get_feed(feed_id).await?.is_none() {
        return Err(ApiError::not_found(format!("There is no feed {feed_id}")));
    }

    let feed_follow = match tx.create_feed_follow(user.id, feed_id).await {
        Ok(feed_follow) => feed_follow,
        Err(e) if is_unique_violation(&e) => {
            return Err(ApiError::conflict(format!(
                "You already follow the feed {feed_id}"
            )));
        }
        Err(e) => return Err(e.into()),
    };
    tx.commit().await?;

    Ok((StatusCode::CREATED, Json(feed_follow)))
}

pub async fn get_feed_follows(
    State(state): State<AppState>,
    AuthedUser(user): AuthedUser,
) -> Result<Json<Vec<FeedFollow>>> {
    let mut tx = state.storage.begin().await?;
    let feed_follows = tx.get_feed_follows(user.id).await?;
    tx.commit().await?;

    Ok(Json(feed_follows))
}

pub async fn delete_feed_follow(
    State(state): State<AppState>,
    AuthedUser(user): AuthedUser,
    feed_follow_id: Result<Path<Uuid>, PathRejection>,
) -> Result<StatusCode> {
    let Path(feed_follow_id) = feed_follow_id?;

    let mut tx = state.storage.begin().await?;
    let deleted = tx.delete_feed_follow(feed_follow_id, user.id).await?;
    tx.commit().await?;

    if !deleted {
        return Err(ApiError::not_found(format!(
            "You have no feed follow {feed_follow_id}"
        )));
    }

    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize, Debug)]
pub struct PostsQuery {
    limit: Option<usize>,
}

pub async fn get_posts(
    State(state): State<AppState>,
    AuthedUser(user): AuthedUser,
    query: Result<Query<PostsQuery>, QueryRejection>,
) -> Result<Json<Vec<Post>>> {
    let Query(query) = query?;
    let limit = query
        .limit
        .unwrap_or(state.cfg.posts_limit)
        .clamp(1, MAX_POSTS_LIMIT);

    let mut tx = state.storage.begin().await?;
    let posts = tx.get_posts_for_user(user.id, limit).await?;
    tx.commit().await?;

    Ok(Json(posts))
}
