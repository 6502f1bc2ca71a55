use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::{header, HeaderMap};

use crate::state::State;
use crate::storage::entities::User;

use super::responses::ApiError;

const SCHEME: &str = "ApiKey";

/// The user identified by the `Authorization: ApiKey <key>` header.
#[derive(Debug, Clone)]
pub struct AuthedUser(pub User);

#[async_trait]
impl FromRequestParts<State> for AuthedUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &State) -> Result<Self, Self::Rejection> {
        let api_key = api_key(&parts.headers)?;

        let mut tx = state.storage.begin().await?;
        let user = tx.get_user_by_api_key(api_key).await?;
        tx.commit().await?;

        user.map(AuthedUser)
            .ok_or_else(|| ApiError::unauthorized("Unknown API key"))
    }
}

pub fn api_key(headers: &HeaderMap) -> Result<&str, ApiError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .ok_or_else(|| ApiError::forbidden("An API key is needed to process this request"))?
        .to_str()
        .map_err(|_| ApiError::forbidden("Malformed authorization header"))?;

    match value.split_once(' ') {
        Some((SCHEME, key)) if !key.is_empty() && !key.contains(' ') => Ok(key),
        _ => Err(ApiError::forbidden("Malformed authorization header")),
    }
}
