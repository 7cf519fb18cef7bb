use std::sync::Arc;

use async_trait::async_trait;
use axum::{extract::{FromRef, FromRequestParts}, http::{header::AUTHORIZATION, request::Parts}};
use time::OffsetDateTime;

use crate::{db::SqliteStore, AppError};

/// Maps a bearer token to the username it was issued to.
#[async_trait]
pub trait AuthResolver: Send + Sync {
    async fn resolve(&self, token: &str) -> Option<String>;
}

#[async_trait]
impl AuthResolver for SqliteStore {
    async fn resolve(&self, token: &str) -> Option<String> {
        if token.is_empty() {
            return None;
        }

        match self.token_owner(token, OffsetDateTime::now_utc()).await {
            Ok(username) => username,
            Err(e) => {
                tracing::error!(error = %e, "token lookup failed");
                None
            }
        }
    }
}

/// Shared handle to whichever resolver the server was built with.
#[derive(Clone)]
pub struct Auth(pub Arc<dyn AuthResolver>);

/// The caller of an HTTP endpoint, from `Authorization: Bearer <token>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity(pub String);

fn bearer_token(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

impl<S> FromRequestParts<S> for Identity
where
    Auth: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Auth(resolver) = Auth::from_ref(state);
        let token = bearer_token(parts).ok_or(AppError::Unauthorized)?;

        resolver
            .resolve(token)
            .await
            .map(Identity)
            .ok_or(AppError::Unauthorized)
    }
}
