//! Caller identity resolution.
//!
//! The relay does not own user sessions. An [`Authenticator`] maps request
//! headers to the authenticated [`UserId`]; the embedding application
//! supplies one backed by its session store. [`StaticTokenAuthenticator`]
//! serves standalone deployments and tests.

use crate::config::AuthConfig;
use crate::error::RelayError;
use crate::server::UnlockRelay;
use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use std::collections::HashMap;
use std::sync::Arc;
use unlock_types::UserId;

/// Resolves the current user of a request.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Return the authenticated user, or `None` if the request has no valid
    /// session.
    async fn authenticate(&self, headers: &HeaderMap) -> Option<UserId>;
}

/// Bearer tokens mapped to user ids.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenAuthenticator {
    tokens: HashMap<String, UserId>,
}

impl StaticTokenAuthenticator {
    /// Build from the `[auth]` config section.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if a token maps to an empty user id.
    pub fn from_config(config: &AuthConfig) -> Result<Self, RelayError> {
        let tokens = config
            .tokens
            .iter()
            .map(|(token, user)| Ok((token.clone(), UserId::new(user.as_str())?)))
            .collect::<Result<HashMap<_, _>, RelayError>>()?;
        Ok(Self { tokens })
    }

    /// Register a token (builder style, mostly for tests).
    pub fn with_token(mut self, token: impl Into<String>, user_id: UserId) -> Self {
        self.tokens.insert(token.into(), user_id);
        self
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuthenticator {
    async fn authenticate(&self, headers: &HeaderMap) -> Option<UserId> {
        let token = bearer_token(headers)?;
        self.tokens.get(token).cloned()
    }
}

/// Extract the token from `Authorization: Bearer <token>`.
fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

/// Authenticated caller, resolved before any relay work happens.
#[derive(Debug, Clone)]
pub struct AuthUser(pub UserId);

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = RelayError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let relay = parts
            .extensions
            .get::<Arc<UnlockRelay>>()
            .cloned()
            .ok_or(RelayError::Unauthenticated)?;

        match relay.authenticator().authenticate(&parts.headers).await {
            Some(user_id) => Ok(AuthUser(user_id)),
            None => {
                tracing::debug!("Rejected unauthenticated request to {}", parts.uri.path());
                Err(RelayError::Unauthenticated)
            }
        }
    }
}
