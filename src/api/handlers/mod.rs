pub mod auth;
pub mod health;
pub mod oauth;
pub mod sessions;

// common types and helpers for the handlers
use axum::http::{HeaderMap, header::SET_COOKIE};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    auth::{AuthConfig, AuthError, IssuedSession, cookies},
    store::UserRecord,
};
use secrecy::ExposeSecret;

/// Public profile returned alongside an access token.
#[derive(ToSchema, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct UserProfile {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub role: String,
    pub avatar_url: Option<String>,
}

impl From<&UserRecord> for UserProfile {
    fn from(user: &UserRecord) -> Self {
        Self {
            id: user.id,
            name: user.name.clone(),
            email: user.email.clone(),
            role: user.role.clone(),
            avatar_url: user.avatar_url.clone(),
        }
    }
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct SessionResponse {
    pub access_token: String,
    pub user: UserProfile,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct AccessTokenResponse {
    pub access_token: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct OkResponse {
    pub ok: bool,
}

/// `Set-Cookie` headers carrying a session's refresh secret and id.
pub(crate) fn session_cookies(
    config: &AuthConfig,
    session_id: Uuid,
    refresh_secret: &str,
) -> Result<HeaderMap, AuthError> {
    let mut headers = HeaderMap::new();
    let refresh = cookies::refresh_cookie(config, refresh_secret)
        .map_err(|err| AuthError::Store(anyhow::anyhow!("invalid refresh cookie: {err}")))?;
    let sid = cookies::session_cookie(config, &session_id.to_string())
        .map_err(|err| AuthError::Store(anyhow::anyhow!("invalid session cookie: {err}")))?;
    headers.append(SET_COOKIE, refresh);
    headers.append(SET_COOKIE, sid);
    Ok(headers)
}

pub(crate) fn issued_cookies(
    config: &AuthConfig,
    issued: &IssuedSession,
) -> Result<HeaderMap, AuthError> {
    session_cookies(
        config,
        issued.session_id,
        issued.refresh_secret.expose_secret(),
    )
}

/// Headers expiring both credential cookies.
pub(crate) fn cleared_cookies(config: &AuthConfig) -> Result<HeaderMap, AuthError> {
    let mut headers = HeaderMap::new();
    for cookie in cookies::clear_cookies(config)
        .map_err(|err| AuthError::Store(anyhow::anyhow!("invalid cookie reset: {err}")))?
    {
        headers.append(SET_COOKIE, cookie);
    }
    Ok(headers)
}
