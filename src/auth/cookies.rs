//! Credential transport: bearer header parsing and the refresh/sid cookies.

use axum::http::{
    HeaderMap, HeaderValue,
    header::{AUTHORIZATION, COOKIE, InvalidHeaderValue},
};

use super::config::AuthConfig;

pub const REFRESH_COOKIE_NAME: &str = "refresh";
pub const SESSION_COOKIE_NAME: &str = "sid";
/// Response header carrying a freshly rotated access token.
pub const ACCESS_TOKEN_HEADER: &str = "x-access-token";

fn cookie_attributes(config: &AuthConfig, max_age: i64) -> String {
    if config.production() {
        format!("Path=/; HttpOnly; SameSite=Strict; Max-Age={max_age}; Secure")
    } else {
        format!("Path=/; HttpOnly; SameSite=Lax; Max-Age={max_age}")
    }
}

fn build_cookie(
    config: &AuthConfig,
    name: &str,
    value: &str,
    max_age: i64,
) -> Result<HeaderValue, InvalidHeaderValue> {
    let attributes = cookie_attributes(config, max_age);
    HeaderValue::from_str(&format!("{name}={value}; {attributes}"))
}

/// `Set-Cookie` value for a refresh secret, living as long as the refresh window.
pub fn refresh_cookie(
    config: &AuthConfig,
    secret: &str,
) -> Result<HeaderValue, InvalidHeaderValue> {
    build_cookie(
        config,
        REFRESH_COOKIE_NAME,
        secret,
        config.refresh_ttl_seconds(),
    )
}

pub fn session_cookie(
    config: &AuthConfig,
    session_id: &str,
) -> Result<HeaderValue, InvalidHeaderValue> {
    build_cookie(
        config,
        SESSION_COOKIE_NAME,
        session_id,
        config.refresh_ttl_seconds(),
    )
}

/// Expire both credential cookies.
pub fn clear_cookies(config: &AuthConfig) -> Result<[HeaderValue; 2], InvalidHeaderValue> {
    Ok([
        build_cookie(config, REFRESH_COOKIE_NAME, "", 0)?,
        build_cookie(config, SESSION_COOKIE_NAME, "", 0)?,
    ])
}

pub fn read_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    for header in headers.get_all(COOKIE) {
        let Ok(value) = header.to_str() else {
            continue;
        };
        for pair in value.split(';') {
            let mut parts = pair.trim().splitn(2, '=');
            let (Some(key), Some(val)) = (parts.next(), parts.next()) else {
                continue;
            };
            let val = val.trim();
            if key.trim() == name && !val.is_empty() {
                return Some(val.to_string());
            }
        }
    }
    None
}

pub fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let trimmed = value.trim();
    let token = trimmed
        .strip_prefix("Bearer ")
        .or_else(|| trimmed.strip_prefix("bearer "))?
        .trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}
