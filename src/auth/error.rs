//! Error taxonomy for authentication flows.
//!
//! Internally the engine distinguishes many failure reasons (missing row, wrong
//! owner, replay, expiry, hash mismatch). Externally every credential failure
//! collapses to the same `401` so callers learn nothing about which check failed.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use super::token::TokenError;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("unauthenticated")]
    Unauthenticated,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("token expired")]
    Expired,
    #[error("not found")]
    NotFound,
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl AuthError {
    /// True for every kind that must surface as a generic `401`.
    #[must_use]
    pub const fn is_unauthenticated(&self) -> bool {
        matches!(
            self,
            Self::Unauthenticated | Self::InvalidSignature | Self::Expired | Self::NotFound
        )
    }
}

impl From<TokenError> for AuthError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::InvalidSignature => Self::InvalidSignature,
            TokenError::Expired => Self::Expired,
            TokenError::Encoding(message) => Self::Store(anyhow::anyhow!(message)),
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        if self.is_unauthenticated() {
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": "unauthenticated" })),
            )
                .into_response();
        }

        match self {
            Self::Conflict(message) => {
                (StatusCode::CONFLICT, Json(json!({ "error": message }))).into_response()
            }
            Self::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
            }
            other => {
                error!("Internal auth failure: {other:#}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": "internal error" })),
                )
                    .into_response()
            }
        }
    }
}
