//! # Sessiongate (rotating session authentication)
//!
//! `sessiongate` authenticates HTTP clients with two credentials:
//!
//! - a short-lived, stateless **access token** (HS256 JWT, minutes), sent as
//!   `Authorization: Bearer <token>`;
//! - a long-lived, single-use **refresh secret** bound to a database-backed
//!   session row, sent as an `HttpOnly` cookie.
//!
//! ## Rotation
//!
//! When the access token expires, the request guard exchanges the stale access
//! token plus the refresh secret for a fresh pair. The exchange runs inside one
//! database transaction holding a row lock on the session, so two concurrent
//! exchanges for the same session are serialized: one wins and creates the
//! successor session, the other observes `rotated` and is treated as replay.
//!
//! ## Replay Containment
//!
//! Presenting a refresh secret that was already rotated, or a wrong secret for
//! a live session, revokes **every** active session of the user. Every such
//! failure is reported to the client as the same generic `401`.
//!
//! ## Persistence
//!
//! Sessions are never deleted; they move `active -> rotated -> ...` or
//! `active -> revoked`. Expiry is checked lazily when a credential is presented.

pub mod api;
pub mod auth;
pub mod cli;
pub mod store;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};
