//! Persistence boundaries for sessions, connect tokens and the user directory.
//!
//! All session state lives behind these traits; nothing is cached in process
//! memory, so several server instances sharing one database observe the same
//! rotation outcomes. Two backends implement them: [`PgStore`] for production
//! and [`MemoryStore`] for tests and local runs.
//!
//! # Row Locking
//!
//! [`SessionTransaction::lock_session`] is the single synchronization point of
//! the rotation path. It must block a second locker of the same row until the
//! first transaction commits or is dropped, so the second caller reads the
//! first caller's outcome instead of a stale `active` row.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::auth::{
    identity::{ExternalIdentity, Provider},
    session::{Session, SessionSummary},
};

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn insert(&self, session: &Session) -> Result<()>;

    async fn get(&self, id: Uuid) -> Result<Option<Session>>;

    /// Extend the refresh window and touch `last_used_at` of an active session.
    /// Returns `false` when the session is no longer active.
    async fn slide(
        &self,
        id: Uuid,
        refresh_expires_at: DateTime<Utc>,
        last_used_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Revoke one active session owned by `user_id`. Returns `false` when
    /// nothing matched (already non-active, unknown, or owned by someone else).
    async fn revoke(&self, user_id: Uuid, id: Uuid) -> Result<bool>;

    /// Revoke every active session of a user, returning how many changed.
    async fn revoke_all(&self, user_id: Uuid) -> Result<u64>;

    /// Active sessions, most recently used first.
    async fn list_active(&self, user_id: Uuid) -> Result<Vec<SessionSummary>>;

    async fn begin(&self) -> Result<Box<dyn SessionTransaction>>;

    /// Connectivity probe for health checks.
    async fn ping(&self) -> Result<()>;
}

/// Unit of work for the rotation path. Dropping it without
/// [`commit`](SessionTransaction::commit) discards every write and releases
/// the row lock.
#[async_trait]
pub trait SessionTransaction: Send {
    /// Read a session while taking an exclusive lock on its row.
    async fn lock_session(&mut self, id: Uuid) -> Result<Option<Session>>;

    async fn insert(&mut self, session: &Session) -> Result<()>;

    async fn mark_rotated(&mut self, id: Uuid, successor: Uuid) -> Result<()>;

    async fn mark_revoked(&mut self, id: Uuid) -> Result<()>;

    async fn revoke_all(&mut self, user_id: Uuid) -> Result<u64>;

    async fn commit(self: Box<Self>) -> Result<()>;
}

/// Single-use account-linking token, stored by digest.
#[derive(Clone, Debug)]
pub struct ConnectToken {
    pub token_hash: Vec<u8>,
    pub user_id: Uuid,
    pub provider: Provider,
    pub expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait ConnectTokenStore: Send + Sync {
    async fn insert_connect_token(&self, token: &ConnectToken) -> Result<()>;

    /// Claim an unexpired token for `identity.provider` and link the identity
    /// to its owner, atomically. The token is deleted only when the link is
    /// written; any other outcome leaves it in place.
    async fn redeem_connect_token(
        &self,
        token_hash: &[u8],
        now: DateTime<Utc>,
        identity: &ExternalIdentity,
    ) -> Result<Redemption>;
}

#[derive(Debug, Eq, PartialEq)]
pub enum Redemption {
    Linked(Uuid),
    /// Unknown, expired, or issued for another provider.
    InvalidToken,
    /// The identity is linked elsewhere or the owner already has this provider.
    AlreadyLinked,
}

#[derive(Clone, Debug)]
pub struct UserRecord {
    pub id: Uuid,
    pub email: String,
    pub name: String,
    pub role: String,
    pub avatar_url: Option<String>,
    pub password_hash: Option<String>,
}

/// Outcome when creating a user: a unique violation is not an error.
#[derive(Debug)]
pub enum UserInsert {
    Created(UserRecord),
    Conflict,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, ToSchema)]
pub struct AuthMethods {
    pub has_password: bool,
    pub providers: Vec<Provider>,
}

impl AuthMethods {
    #[must_use]
    pub fn count(&self) -> usize {
        usize::from(self.has_password) + self.providers.len()
    }
}

/// User profile collaborator. Only the fields authentication needs are exposed.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn find_user_by_id(&self, id: Uuid) -> Result<Option<UserRecord>>;

    async fn find_user_by_email(&self, email: &str) -> Result<Option<UserRecord>>;

    async fn create_user_with_password(
        &self,
        name: &str,
        email: &str,
        password_hash: &str,
    ) -> Result<UserInsert>;

    async fn find_user_by_identity(
        &self,
        provider: Provider,
        provider_user_id: &str,
    ) -> Result<Option<UserRecord>>;

    /// Create a user and its provider link in one step. Conflicts when the
    /// identity is already linked or the email is taken.
    async fn create_user_from_identity(&self, identity: &ExternalIdentity) -> Result<UserInsert>;

    async fn auth_methods(&self, user_id: Uuid) -> Result<Option<AuthMethods>>;

    async fn clear_password(&self, user_id: Uuid) -> Result<()>;

    /// Returns `false` when the user had no link for `provider`.
    async fn unlink_provider(&self, user_id: Uuid, provider: Provider) -> Result<bool>;
}
