//! Session issuing, sliding and rotation.
//!
//! Per-session state machine:
//!
//! ```text
//! active --rotate--> rotated --replay--> (user-wide revoke)
//! active --logout / expiry / revoke-all--> revoked
//! ```
//!
//! `revoked` is terminal and rows are never deleted. Every rejection inside
//! [`SessionRotationEngine::rotate`] surfaces as [`AuthError::Unauthenticated`],
//! but the replay and hash-mismatch branches commit a revoke-all before
//! reporting the failure.

use chrono::{Duration, Utc};
use secrecy::SecretString;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::{
    config::AuthConfig,
    error::AuthError,
    secret::{generate_refresh_secret, hash_refresh_secret, verify_refresh_secret},
    session::{DeviceMeta, Session, SessionStatus, SessionSummary},
    token::TokenSigner,
};
use crate::store::SessionStore;

/// Credentials handed out at login. The refresh secret is never stored raw.
#[derive(Debug)]
pub struct IssuedSession {
    pub session_id: Uuid,
    pub access_token: String,
    pub refresh_secret: SecretString,
}

/// Result of a successful rotation.
#[derive(Debug)]
pub struct Rotation {
    pub access_token: String,
    pub refresh_secret: SecretString,
    pub user_id: Uuid,
    pub session_id: Uuid,
    pub role: String,
}

#[derive(Clone)]
pub struct SessionRotationEngine {
    sessions: Arc<dyn SessionStore>,
    signer: TokenSigner,
    refresh_ttl: Duration,
}

impl std::fmt::Debug for SessionRotationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRotationEngine")
            .field("signer", &self.signer)
            .field("refresh_ttl", &self.refresh_ttl)
            .finish_non_exhaustive()
    }
}

impl SessionRotationEngine {
    #[must_use]
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        signer: TokenSigner,
        refresh_ttl: Duration,
    ) -> Self {
        Self {
            sessions,
            signer,
            refresh_ttl,
        }
    }

    #[must_use]
    pub fn from_config(sessions: Arc<dyn SessionStore>, config: &AuthConfig) -> Self {
        Self::new(
            sessions,
            TokenSigner::new(config.access_secret(), config.access_ttl_seconds()),
            Duration::seconds(config.refresh_ttl_seconds()),
        )
    }

    #[must_use]
    pub const fn signer(&self) -> &TokenSigner {
        &self.signer
    }

    /// Start a new session chain. Existing sessions of the user are untouched.
    ///
    /// # Errors
    /// Returns [`AuthError::Store`] if the secret cannot be generated or stored.
    #[instrument(skip(self, device))]
    pub async fn login(
        &self,
        user_id: Uuid,
        role: &str,
        device: DeviceMeta,
    ) -> Result<IssuedSession, AuthError> {
        let now = Utc::now();
        let secret = generate_refresh_secret()?;
        let session = Session {
            id: Uuid::now_v7(),
            user_id,
            refresh_secret_hash: hash_refresh_secret(&secret)?,
            refresh_expires_at: now + self.refresh_ttl,
            status: SessionStatus::Active,
            replaced_by_session_id: None,
            device,
            last_used_at: now,
            created_at: now,
        };
        let access_token = self.signer.sign(user_id, session.id, role)?;
        self.sessions.insert(&session).await?;

        info!(session_id = %session.id, "session issued");
        Ok(IssuedSession {
            session_id: session.id,
            access_token,
            refresh_secret: SecretString::from(secret),
        })
    }

    /// Check a refresh secret without rotating it, then extend the window.
    ///
    /// # Errors
    /// [`AuthError::Unauthenticated`] when the session is missing, not active,
    /// expired, or the secret does not match.
    #[instrument(skip(self, refresh_secret))]
    pub async fn validate_and_slide(
        &self,
        session_id: Uuid,
        refresh_secret: &str,
    ) -> Result<Session, AuthError> {
        let mut session = self
            .sessions
            .get(session_id)
            .await?
            .ok_or(AuthError::Unauthenticated)?;

        let now = Utc::now();
        if session.status != SessionStatus::Active
            || session.is_expired_at(now)
            || !verify_refresh_secret(&session.refresh_secret_hash, refresh_secret)
        {
            return Err(AuthError::Unauthenticated);
        }

        session.refresh_expires_at = now + self.refresh_ttl;
        session.last_used_at = now;
        // A rotation may have committed since the read above.
        if !self
            .sessions
            .slide(session.id, session.refresh_expires_at, session.last_used_at)
            .await?
        {
            return Err(AuthError::Unauthenticated);
        }
        Ok(session)
    }

    /// Exchange a stale access token plus refresh secret for a new pair.
    ///
    /// The session row stays locked for the whole exchange, so a concurrent
    /// caller presenting the same secret observes `rotated` and takes the
    /// replay branch.
    ///
    /// # Errors
    /// Every credential failure is [`AuthError::Unauthenticated`] (or
    /// [`AuthError::InvalidSignature`] for a forged token). Store failures roll
    /// back and surface as [`AuthError::Store`].
    #[instrument(skip_all)]
    pub async fn rotate(
        &self,
        expired_access_token: &str,
        refresh_secret: &str,
    ) -> Result<Rotation, AuthError> {
        let claims = self.signer.verify_ignoring_expiry(expired_access_token)?;

        let mut tx = self.sessions.begin().await?;
        let Some(session) = tx.lock_session(claims.sid).await? else {
            return Err(AuthError::Unauthenticated);
        };
        if session.user_id != claims.sub {
            return Err(AuthError::Unauthenticated);
        }

        match session.status {
            SessionStatus::Revoked => return Err(AuthError::Unauthenticated),
            SessionStatus::Rotated => {
                let revoked = tx.revoke_all(session.user_id).await?;
                tx.commit().await?;
                warn!(
                    user_id = %session.user_id,
                    session_id = %session.id,
                    revoked,
                    "refresh secret replayed; revoked all sessions"
                );
                return Err(AuthError::Unauthenticated);
            }
            SessionStatus::Active => {}
        }

        let now = Utc::now();
        if session.is_expired_at(now) {
            tx.mark_revoked(session.id).await?;
            tx.commit().await?;
            info!(session_id = %session.id, "refresh window elapsed; session revoked");
            return Err(AuthError::Unauthenticated);
        }

        if !verify_refresh_secret(&session.refresh_secret_hash, refresh_secret) {
            let revoked = tx.revoke_all(session.user_id).await?;
            tx.commit().await?;
            warn!(
                user_id = %session.user_id,
                session_id = %session.id,
                revoked,
                "refresh secret mismatch; revoked all sessions"
            );
            return Err(AuthError::Unauthenticated);
        }

        let secret = generate_refresh_secret()?;
        let successor = Session {
            id: Uuid::now_v7(),
            user_id: session.user_id,
            refresh_secret_hash: hash_refresh_secret(&secret)?,
            refresh_expires_at: now + self.refresh_ttl,
            status: SessionStatus::Active,
            replaced_by_session_id: None,
            device: session.device.clone(),
            last_used_at: now,
            created_at: now,
        };
        tx.insert(&successor).await?;
        tx.mark_rotated(session.id, successor.id).await?;
        let access_token = self
            .signer
            .sign(successor.user_id, successor.id, &claims.role)?;
        tx.commit().await?;

        info!(
            session_id = %session.id,
            successor_id = %successor.id,
            "session rotated"
        );
        Ok(Rotation {
            access_token,
            refresh_secret: SecretString::from(secret),
            user_id: successor.user_id,
            session_id: successor.id,
            role: claims.role,
        })
    }

    /// Revoke the caller's own session. No-op if it is no longer active.
    ///
    /// # Errors
    /// Returns [`AuthError::Store`] on persistence failure.
    #[instrument(skip(self))]
    pub async fn logout(&self, user_id: Uuid, session_id: Uuid) -> Result<(), AuthError> {
        self.sessions.revoke(user_id, session_id).await?;
        Ok(())
    }

    /// # Errors
    /// Returns [`AuthError::Store`] on persistence failure.
    #[instrument(skip(self))]
    pub async fn revoke_all(&self, user_id: Uuid) -> Result<u64, AuthError> {
        Ok(self.sessions.revoke_all(user_id).await?)
    }

    /// # Errors
    /// Returns [`AuthError::Store`] on persistence failure.
    pub async fn list_active(&self, user_id: Uuid) -> Result<Vec<SessionSummary>, AuthError> {
        Ok(self.sessions.list_active(user_id).await?)
    }

    /// Revoke any one of the user's sessions from the account-management surface.
    ///
    /// # Errors
    /// Returns [`AuthError::Store`] on persistence failure.
    #[instrument(skip(self))]
    pub async fn revoke_one(&self, user_id: Uuid, session_id: Uuid) -> Result<(), AuthError> {
        if self.sessions.revoke(user_id, session_id).await? {
            info!(%session_id, "session revoked by owner");
        }
        Ok(())
    }
}
