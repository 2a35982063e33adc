//! Single-use tokens that bind an external identity to a signed-in account.

use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

use super::{
    error::AuthError,
    identity::{ExternalIdentity, Provider},
    secret::{generate_connect_token, hash_connect_token},
};
use crate::store::{ConnectToken, ConnectTokenStore, Redemption};

#[derive(Clone)]
pub struct ConnectTokens {
    tokens: Arc<dyn ConnectTokenStore>,
    ttl: Duration,
}

impl std::fmt::Debug for ConnectTokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectTokens")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl ConnectTokens {
    #[must_use]
    pub fn new(tokens: Arc<dyn ConnectTokenStore>, ttl_seconds: i64) -> Self {
        Self {
            tokens,
            ttl: Duration::seconds(ttl_seconds),
        }
    }

    /// Issue a token for `user_id`. The raw value is returned once and only its
    /// digest is stored.
    ///
    /// # Errors
    /// Returns [`AuthError::Store`] on generation or persistence failure.
    #[instrument(skip(self))]
    pub async fn create(&self, user_id: Uuid, provider: Provider) -> Result<String, AuthError> {
        let token = generate_connect_token()?;
        let record = ConnectToken {
            token_hash: hash_connect_token(&token),
            user_id,
            provider,
            expires_at: Utc::now() + self.ttl,
        };
        self.tokens.insert_connect_token(&record).await?;
        Ok(token)
    }

    /// Link `identity` to the token's owner and burn the token, as one
    /// atomic claim.
    ///
    /// An unknown or expired token, an identity from a different provider, or
    /// a conflicting link leaves the stored token untouched.
    ///
    /// # Errors
    /// [`AuthError::Unauthenticated`] for a bad token, [`AuthError::Conflict`]
    /// when the identity is already linked.
    #[instrument(skip(self, token, identity), fields(provider = %identity.provider))]
    pub async fn consume(
        &self,
        token: &str,
        identity: &ExternalIdentity,
    ) -> Result<Uuid, AuthError> {
        let token_hash = hash_connect_token(token);
        match self
            .tokens
            .redeem_connect_token(&token_hash, Utc::now(), identity)
            .await?
        {
            Redemption::Linked(user_id) => {
                info!(%user_id, "external identity linked");
                Ok(user_id)
            }
            Redemption::InvalidToken => Err(AuthError::Unauthenticated),
            Redemption::AlreadyLinked => Err(AuthError::Conflict(format!(
                "This {} account is already linked",
                identity.provider
            ))),
        }
    }
}
