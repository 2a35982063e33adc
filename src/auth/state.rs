//! Signed OAuth `state` values carried through a provider redirect.
//!
//! Same signing construction as the access token but a separate key, a separate
//! token type, and a short lifetime. Any tampering or expiry is reported as
//! [`AuthError::Unauthenticated`].

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::{error::AuthError, identity::Provider};

const STATE_TOKEN_TYPE: &str = "oauth_state";

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum OAuthMode {
    Login,
    Register,
    Connect,
}

/// Payload carried through the redirect round trip.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct OAuthState {
    pub mode: OAuthMode,
    pub provider: Provider,
    /// Connect token, present only in [`OAuthMode::Connect`].
    pub token: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StateClaims {
    #[serde(flatten)]
    state: OAuthState,
    typ: String,
    iat: i64,
    exp: i64,
}

#[derive(Clone)]
pub struct StateSigner {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
}

impl std::fmt::Debug for StateSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateSigner")
            .field("keys", &"***")
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl StateSigner {
    #[must_use]
    pub fn new(secret: &[u8], ttl_seconds: i64) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            ttl: Duration::seconds(ttl_seconds),
        }
    }

    /// # Errors
    /// Returns an error if the payload cannot be encoded.
    pub fn sign(&self, state: &OAuthState) -> Result<String, AuthError> {
        self.sign_at(state, Utc::now())
    }

    /// # Errors
    /// Returns an error if the payload cannot be encoded.
    pub fn sign_at(
        &self,
        state: &OAuthState,
        issued_at: DateTime<Utc>,
    ) -> Result<String, AuthError> {
        let claims = StateClaims {
            state: state.clone(),
            typ: STATE_TOKEN_TYPE.to_string(),
            iat: issued_at.timestamp(),
            exp: (issued_at + self.ttl).timestamp(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|err| AuthError::Store(anyhow::anyhow!("failed to sign state: {err}")))
    }

    /// # Errors
    /// Returns [`AuthError::Unauthenticated`] on a bad signature, wrong token
    /// type, or an expired state.
    pub fn verify(&self, value: &str) -> Result<OAuthState, AuthError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp"]);

        let data = decode::<StateClaims>(value, &self.decoding, &validation)
            .map_err(|_| AuthError::Unauthenticated)?;

        if data.claims.typ != STATE_TOKEN_TYPE {
            return Err(AuthError::Unauthenticated);
        }

        Ok(data.claims.state)
    }
}
