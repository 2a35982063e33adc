//! Access token signing and verification (HS256 JWT).
//!
//! Signature validity and temporal validity are checked independently:
//! [`TokenSigner::verify`] enforces both, while
//! [`TokenSigner::verify_ignoring_expiry`] only enforces the signature and is
//! reserved for the rotation path, which needs the session id of a stale token.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{
    Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode, errors::ErrorKind,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

const ACCESS_TOKEN_TYPE: &str = "access";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("invalid signature")]
    InvalidSignature,
    #[error("token expired")]
    Expired,
    #[error("token encoding failed: {0}")]
    Encoding(String),
}

/// Signed claim set carried by an access token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessClaims {
    pub sub: Uuid,
    pub sid: Uuid,
    pub role: String,
    pub typ: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Clone)]
pub struct TokenSigner {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
}

impl std::fmt::Debug for TokenSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSigner")
            .field("keys", &"***")
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl TokenSigner {
    #[must_use]
    pub fn new(secret: &[u8], ttl_seconds: i64) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            ttl: Duration::seconds(ttl_seconds),
        }
    }

    #[must_use]
    pub const fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Sign an access token for a session, valid from now for the configured TTL.
    ///
    /// # Errors
    /// Returns [`TokenError::Encoding`] if the claims cannot be serialized.
    pub fn sign(&self, user_id: Uuid, session_id: Uuid, role: &str) -> Result<String, TokenError> {
        self.sign_at(user_id, session_id, role, Utc::now())
    }

    /// Sign an access token as if issued at `issued_at`.
    ///
    /// # Errors
    /// Returns [`TokenError::Encoding`] if the claims cannot be serialized.
    pub fn sign_at(
        &self,
        user_id: Uuid,
        session_id: Uuid,
        role: &str,
        issued_at: DateTime<Utc>,
    ) -> Result<String, TokenError> {
        let claims = AccessClaims {
            sub: user_id,
            sid: session_id,
            role: role.to_string(),
            typ: ACCESS_TOKEN_TYPE.to_string(),
            iat: issued_at.timestamp(),
            exp: (issued_at + self.ttl).timestamp(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|err| TokenError::Encoding(err.to_string()))
    }

    /// Verify signature and expiry.
    ///
    /// # Errors
    /// Returns [`TokenError::InvalidSignature`] or [`TokenError::Expired`].
    pub fn verify(&self, token: &str) -> Result<AccessClaims, TokenError> {
        self.decode(token, true)
    }

    /// Verify the signature only; an expired token is still accepted.
    ///
    /// # Errors
    /// Returns [`TokenError::InvalidSignature`] when the token is malformed or forged.
    pub fn verify_ignoring_expiry(&self, token: &str) -> Result<AccessClaims, TokenError> {
        self.decode(token, false)
    }

    fn decode(&self, token: &str, validate_exp: bool) -> Result<AccessClaims, TokenError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.validate_exp = validate_exp;
        validation.set_required_spec_claims(&["exp", "sub"]);

        let data = decode::<AccessClaims>(token, &self.decoding, &validation).map_err(|err| {
            match err.kind() {
                ErrorKind::ExpiredSignature => TokenError::Expired,
                _ => TokenError::InvalidSignature,
            }
        })?;

        if data.claims.typ != ACCESS_TOKEN_TYPE {
            return Err(TokenError::InvalidSignature);
        }

        Ok(data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> TokenSigner {
        TokenSigner::new(b"access-secret-for-tests", 300)
    }

    #[test]
    fn sign_then_verify_returns_claims() {
        let signer = signer();
        let user_id = Uuid::new_v4();
        let session_id = Uuid::new_v4();
        let token = signer.sign(user_id, session_id, "user").unwrap();

        let claims = signer.verify(&token).unwrap();
        assert_eq!(claims.sub, user_id);
        assert_eq!(claims.sid, session_id);
        assert_eq!(claims.role, "user");
        assert_eq!(claims.exp - claims.iat, 300);
    }

    #[test]
    fn expired_token_fails_verify_but_passes_ignoring_expiry() {
        let signer = signer();
        let user_id = Uuid::new_v4();
        let session_id = Uuid::new_v4();
        let token = signer
            .sign_at(user_id, session_id, "admin", Utc::now() - Duration::hours(1))
            .unwrap();

        assert_eq!(signer.verify(&token), Err(TokenError::Expired));

        let claims = signer.verify_ignoring_expiry(&token).unwrap();
        assert_eq!(claims.sid, session_id);
        assert_eq!(claims.role, "admin");
    }

    #[test]
    fn bad_signature_fails_regardless_of_expiry() {
        let signer = signer();
        let other = TokenSigner::new(b"some-other-secret", 300);
        let fresh = other.sign(Uuid::new_v4(), Uuid::new_v4(), "user").unwrap();
        let stale = other
            .sign_at(
                Uuid::new_v4(),
                Uuid::new_v4(),
                "user",
                Utc::now() - Duration::hours(2),
            )
            .unwrap();

        for token in [fresh, stale] {
            assert_eq!(
                signer.verify_ignoring_expiry(&token),
                Err(TokenError::InvalidSignature)
            );
            assert!(signer.verify(&token).is_err());
        }
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let signer = signer();
        let token = signer.sign(Uuid::new_v4(), Uuid::new_v4(), "user").unwrap();
        let mut parts: Vec<&str> = token.split('.').collect();
        let forged = signer.sign(Uuid::new_v4(), Uuid::new_v4(), "admin").unwrap();
        let forged_payload = forged.split('.').nth(1).unwrap().to_string();
        parts[1] = &forged_payload;
        let tampered = parts.join(".");

        assert_eq!(
            signer.verify_ignoring_expiry(&tampered),
            Err(TokenError::InvalidSignature)
        );
    }

    #[test]
    fn garbage_is_invalid_signature() {
        assert_eq!(
            signer().verify("not.a.token"),
            Err(TokenError::InvalidSignature)
        );
        assert_eq!(signer().verify(""), Err(TokenError::InvalidSignature));
    }
}
