//! Random credential generation and at-rest hashing.
//!
//! Refresh secrets use a salted Argon2id hash: each row is checked against a
//! single candidate, so the slow KDF is paid once per request. Connect tokens
//! use an unsalted SHA-256 digest because the digest itself is the lookup key.

use anyhow::{Context, Result, anyhow};
use argon2::{
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier as _, password_hash::SaltString,
};
use base64ct::{Base64UrlUnpadded, Encoding};
use rand::{RngCore, rngs::OsRng};
use sha2::{Digest, Sha256};

const REFRESH_SECRET_BYTES: usize = 64;
const CONNECT_TOKEN_BYTES: usize = 32;

fn random_token(len: usize) -> Result<String> {
    let mut bytes = vec![0u8; len];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("failed to generate random token")?;
    Ok(Base64UrlUnpadded::encode_string(&bytes))
}

/// Create a new refresh secret. The raw value only ever goes into the cookie.
pub fn generate_refresh_secret() -> Result<String> {
    random_token(REFRESH_SECRET_BYTES)
}

/// Hash a refresh secret for storage on the session row.
pub fn hash_refresh_secret(secret: &str) -> Result<String> {
    argon2_hash(secret)
}

/// Check a presented refresh secret against the stored hash.
#[must_use]
pub fn verify_refresh_secret(hash: &str, secret: &str) -> bool {
    argon2_verify(hash, secret)
}

/// Create a new single-use account-linking token.
pub fn generate_connect_token() -> Result<String> {
    random_token(CONNECT_TOKEN_BYTES)
}

/// Digest a connect token so raw values never touch the database.
#[must_use]
pub fn hash_connect_token(token: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.finalize().to_vec()
}

fn argon2_hash(value: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(value.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|err| anyhow!("failed to hash secret: {err}"))
}

fn argon2_verify(hash: &str, value: &str) -> bool {
    PasswordHash::new(hash).is_ok_and(|parsed| {
        Argon2::default()
            .verify_password(value.as_bytes(), &parsed)
            .is_ok()
    })
}

/// Opaque password capability used by the login and registration flows.
pub trait PasswordVerifier: Send + Sync {
    /// # Errors
    /// Returns an error if hashing fails.
    fn hash(&self, password: &str) -> Result<String>;

    fn verify(&self, hash: &str, password: &str) -> bool;
}

#[derive(Clone, Debug, Default)]
pub struct Argon2Passwords;

impl PasswordVerifier for Argon2Passwords {
    fn hash(&self, password: &str) -> Result<String> {
        argon2_hash(password)
    }

    fn verify(&self, hash: &str, password: &str) -> bool {
        argon2_verify(hash, password)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_secret_has_expected_entropy() -> Result<()> {
        let secret = generate_refresh_secret()?;
        let decoded =
            Base64UrlUnpadded::decode_vec(&secret).map_err(|err| anyhow!("decode: {err}"))?;
        assert_eq!(decoded.len(), REFRESH_SECRET_BYTES);
        assert_ne!(secret, generate_refresh_secret()?);
        Ok(())
    }

    #[test]
    fn refresh_hash_is_salted_and_verifies() -> Result<()> {
        let secret = generate_refresh_secret()?;
        let first = hash_refresh_secret(&secret)?;
        let second = hash_refresh_secret(&secret)?;
        assert_ne!(first, second);
        assert!(verify_refresh_secret(&first, &secret));
        assert!(verify_refresh_secret(&second, &secret));
        assert!(!verify_refresh_secret(&first, "wrong"));
        Ok(())
    }

    #[test]
    fn verify_rejects_malformed_hash() {
        assert!(!verify_refresh_secret("not-a-phc-string", "secret"));
    }

    #[test]
    fn connect_token_hash_is_stable() -> Result<()> {
        let token = generate_connect_token()?;
        assert_eq!(hash_connect_token(&token), hash_connect_token(&token));
        assert_ne!(hash_connect_token(&token), hash_connect_token("other"));
        assert_eq!(hash_connect_token(&token).len(), 32);
        Ok(())
    }

    #[test]
    fn argon2_passwords_round_trip() -> Result<()> {
        let passwords = Argon2Passwords;
        let hash = passwords.hash("CorrectHorse1")?;
        assert!(passwords.verify(&hash, "CorrectHorse1"));
        assert!(!passwords.verify(&hash, "correcthorse1"));
        Ok(())
    }
}
