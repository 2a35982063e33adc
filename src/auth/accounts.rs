//! Password accounts and authentication-method management.

use regex::Regex;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, instrument};
use utoipa::ToSchema;
use uuid::Uuid;

use super::{error::AuthError, identity::Provider, secret::PasswordVerifier};
use crate::store::{AuthMethods, UserDirectory, UserInsert, UserRecord};

const NAME_MIN: usize = 2;
const NAME_MAX: usize = 64;
const PASSWORD_MIN: usize = 8;
const PASSWORD_MAX: usize = 64;

#[derive(Clone, Debug, Deserialize, ToSchema)]
pub struct Registration {
    pub name: String,
    pub email: String,
    pub password: String,
    pub password_confirmation: String,
}

#[must_use]
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

#[must_use]
pub fn valid_email(email: &str) -> bool {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").is_ok_and(|regex| regex.is_match(email))
}

fn bad_request(message: &str) -> AuthError {
    AuthError::BadRequest(message.to_string())
}

/// Field rules applied before any store access.
///
/// # Errors
/// [`AuthError::BadRequest`] naming the first failing rule.
pub fn validate_registration(registration: &Registration) -> Result<(), AuthError> {
    let name_len = registration.name.trim().chars().count();
    if name_len == 0 {
        return Err(bad_request("Name is required"));
    }
    if name_len < NAME_MIN {
        return Err(bad_request("Name must be at least 2 characters"));
    }
    if name_len > NAME_MAX {
        return Err(bad_request("Name must be at most 64 characters"));
    }

    if !valid_email(&normalize_email(&registration.email)) {
        return Err(bad_request("Invalid email format"));
    }

    let password = &registration.password;
    let password_len = password.chars().count();
    if password_len < PASSWORD_MIN {
        return Err(bad_request("Password must be at least 8 characters"));
    }
    if password_len > PASSWORD_MAX {
        return Err(bad_request("Password must be at most 64 characters"));
    }
    if !password.chars().any(|c| c.is_ascii_lowercase()) {
        return Err(bad_request("Password must contain lowercase letter"));
    }
    if !password.chars().any(|c| c.is_ascii_uppercase()) {
        return Err(bad_request("Password must contain uppercase letter"));
    }
    if !password.chars().any(|c| c.is_ascii_digit()) {
        return Err(bad_request("Password must contain number"));
    }
    if registration.password_confirmation != *password {
        return Err(bad_request("Passwords do not match"));
    }
    Ok(())
}

#[derive(Clone)]
pub struct Accounts {
    users: Arc<dyn UserDirectory>,
    passwords: Arc<dyn PasswordVerifier>,
}

impl std::fmt::Debug for Accounts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Accounts").finish_non_exhaustive()
    }
}

impl Accounts {
    #[must_use]
    pub fn new(users: Arc<dyn UserDirectory>, passwords: Arc<dyn PasswordVerifier>) -> Self {
        Self { users, passwords }
    }

    /// # Errors
    /// [`AuthError::BadRequest`] for invalid input, [`AuthError::Conflict`] if
    /// the email is taken.
    #[instrument(skip_all)]
    pub async fn register(&self, registration: &Registration) -> Result<UserRecord, AuthError> {
        validate_registration(registration)?;
        let email = normalize_email(&registration.email);
        let hash = self.passwords.hash(&registration.password)?;

        match self
            .users
            .create_user_with_password(registration.name.trim(), &email, &hash)
            .await?
        {
            UserInsert::Created(user) => {
                info!(user_id = %user.id, "user registered");
                Ok(user)
            }
            UserInsert::Conflict => Err(AuthError::Conflict("Email already exists".to_string())),
        }
    }

    /// Check an email/password pair.
    ///
    /// # Errors
    /// [`AuthError::Unauthenticated`] for every credential failure, including
    /// accounts without a password.
    #[instrument(skip_all)]
    pub async fn authenticate(&self, email: &str, password: &str) -> Result<UserRecord, AuthError> {
        let user = self
            .users
            .find_user_by_email(&normalize_email(email))
            .await?
            .ok_or(AuthError::Unauthenticated)?;
        let Some(hash) = user.password_hash.as_deref() else {
            return Err(AuthError::Unauthenticated);
        };
        if !self.passwords.verify(hash, password) {
            return Err(AuthError::Unauthenticated);
        }
        Ok(user)
    }

    /// # Errors
    /// [`AuthError::NotFound`] if the user no longer exists.
    pub async fn find(&self, user_id: Uuid) -> Result<UserRecord, AuthError> {
        self.users
            .find_user_by_id(user_id)
            .await?
            .ok_or(AuthError::NotFound)
    }

    /// # Errors
    /// [`AuthError::NotFound`] if the user no longer exists.
    pub async fn methods(&self, user_id: Uuid) -> Result<AuthMethods, AuthError> {
        self.users
            .auth_methods(user_id)
            .await?
            .ok_or(AuthError::NotFound)
    }

    /// # Errors
    /// [`AuthError::Conflict`] when the password is the last remaining method.
    #[instrument(skip(self))]
    pub async fn remove_password(&self, user_id: Uuid) -> Result<(), AuthError> {
        let methods = self.methods(user_id).await?;
        if !methods.has_password {
            return Err(bad_request("Password is not set"));
        }
        if methods.count() <= 1 {
            return Err(AuthError::Conflict(
                "Cannot remove last auth method".to_string(),
            ));
        }
        self.users.clear_password(user_id).await?;
        info!("password removed");
        Ok(())
    }

    /// # Errors
    /// [`AuthError::Conflict`] when the provider is the last remaining method.
    #[instrument(skip(self))]
    pub async fn disconnect(&self, user_id: Uuid, provider: Provider) -> Result<(), AuthError> {
        let methods = self.methods(user_id).await?;
        if !methods.providers.contains(&provider) {
            return Err(AuthError::BadRequest(format!("{provider} is not connected")));
        }
        if methods.count() <= 1 {
            return Err(AuthError::Conflict(
                "Cannot remove last auth method".to_string(),
            ));
        }
        self.users.unlink_provider(user_id, provider).await?;
        info!("provider disconnected");
        Ok(())
    }
}
