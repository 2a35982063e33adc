//! External identity providers.
//!
//! The provider set is closed: unknown provider names are rejected at the
//! boundary instead of being carried inward as opaque payloads.

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use utoipa::ToSchema;

use super::error::AuthError;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Google,
    Apple,
}

impl Provider {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Google => "google",
            Self::Apple => "apple",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = AuthError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "google" => Ok(Self::Google),
            "apple" => Ok(Self::Apple),
            other => Err(AuthError::BadRequest(format!(
                "Unsupported provider: {other}"
            ))),
        }
    }
}

/// Identity asserted by a provider after its own handshake completed.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ExternalIdentity {
    pub provider: Provider,
    pub provider_user_id: String,
    pub email: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_parses_known_names() {
        assert_eq!("google".parse::<Provider>().ok(), Some(Provider::Google));
        assert_eq!(" Apple ".parse::<Provider>().ok(), Some(Provider::Apple));
    }

    #[test]
    fn provider_rejects_unknown_names() {
        assert!(matches!(
            "github".parse::<Provider>(),
            Err(AuthError::BadRequest(_))
        ));
    }

    #[test]
    fn identity_rejects_unknown_provider_payload() {
        let payload = serde_json::json!({
            "provider": "myspace",
            "provider_user_id": "42",
            "email": "a@example.com",
            "display_name": "A",
            "avatar_url": null
        });
        assert!(serde_json::from_value::<ExternalIdentity>(payload).is_err());
    }
}
