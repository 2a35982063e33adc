//! Authentication configuration.

use secrecy::{ExposeSecret, SecretString};

const DEFAULT_ACCESS_TTL_SECONDS: i64 = 5 * 60;
const DEFAULT_REFRESH_TTL_DAYS: i64 = 30;
const DEFAULT_CONNECT_TOKEN_TTL_SECONDS: i64 = 5 * 60;
const DEFAULT_OAUTH_STATE_TTL_SECONDS: i64 = 10 * 60;

#[derive(Clone)]
pub struct AuthConfig {
    frontend_base_url: String,
    access_secret: SecretString,
    state_secret: SecretString,
    access_ttl_seconds: i64,
    refresh_ttl_days: i64,
    connect_token_ttl_seconds: i64,
    oauth_state_ttl_seconds: i64,
    production: bool,
}

impl AuthConfig {
    #[must_use]
    pub fn new(
        frontend_base_url: String,
        access_secret: SecretString,
        state_secret: SecretString,
    ) -> Self {
        Self {
            frontend_base_url,
            access_secret,
            state_secret,
            access_ttl_seconds: DEFAULT_ACCESS_TTL_SECONDS,
            refresh_ttl_days: DEFAULT_REFRESH_TTL_DAYS,
            connect_token_ttl_seconds: DEFAULT_CONNECT_TOKEN_TTL_SECONDS,
            oauth_state_ttl_seconds: DEFAULT_OAUTH_STATE_TTL_SECONDS,
            production: false,
        }
    }

    #[must_use]
    pub fn with_access_ttl_seconds(mut self, seconds: i64) -> Self {
        self.access_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_refresh_ttl_days(mut self, days: i64) -> Self {
        self.refresh_ttl_days = days;
        self
    }

    #[must_use]
    pub fn with_connect_token_ttl_seconds(mut self, seconds: i64) -> Self {
        self.connect_token_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_oauth_state_ttl_seconds(mut self, seconds: i64) -> Self {
        self.oauth_state_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_production(mut self, production: bool) -> Self {
        self.production = production;
        self
    }

    #[must_use]
    pub fn frontend_base_url(&self) -> &str {
        &self.frontend_base_url
    }

    #[must_use]
    pub fn access_secret(&self) -> &[u8] {
        self.access_secret.expose_secret().as_bytes()
    }

    #[must_use]
    pub fn state_secret(&self) -> &[u8] {
        self.state_secret.expose_secret().as_bytes()
    }

    #[must_use]
    pub const fn access_ttl_seconds(&self) -> i64 {
        self.access_ttl_seconds
    }

    #[must_use]
    pub const fn refresh_ttl_days(&self) -> i64 {
        self.refresh_ttl_days
    }

    #[must_use]
    pub const fn refresh_ttl_seconds(&self) -> i64 {
        self.refresh_ttl_days * 24 * 60 * 60
    }

    #[must_use]
    pub const fn connect_token_ttl_seconds(&self) -> i64 {
        self.connect_token_ttl_seconds
    }

    #[must_use]
    pub const fn oauth_state_ttl_seconds(&self) -> i64 {
        self.oauth_state_ttl_seconds
    }

    /// Production mode marks cookies `Secure` and `SameSite=Strict`.
    #[must_use]
    pub const fn production(&self) -> bool {
        self.production
    }
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("frontend_base_url", &self.frontend_base_url)
            .field("access_secret", &"***")
            .field("state_secret", &"***")
            .field("access_ttl_seconds", &self.access_ttl_seconds)
            .field("refresh_ttl_days", &self.refresh_ttl_days)
            .field("connect_token_ttl_seconds", &self.connect_token_ttl_seconds)
            .field("oauth_state_ttl_seconds", &self.oauth_state_ttl_seconds)
            .field("production", &self.production)
            .finish()
    }
}
