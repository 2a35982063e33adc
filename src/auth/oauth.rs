//! Completion of redirect-based provider flows.
//!
//! The provider handshake itself (authorization code exchange, profile fetch)
//! happens elsewhere. This module starts a flow by signing a `state` value and
//! finishes it once a verified [`ExternalIdentity`] comes back with that state.

use anyhow::Context;
use std::sync::Arc;
use tracing::{info, instrument};
use url::Url;
use uuid::Uuid;

use super::{
    connect::ConnectTokens,
    error::AuthError,
    identity::{ExternalIdentity, Provider},
    state::{OAuthMode, OAuthState, StateSigner},
};
use crate::store::{UserDirectory, UserInsert, UserRecord};

#[derive(Debug)]
pub enum OAuthOutcome {
    /// Login or registration succeeded; the caller should issue a session.
    SignedIn { user: UserRecord, registered: bool },
    /// The identity was attached to an already signed-in account.
    Linked { user_id: Uuid },
}

#[derive(Clone)]
pub struct OAuthFlow {
    states: StateSigner,
    users: Arc<dyn UserDirectory>,
    connect: ConnectTokens,
    frontend_base_url: Url,
}

impl std::fmt::Debug for OAuthFlow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthFlow")
            .field("states", &self.states)
            .field("connect", &self.connect)
            .field("frontend_base_url", &self.frontend_base_url.as_str())
            .finish_non_exhaustive()
    }
}

impl OAuthFlow {
    /// # Errors
    /// Returns an error if `frontend_base_url` is not an absolute URL.
    pub fn new(
        states: StateSigner,
        users: Arc<dyn UserDirectory>,
        connect: ConnectTokens,
        frontend_base_url: &str,
    ) -> anyhow::Result<Self> {
        let frontend_base_url = Url::parse(frontend_base_url)
            .with_context(|| format!("Invalid frontend base URL: {frontend_base_url}"))?;
        Ok(Self {
            states,
            users,
            connect,
            frontend_base_url,
        })
    }

    /// Sign the `state` for a new round trip. Connect mode needs a connect token.
    ///
    /// # Errors
    /// [`AuthError::BadRequest`] when a connect flow has no token.
    pub fn start(
        &self,
        provider: Provider,
        mode: OAuthMode,
        token: Option<String>,
    ) -> Result<String, AuthError> {
        let token = match mode {
            OAuthMode::Connect => Some(
                token
                    .filter(|value| !value.is_empty())
                    .ok_or_else(|| AuthError::BadRequest("Connect token is required".to_string()))?,
            ),
            OAuthMode::Login | OAuthMode::Register => None,
        };
        self.states.sign(&OAuthState {
            mode,
            provider,
            token,
        })
    }

    /// Finish a flow started with [`start`](Self::start).
    ///
    /// # Errors
    /// - [`AuthError::Unauthenticated`]: bad or expired state, provider mismatch,
    ///   login with an unlinked identity, or an unusable connect token.
    /// - [`AuthError::Conflict`]: registration for an identity or email that
    ///   already exists, or linking an identity owned by someone else.
    #[instrument(skip_all, fields(provider = %identity.provider))]
    pub async fn complete(
        &self,
        state: &str,
        identity: &ExternalIdentity,
    ) -> Result<OAuthOutcome, AuthError> {
        let state = self.states.verify(state)?;
        if state.provider != identity.provider {
            return Err(AuthError::Unauthenticated);
        }

        match state.mode {
            OAuthMode::Login => {
                let user = self
                    .users
                    .find_user_by_identity(identity.provider, &identity.provider_user_id)
                    .await?
                    .ok_or(AuthError::Unauthenticated)?;
                Ok(OAuthOutcome::SignedIn {
                    user,
                    registered: false,
                })
            }
            OAuthMode::Register => match self.users.create_user_from_identity(identity).await? {
                UserInsert::Created(user) => {
                    info!(user_id = %user.id, "user registered via provider");
                    Ok(OAuthOutcome::SignedIn {
                        user,
                        registered: true,
                    })
                }
                UserInsert::Conflict => {
                    Err(AuthError::Conflict("Account already exists".to_string()))
                }
            },
            OAuthMode::Connect => {
                let token = state.token.ok_or(AuthError::Unauthenticated)?;
                let user_id = self.connect.consume(&token, identity).await?;
                Ok(OAuthOutcome::Linked { user_id })
            }
        }
    }

    /// Frontend location to send the browser to after [`complete`](Self::complete).
    #[must_use]
    pub fn redirect_url(&self, state: &str, result: &Result<OAuthOutcome, AuthError>) -> Url {
        let (path, error_code) = match result {
            Ok(OAuthOutcome::SignedIn { .. }) => ("/dashboard", None),
            Ok(OAuthOutcome::Linked { .. }) => ("/settings/security", None),
            Err(_) => match self.states.verify(state).map(|state| state.mode) {
                Ok(OAuthMode::Connect) => ("/settings/security", Some("UNAUTHORIZED")),
                Ok(OAuthMode::Register) => ("/signup", Some("EXIST")),
                Ok(OAuthMode::Login) => ("/login", Some("NOT_LINKED")),
                Err(_) => ("/login", Some("INVALID_STATE")),
            },
        };

        let mut url = self.frontend_base_url.clone();
        url.set_path(path);
        url.set_query(None);
        if let Some(code) = error_code {
            url.query_pairs_mut().append_pair("error_code", code);
        }
        url
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use anyhow::anyhow;

    fn identity(id: &str, email: &str) -> ExternalIdentity {
        ExternalIdentity {
            provider: Provider::Google,
            provider_user_id: id.to_string(),
            email: email.to_string(),
            display_name: "Grace".to_string(),
            avatar_url: None,
        }
    }

    fn flow() -> anyhow::Result<(OAuthFlow, MemoryStore)> {
        let store = MemoryStore::new();
        let connect = ConnectTokens::new(Arc::new(store.clone()), 300);
        let flow = OAuthFlow::new(
            StateSigner::new(b"oauth-state", 600),
            Arc::new(store.clone()),
            connect,
            "https://app.sessiongate.dev",
        )?;
        Ok((flow, store))
    }

    #[tokio::test]
    async fn register_then_login_with_identity() -> anyhow::Result<()> {
        let (flow, _) = flow()?;
        let grace = identity("g-42", "grace@example.com");

        let state = flow.start(Provider::Google, OAuthMode::Register, None)?;
        let registered = flow.complete(&state, &grace).await;
        let OAuthOutcome::SignedIn {
            user: created,
            registered: true,
        } = registered?
        else {
            return Err(anyhow!("expected registration"));
        };

        let state = flow.start(Provider::Google, OAuthMode::Login, None)?;
        let OAuthOutcome::SignedIn { user, .. } = flow.complete(&state, &grace).await? else {
            return Err(anyhow!("expected login"));
        };
        assert_eq!(user.id, created.id);

        let state = flow.start(Provider::Google, OAuthMode::Register, None)?;
        let again = flow.complete(&state, &grace).await;
        assert!(matches!(again, Err(AuthError::Conflict(_))));
        assert_eq!(
            flow.redirect_url(&state, &again).as_str(),
            "https://app.sessiongate.dev/signup?error_code=EXIST"
        );
        Ok(())
    }

    #[tokio::test]
    async fn login_with_unlinked_identity_fails() -> anyhow::Result<()> {
        let (flow, _) = flow()?;
        let state = flow.start(Provider::Google, OAuthMode::Login, None)?;
        let result = flow
            .complete(&state, &identity("g-1", "nobody@example.com"))
            .await;
        assert!(matches!(result, Err(AuthError::Unauthenticated)));
        assert_eq!(
            flow.redirect_url(&state, &result).as_str(),
            "https://app.sessiongate.dev/login?error_code=NOT_LINKED"
        );
        Ok(())
    }

    #[tokio::test]
    async fn connect_consumes_token() -> anyhow::Result<()> {
        let (flow, store) = flow()?;
        let UserInsert::Created(user) = store
            .create_user_with_password("Grace", "grace@example.com", "hash")
            .await?
        else {
            return Err(anyhow!("expected new user"));
        };

        assert!(matches!(
            flow.start(Provider::Google, OAuthMode::Connect, None),
            Err(AuthError::BadRequest(_))
        ));

        let token = flow.connect.create(user.id, Provider::Google).await?;
        let state = flow.start(Provider::Google, OAuthMode::Connect, Some(token))?;
        let result = flow
            .complete(&state, &identity("g-7", "grace@gmail.com"))
            .await;
        assert!(matches!(result, Ok(OAuthOutcome::Linked { user_id }) if user_id == user.id));
        assert_eq!(
            flow.redirect_url(&state, &result).as_str(),
            "https://app.sessiongate.dev/settings/security"
        );

        let replay = flow
            .complete(&state, &identity("g-8", "grace@gmail.com"))
            .await;
        assert!(matches!(replay, Err(AuthError::Unauthenticated)));
        Ok(())
    }

    #[tokio::test]
    async fn tampered_state_and_provider_mismatch_are_rejected() -> anyhow::Result<()> {
        let (flow, _) = flow()?;
        let state = flow.start(Provider::Apple, OAuthMode::Register, None)?;

        let mismatch = flow
            .complete(&state, &identity("g-1", "a@example.com"))
            .await;
        assert!(matches!(mismatch, Err(AuthError::Unauthenticated)));

        let tampered = format!("{state}x");
        let result = flow
            .complete(&tampered, &identity("g-1", "a@example.com"))
            .await;
        assert!(matches!(result, Err(AuthError::Unauthenticated)));
        assert_eq!(
            flow.redirect_url(&tampered, &result).as_str(),
            "https://app.sessiongate.dev/login?error_code=INVALID_STATE"
        );
        Ok(())
    }
}
