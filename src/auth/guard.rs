//! Per-request authentication.
//!
//! Decision order:
//!
//! 1. Public route (method + matched path) → allow.
//! 2. Bearer token that passes [`TokenSigner::verify`](super::token::TokenSigner::verify)
//!    → allow with its principal. No store access.
//! 3. Bearer token (stale) plus refresh cookie → rotate, allow, and hand the new
//!    credentials back on the response.
//! 4. Anything else → `401` and clear the credential cookies.

use axum::{
    async_trait,
    extract::{FromRequestParts, MatchedPath, Request, State},
    http::{
        Extensions, HeaderMap, HeaderName, HeaderValue, Method, header::SET_COOKIE,
        request::Parts,
    },
    middleware::Next,
    response::{IntoResponse, Response},
};
use secrecy::{ExposeSecret, SecretString};
use std::{collections::HashSet, sync::Arc};
use tracing::{debug, error};

use super::{
    config::AuthConfig,
    cookies::{
        ACCESS_TOKEN_HEADER, REFRESH_COOKIE_NAME, clear_cookies, extract_bearer_token,
        read_cookie, refresh_cookie, session_cookie,
    },
    engine::SessionRotationEngine,
    error::AuthError,
    session::Principal,
    token::AccessClaims,
};

/// Routes reachable without credentials, keyed by method and route template
/// (for example `("POST", "/v1/auth/login")`).
#[derive(Clone, Debug, Default)]
pub struct PublicRoutes {
    routes: HashSet<(Method, String)>,
}

impl PublicRoutes {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, method: Method, route: &str) -> Self {
        self.routes.insert((method, route.to_string()));
        self
    }

    #[must_use]
    pub fn contains(&self, method: &Method, route: &str) -> bool {
        self.routes.contains(&(method.clone(), route.to_string()))
    }
}

#[derive(Debug)]
pub enum GuardOutcome {
    Public,
    Authenticated(Principal),
    /// The access token was stale and the session was rotated.
    Rotated {
        principal: Principal,
        access_token: String,
        refresh_secret: SecretString,
    },
}

impl From<AccessClaims> for Principal {
    fn from(claims: AccessClaims) -> Self {
        Self {
            user_id: claims.sub,
            session_id: claims.sid,
            role: claims.role,
        }
    }
}

#[derive(Clone, Debug)]
pub struct AuthenticationGuard {
    engine: SessionRotationEngine,
    config: Arc<AuthConfig>,
    public: Arc<PublicRoutes>,
}

impl AuthenticationGuard {
    #[must_use]
    pub fn new(
        engine: SessionRotationEngine,
        config: Arc<AuthConfig>,
        public: PublicRoutes,
    ) -> Self {
        Self {
            engine,
            config,
            public: Arc::new(public),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &Arc<AuthConfig> {
        &self.config
    }

    /// Decide whether a request may proceed.
    ///
    /// # Errors
    /// Always [`AuthError::Unauthenticated`]; the underlying reason is only logged.
    pub async fn authenticate(
        &self,
        method: &Method,
        route: &str,
        headers: &HeaderMap,
    ) -> Result<GuardOutcome, AuthError> {
        if self.public.contains(method, route) {
            return Ok(GuardOutcome::Public);
        }

        let access_token = extract_bearer_token(headers);
        if let Some(token) = access_token.as_deref() {
            match self.engine.signer().verify(token) {
                Ok(claims) => return Ok(GuardOutcome::Authenticated(claims.into())),
                Err(err) => debug!("access token rejected: {err}"),
            }
        }

        let (Some(access_token), Some(refresh_secret)) =
            (access_token, read_cookie(headers, REFRESH_COOKIE_NAME))
        else {
            return Err(AuthError::Unauthenticated);
        };

        match self.engine.rotate(&access_token, &refresh_secret).await {
            Ok(rotation) => Ok(GuardOutcome::Rotated {
                principal: Principal {
                    user_id: rotation.user_id,
                    session_id: rotation.session_id,
                    role: rotation.role,
                },
                access_token: rotation.access_token,
                refresh_secret: rotation.refresh_secret,
            }),
            Err(AuthError::Store(err)) => {
                error!("Session rotation failed: {err:#}");
                Err(AuthError::Unauthenticated)
            }
            Err(err) => {
                debug!("session rotation rejected: {err}");
                Err(AuthError::Unauthenticated)
            }
        }
    }
}

/// Axum middleware wrapping [`AuthenticationGuard::authenticate`].
///
/// Install with `route_layer` so the matched route template is available.
pub async fn require_auth(
    State(guard): State<AuthenticationGuard>,
    mut request: Request,
    next: Next,
) -> Response {
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str)
        .to_string();

    let outcome = guard
        .authenticate(request.method(), &route, request.headers())
        .await;

    match outcome {
        Ok(GuardOutcome::Public) => next.run(request).await,
        Ok(GuardOutcome::Authenticated(principal)) => {
            request.extensions_mut().insert(principal);
            next.run(request).await
        }
        Ok(GuardOutcome::Rotated {
            principal,
            access_token,
            refresh_secret,
        }) => {
            let session_id = principal.session_id.to_string();
            request.extensions_mut().insert(principal);
            let mut response = next.run(request).await;
            if sets_refresh_cookie(response.headers()) {
                debug!("handler replaced the credential cookies, not re-issuing");
                return response;
            }
            if let Err(err) = attach_credentials(
                response.headers_mut(),
                &guard.config,
                &access_token,
                &refresh_secret,
                &session_id,
            ) {
                error!("Failed to attach rotated credentials: {err}");
            }
            response
        }
        Err(err) => unauthenticated(&guard.config, err),
    }
}

/// Whether a handler already wrote (or cleared) the refresh cookie, as logout does.
fn sets_refresh_cookie(headers: &HeaderMap) -> bool {
    let prefix = format!("{REFRESH_COOKIE_NAME}=");
    headers
        .get_all(SET_COOKIE)
        .iter()
        .any(|value| value.as_bytes().starts_with(prefix.as_bytes()))
}

/// Write a fresh access token header and the refresh/sid cookies.
///
/// # Errors
/// Returns an error if a value is not a valid header value.
pub fn attach_credentials(
    headers: &mut HeaderMap,
    config: &AuthConfig,
    access_token: &str,
    refresh_secret: &SecretString,
    session_id: &str,
) -> Result<(), axum::http::header::InvalidHeaderValue> {
    headers.insert(
        HeaderName::from_static(ACCESS_TOKEN_HEADER),
        HeaderValue::from_str(access_token)?,
    );
    headers.append(
        SET_COOKIE,
        refresh_cookie(config, refresh_secret.expose_secret())?,
    );
    headers.append(SET_COOKIE, session_cookie(config, session_id)?);
    Ok(())
}

/// Generic `401` that also expires the credential cookies.
pub fn unauthenticated(config: &AuthConfig, err: AuthError) -> Response {
    let mut response = err.into_response();
    match clear_cookies(config) {
        Ok(cookies) => {
            for cookie in cookies {
                response.headers_mut().append(SET_COOKIE, cookie);
            }
        }
        Err(err) => error!("Failed to build cookie reset: {err}"),
    }
    response
}

/// Principal attached by [`require_auth`], if any.
#[must_use]
pub fn current_principal(extensions: &Extensions) -> Option<Principal> {
    extensions.get::<Principal>().cloned()
}

#[async_trait]
impl<S> FromRequestParts<S> for Principal
where
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        current_principal(&parts.extensions).ok_or(AuthError::Unauthenticated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        auth::{session::DeviceMeta, token::TokenSigner},
        store::MemoryStore,
    };
    use axum::{
        Json, Router,
        body::{Body, to_bytes},
        http::{
            StatusCode,
            header::{AUTHORIZATION, COOKIE},
        },
        middleware,
        routing::get,
    };
    use chrono::{Duration, Utc};
    use tower::ServiceExt;
    use uuid::Uuid;

    fn config() -> Arc<AuthConfig> {
        Arc::new(AuthConfig::new(
            "http://localhost:5173".to_string(),
            SecretString::from("guard-access-secret".to_string()),
            SecretString::from("guard-state-secret".to_string()),
        ))
    }

    fn guard() -> (AuthenticationGuard, MemoryStore) {
        let store = MemoryStore::new();
        let config = config();
        let engine = SessionRotationEngine::from_config(Arc::new(store.clone()), &config);
        let public = PublicRoutes::new().with(Method::GET, "/open");
        (AuthenticationGuard::new(engine, config, public), store)
    }

    fn headers(access: Option<&str>, refresh: Option<&str>) -> anyhow::Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        if let Some(token) = access {
            headers.insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {token}"))?);
        }
        if let Some(secret) = refresh {
            headers.insert(COOKIE, HeaderValue::from_str(&format!("refresh={secret}"))?);
        }
        Ok(headers)
    }

    fn stale(guard: &AuthenticationGuard, user: Uuid, session: Uuid) -> anyhow::Result<String> {
        Ok(guard.engine.signer().sign_at(
            user,
            session,
            "user",
            Utc::now() - Duration::hours(1),
        )?)
    }

    #[tokio::test]
    async fn public_route_needs_no_credentials() -> anyhow::Result<()> {
        let (guard, _) = guard();
        let outcome = guard
            .authenticate(&Method::GET, "/open", &HeaderMap::new())
            .await?;
        assert!(matches!(outcome, GuardOutcome::Public));

        let closed = guard
            .authenticate(&Method::POST, "/open", &HeaderMap::new())
            .await;
        assert!(matches!(closed, Err(AuthError::Unauthenticated)));
        Ok(())
    }

    #[tokio::test]
    async fn valid_bearer_is_accepted_without_store_lookup() -> anyhow::Result<()> {
        let (guard, store) = guard();
        let token = guard
            .engine
            .signer()
            .sign(Uuid::now_v7(), Uuid::now_v7(), "admin")?;

        let outcome = guard
            .authenticate(&Method::GET, "/me", &headers(Some(&token), None)?)
            .await?;
        let GuardOutcome::Authenticated(principal) = outcome else {
            anyhow::bail!("expected fast path");
        };
        assert_eq!(principal.role, "admin");
        assert_eq!(store.session_count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn stale_bearer_with_refresh_cookie_rotates() -> anyhow::Result<()> {
        let (guard, _) = guard();
        let user = Uuid::now_v7();
        let issued = guard.engine.login(user, "user", DeviceMeta::default()).await?;
        let token = stale(&guard, user, issued.session_id)?;

        let outcome = guard
            .authenticate(
                &Method::GET,
                "/me",
                &headers(Some(&token), Some(issued.refresh_secret.expose_secret()))?,
            )
            .await?;
        let GuardOutcome::Rotated { principal, .. } = outcome else {
            anyhow::bail!("expected rotation");
        };
        assert_eq!(principal.user_id, user);
        assert_ne!(principal.session_id, issued.session_id);
        Ok(())
    }

    #[tokio::test]
    async fn missing_half_of_the_pair_is_rejected() -> anyhow::Result<()> {
        let (guard, _) = guard();
        let user = Uuid::now_v7();
        let issued = guard.engine.login(user, "user", DeviceMeta::default()).await?;
        let token = stale(&guard, user, issued.session_id)?;

        let no_cookie = guard
            .authenticate(&Method::GET, "/me", &headers(Some(&token), None)?)
            .await;
        assert!(matches!(no_cookie, Err(AuthError::Unauthenticated)));

        let no_token = guard
            .authenticate(
                &Method::GET,
                "/me",
                &headers(None, Some(issued.refresh_secret.expose_secret()))?,
            )
            .await;
        assert!(matches!(no_token, Err(AuthError::Unauthenticated)));

        assert_eq!(guard.engine.list_active(user).await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn forged_bearer_collapses_to_unauthenticated() -> anyhow::Result<()> {
        let (guard, _) = guard();
        let forged =
            TokenSigner::new(b"attacker", 300).sign(Uuid::now_v7(), Uuid::now_v7(), "admin")?;
        let result = guard
            .authenticate(&Method::GET, "/me", &headers(Some(&forged), Some("x"))?)
            .await;
        assert!(matches!(result, Err(AuthError::Unauthenticated)));
        Ok(())
    }

    fn app(guard: AuthenticationGuard) -> Router {
        Router::new()
            .route(
                "/me",
                get(|principal: Principal| async move { Json(principal) }),
            )
            .route("/open", get(|| async { "open" }))
            .route_layer(middleware::from_fn_with_state(guard, require_auth))
    }

    #[tokio::test]
    async fn middleware_returns_rotated_credentials() -> anyhow::Result<()> {
        let (guard, _) = guard();
        let user = Uuid::now_v7();
        let issued = guard.engine.login(user, "user", DeviceMeta::default()).await?;
        let token = stale(&guard, user, issued.session_id)?;

        let request = axum::http::Request::builder()
            .uri("/me")
            .header(AUTHORIZATION, format!("Bearer {token}"))
            .header(
                COOKIE,
                format!("refresh={}", issued.refresh_secret.expose_secret()),
            )
            .body(Body::empty())?;
        let response = app(guard.clone()).oneshot(request).await?;

        assert_eq!(response.status(), StatusCode::OK);
        let new_token = response
            .headers()
            .get(ACCESS_TOKEN_HEADER)
            .ok_or_else(|| anyhow::anyhow!("missing access token header"))?
            .to_str()?
            .to_string();
        let claims = guard.engine.signer().verify(&new_token)?;
        let cookies: Vec<_> = response.headers().get_all(SET_COOKIE).iter().collect();
        assert_eq!(cookies.len(), 2);
        assert!(cookies[0].to_str()?.starts_with("refresh="));
        assert_eq!(
            cookies[1].to_str()?,
            session_cookie(&guard.config, &claims.sid.to_string())?.to_str()?
        );

        let body = to_bytes(response.into_body(), usize::MAX).await?;
        let principal: serde_json::Value = serde_json::from_slice(&body)?;
        assert_eq!(principal["session_id"], claims.sid.to_string());
        Ok(())
    }

    #[tokio::test]
    async fn middleware_rejects_and_clears_cookies() -> anyhow::Result<()> {
        let (guard, _) = guard();
        let request = axum::http::Request::builder()
            .uri("/me")
            .header(COOKIE, "refresh=stolen")
            .body(Body::empty())?;
        let response = app(guard).oneshot(request).await?;

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let cookies: Vec<_> = response.headers().get_all(SET_COOKIE).iter().collect();
        assert_eq!(cookies.len(), 2);
        assert!(cookies.iter().all(|c| c.to_str().is_ok_and(|v| v.contains("Max-Age=0"))));
        Ok(())
    }

    #[tokio::test]
    async fn middleware_lets_public_routes_through() -> anyhow::Result<()> {
        let (guard, _) = guard();
        let request = axum::http::Request::builder().uri("/open").body(Body::empty())?;
        let response = app(guard).oneshot(request).await?;
        assert_eq!(response.status(), StatusCode::OK);
        Ok(())
    }
}
