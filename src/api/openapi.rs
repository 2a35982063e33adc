use crate::{
    api::handlers::{
        AccessTokenResponse, OkResponse, SessionResponse, UserProfile, auth, health,
        oauth::{self, ConnectTokenResponse, StateResponse},
        sessions,
    },
    auth::{OAuthMode, Provider, Registration, SessionSummary},
    store::AuthMethods,
};
use utoipa::{
    Modify, OpenApi,
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
};

#[derive(OpenApi)]
#[openapi(
    paths(
        health::health,
        auth::register,
        auth::login,
        auth::refresh,
        auth::check_auth,
        auth::logout,
        auth::logout_all,
        auth::methods,
        auth::remove_password,
        sessions::list,
        sessions::revoke,
        oauth::state,
        oauth::connect_token,
        oauth::disconnect,
    ),
    components(
        schemas(
            health::Health,
            auth::LoginRequest,
            Registration,
            SessionResponse,
            AccessTokenResponse,
            UserProfile,
            OkResponse,
            AuthMethods,
            SessionSummary,
            Provider,
            OAuthMode,
            StateResponse,
            ConnectTokenResponse,
        )
    ),
    modifiers(&BearerAuth),
    tags(
        (name = "health", description = "Service health"),
        (name = "auth", description = "Sign-in, refresh and sign-out"),
        (name = "sessions", description = "Session management for the signed-in user"),
        (name = "oauth", description = "Identity provider linking"),
    )
)]
pub struct ApiDoc;

/// Access tokens travel as `Authorization: Bearer <jwt>`.
struct BearerAuth;

impl Modify for BearerAuth {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn documents_every_route() {
        let doc = ApiDoc::openapi();
        let paths: Vec<&str> = doc.paths.paths.keys().map(String::as_str).collect();
        for expected in [
            "/health",
            "/v1/auth/login",
            "/v1/auth/refresh",
            "/v1/auth/sessions/{id}",
            "/v1/auth/oauth/{provider}/state",
            "/v1/auth/oauth/{provider}/connect-token",
        ] {
            assert!(paths.contains(&expected), "missing {expected}");
        }
        assert_eq!(doc.info.title, env!("CARGO_PKG_NAME"));
    }

    #[test]
    fn declares_bearer_scheme() {
        let doc = ApiDoc::openapi();
        let schemes = doc
            .components
            .map(|components| components.security_schemes)
            .unwrap_or_default();
        assert!(schemes.contains_key("bearer"));
    }
}
