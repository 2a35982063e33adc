use crate::{
    api::handlers::{auth, health, oauth, sessions},
    auth::{
        Accounts, AuthConfig, AuthenticationGuard, ConnectTokens, OAuthFlow, PublicRoutes,
        SessionRotationEngine, StateSigner, require_auth, secret::Argon2Passwords,
    },
    store::{ConnectTokenStore, PgStore, SessionStore, UserDirectory},
};
use anyhow::{Context, Result, anyhow};
use axum::{
    Router,
    body::Body,
    extract::MatchedPath,
    http::{
        HeaderName, HeaderValue, Method, Request,
        header::{AUTHORIZATION, CONTENT_TYPE},
    },
    middleware,
    routing::{delete, get, post},
};
use sqlx::postgres::PgPoolOptions;
use std::{sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    request_id::PropagateRequestIdLayer,
    set_header::SetRequestHeaderLayer,
    trace::TraceLayer,
};
use tracing::{Span, info, info_span};
use ulid::Ulid;
use url::Url;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

pub mod handlers;
mod openapi;

pub use openapi::ApiDoc;

/// Shared handler state. Every component talks to storage through trait objects.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AuthConfig>,
    pub engine: SessionRotationEngine,
    pub accounts: Accounts,
    pub connect: ConnectTokens,
    pub oauth: OAuthFlow,
    sessions: Arc<dyn SessionStore>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &self.config)
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}

impl AppState {
    /// Wire every service against a single backend.
    ///
    /// # Errors
    /// Returns an error if the frontend base URL is invalid.
    pub fn new<S>(store: S, config: AuthConfig) -> Result<Self>
    where
        S: SessionStore + ConnectTokenStore + UserDirectory + Clone + 'static,
    {
        let config = Arc::new(config);
        let sessions: Arc<dyn SessionStore> = Arc::new(store.clone());
        let tokens: Arc<dyn ConnectTokenStore> = Arc::new(store.clone());
        let users: Arc<dyn UserDirectory> = Arc::new(store);

        let engine = SessionRotationEngine::from_config(Arc::clone(&sessions), &config);
        let accounts = Accounts::new(Arc::clone(&users), Arc::new(Argon2Passwords));
        let connect = ConnectTokens::new(tokens, config.connect_token_ttl_seconds());
        let oauth = OAuthFlow::new(
            StateSigner::new(config.state_secret(), config.oauth_state_ttl_seconds()),
            users,
            connect.clone(),
            config.frontend_base_url(),
        )?;

        Ok(Self {
            config,
            engine,
            accounts,
            connect,
            oauth,
            sessions,
        })
    }

    /// # Errors
    /// Returns an error when the backing store is unreachable.
    pub async fn ping(&self) -> Result<()> {
        self.sessions.ping().await
    }
}

/// Routes reachable without credentials.
#[must_use]
pub fn public_routes() -> PublicRoutes {
    PublicRoutes::new()
        .with(Method::GET, "/health")
        .with(Method::OPTIONS, "/health")
        .with(Method::POST, "/v1/auth/register")
        .with(Method::POST, "/v1/auth/login")
        .with(Method::POST, "/v1/auth/refresh")
        .with(Method::GET, "/v1/auth/oauth/:provider/state")
}

/// Build the application router. Every route passes through the guard, which
/// lets the [`public_routes`] through untouched.
pub fn router(state: AppState) -> Router {
    let guard = AuthenticationGuard::new(
        state.engine.clone(),
        Arc::clone(&state.config),
        public_routes(),
    );

    Router::new()
        .route("/health", get(health::health).options(health::health))
        .route("/v1/auth/register", post(auth::register))
        .route("/v1/auth/login", post(auth::login))
        .route("/v1/auth/refresh", post(auth::refresh))
        .route("/v1/auth/check-auth", get(auth::check_auth))
        .route("/v1/auth/logout", post(auth::logout))
        .route("/v1/auth/logout-all", post(auth::logout_all))
        .route("/v1/auth/methods", get(auth::methods))
        .route("/v1/auth/password", delete(auth::remove_password))
        .route("/v1/auth/sessions", get(sessions::list))
        .route("/v1/auth/sessions/:id", delete(sessions::revoke))
        .route("/v1/auth/oauth/:provider", delete(oauth::disconnect))
        .route("/v1/auth/oauth/:provider/state", get(oauth::state))
        .route(
            "/v1/auth/oauth/:provider/connect-token",
            post(oauth::connect_token),
        )
        .route_layer(middleware::from_fn_with_state(guard, require_auth))
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/api-docs/openapi.json", ApiDoc::openapi()))
}

/// Start the server
/// # Errors
/// Return error if failed to start the server
pub async fn new(port: u16, dsn: String, config: AuthConfig) -> Result<()> {
    let pool = PgPoolOptions::new()
        .min_connections(1)
        .max_connections(5)
        .max_lifetime(Duration::from_secs(60 * 2))
        .test_before_acquire(true)
        .connect(&dsn)
        .await
        .context("Failed to connect to database")?;

    let frontend_origin = frontend_origin(config.frontend_base_url())?;
    let cors = CorsLayer::new()
        .allow_headers([CONTENT_TYPE, AUTHORIZATION])
        .expose_headers([HeaderName::from_static(crate::auth::cookies::ACCESS_TOKEN_HEADER)])
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_origin(AllowOrigin::exact(frontend_origin))
        .allow_credentials(true);

    let state = AppState::new(PgStore::new(pool), config)?;

    let app = router(state).layer(
        ServiceBuilder::new()
            .layer(SetRequestHeaderLayer::if_not_present(
                HeaderName::from_static("x-request-id"),
                |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
            ))
            .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                "x-request-id",
            )))
            .layer(TraceLayer::new_for_http().make_span_with(make_span))
            .layer(cors),
    );

    let listener = TcpListener::bind(format!("::0:{port}")).await?;

    info!("Listening on [::]:{}", port);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {err}");
        return;
    }
    info!("Gracefully shutdown");
}

fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");
    let matched_path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.route = matched_path,
        request_id
    )
}

fn frontend_origin(frontend_base_url: &str) -> Result<HeaderValue> {
    let parsed = Url::parse(frontend_base_url)
        .with_context(|| format!("Invalid frontend base URL: {frontend_base_url}"))?;
    let host = parsed.host_str().ok_or_else(|| {
        anyhow!("Frontend base URL must include a valid host: {frontend_base_url}")
    })?;
    let port = parsed
        .port()
        .map_or_else(String::new, |port| format!(":{port}"));
    let origin = format!("{}://{}{}", parsed.scheme(), host, port);
    HeaderValue::from_str(&origin).context("Failed to build frontend origin header")
}
