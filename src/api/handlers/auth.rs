use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};
use utoipa::ToSchema;
use uuid::Uuid;

use super::{
    AccessTokenResponse, OkResponse, SessionResponse, UserProfile, cleared_cookies,
    issued_cookies, session_cookies,
};
use crate::{
    api::AppState,
    auth::{
        AuthError, Principal, Registration,
        cookies::{REFRESH_COOKIE_NAME, SESSION_COOKIE_NAME, read_cookie},
        device::device_meta,
        guard::unauthenticated,
    },
    store::AuthMethods,
};

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[utoipa::path(
    post,
    path = "/v1/auth/register",
    request_body = Registration,
    responses(
        (status = 201, description = "Account created and signed in", body = SessionResponse),
        (status = 400, description = "Invalid registration"),
        (status = 409, description = "Email already exists"),
    ),
    tag = "auth"
)]
#[instrument(skip_all)]
pub async fn register(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(registration): Json<Registration>,
) -> Result<impl IntoResponse, AuthError> {
    let user = state.accounts.register(&registration).await?;
    let issued = state
        .engine
        .login(user.id, &user.role, device_meta(&headers))
        .await?;
    let cookies = issued_cookies(&state.config, &issued)?;

    Ok((
        StatusCode::CREATED,
        cookies,
        Json(SessionResponse {
            access_token: issued.access_token,
            user: UserProfile::from(&user),
        }),
    ))
}

#[utoipa::path(
    post,
    path = "/v1/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Signed in", body = SessionResponse),
        (status = 401, description = "Invalid credentials"),
    ),
    tag = "auth"
)]
#[instrument(skip_all)]
pub async fn login(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<LoginRequest>,
) -> Result<impl IntoResponse, AuthError> {
    let user = state
        .accounts
        .authenticate(&request.email, &request.password)
        .await?;
    let issued = state
        .engine
        .login(user.id, &user.role, device_meta(&headers))
        .await?;
    let cookies = issued_cookies(&state.config, &issued)?;

    Ok((
        cookies,
        Json(SessionResponse {
            access_token: issued.access_token,
            user: UserProfile::from(&user),
        }),
    ))
}

/// Mint a new access token from the `sid`/`refresh` cookie pair without
/// rotating the refresh secret. The refresh window slides forward.
#[utoipa::path(
    post,
    path = "/v1/auth/refresh",
    responses(
        (status = 200, description = "New access token", body = AccessTokenResponse),
        (status = 401, description = "Missing or invalid session cookies"),
    ),
    tag = "auth"
)]
pub async fn refresh(State(state): State<AppState>, headers: HeaderMap) -> Response {
    match refresh_session(&state, &headers).await {
        Ok(response) => response,
        Err(AuthError::Store(err)) => AuthError::Store(err).into_response(),
        Err(err) => {
            debug!("refresh rejected: {err}");
            unauthenticated(&state.config, err)
        }
    }
}

async fn refresh_session(state: &AppState, headers: &HeaderMap) -> Result<Response, AuthError> {
    let session_id = read_cookie(headers, SESSION_COOKIE_NAME)
        .and_then(|value| Uuid::parse_str(&value).ok())
        .ok_or(AuthError::Unauthenticated)?;
    let secret = read_cookie(headers, REFRESH_COOKIE_NAME).ok_or(AuthError::Unauthenticated)?;

    let session = state.engine.validate_and_slide(session_id, &secret).await?;
    let user = state.accounts.find(session.user_id).await?;
    let access_token = state
        .engine
        .signer()
        .sign(user.id, session.id, &user.role)?;
    let cookies = session_cookies(&state.config, session.id, &secret)?;

    Ok((cookies, Json(AccessTokenResponse { access_token })).into_response())
}

#[utoipa::path(
    get,
    path = "/v1/auth/check-auth",
    responses(
        (status = 200, description = "Current user with a freshly signed access token", body = SessionResponse),
        (status = 401, description = "Not signed in"),
    ),
    security(("bearer" = [])),
    tag = "auth"
)]
pub async fn check_auth(
    principal: Principal,
    State(state): State<AppState>,
) -> Result<Json<SessionResponse>, AuthError> {
    let user = state.accounts.find(principal.user_id).await?;
    let access_token = state
        .engine
        .signer()
        .sign(user.id, principal.session_id, &user.role)?;
    Ok(Json(SessionResponse {
        access_token,
        user: UserProfile::from(&user),
    }))
}

#[utoipa::path(
    post,
    path = "/v1/auth/logout",
    responses(
        (status = 200, description = "Current session revoked", body = OkResponse),
        (status = 401, description = "Not signed in"),
    ),
    security(("bearer" = [])),
    tag = "auth"
)]
#[instrument(skip_all, fields(user_id = %principal.user_id))]
pub async fn logout(
    principal: Principal,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, AuthError> {
    state
        .engine
        .logout(principal.user_id, principal.session_id)
        .await?;
    Ok((cleared_cookies(&state.config)?, Json(OkResponse { ok: true })))
}

#[utoipa::path(
    post,
    path = "/v1/auth/logout-all",
    responses(
        (status = 200, description = "Every session of the user revoked", body = OkResponse),
        (status = 401, description = "Not signed in"),
    ),
    security(("bearer" = [])),
    tag = "auth"
)]
#[instrument(skip_all, fields(user_id = %principal.user_id))]
pub async fn logout_all(
    principal: Principal,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, AuthError> {
    let revoked = state.engine.revoke_all(principal.user_id).await?;
    info!(revoked, "signed out everywhere");
    Ok((cleared_cookies(&state.config)?, Json(OkResponse { ok: true })))
}

#[utoipa::path(
    get,
    path = "/v1/auth/methods",
    responses(
        (status = 200, description = "Sign-in methods on the account", body = AuthMethods),
        (status = 401, description = "Not signed in"),
    ),
    security(("bearer" = [])),
    tag = "auth"
)]
pub async fn methods(
    principal: Principal,
    State(state): State<AppState>,
) -> Result<Json<AuthMethods>, AuthError> {
    Ok(Json(state.accounts.methods(principal.user_id).await?))
}

#[utoipa::path(
    delete,
    path = "/v1/auth/password",
    responses(
        (status = 204, description = "Password removed"),
        (status = 400, description = "No password set"),
        (status = 409, description = "Password is the last sign-in method"),
    ),
    security(("bearer" = [])),
    tag = "auth"
)]
pub async fn remove_password(
    principal: Principal,
    State(state): State<AppState>,
) -> Result<StatusCode, AuthError> {
    state.accounts.remove_password(principal.user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
