use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::{
    api::AppState,
    auth::{AuthError, OAuthMode, Principal, Provider},
};

#[derive(Deserialize, IntoParams, Debug)]
#[into_params(parameter_in = Query)]
pub struct StateQuery {
    pub mode: OAuthMode,
    /// Connect token, required when `mode=connect`.
    pub token: Option<String>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct StateResponse {
    pub state: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct ConnectTokenResponse {
    pub token: String,
}

#[utoipa::path(
    get,
    path = "/v1/auth/oauth/{provider}/state",
    params(
        ("provider" = Provider, Path, description = "Identity provider"),
        StateQuery,
    ),
    responses(
        (status = 200, description = "Signed state for the provider redirect", body = StateResponse),
        (status = 400, description = "Unknown provider or missing connect token"),
    ),
    tag = "oauth"
)]
pub async fn state(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(query): Query<StateQuery>,
) -> Result<Json<StateResponse>, AuthError> {
    let provider: Provider = provider.parse()?;
    let state = state.oauth.start(provider, query.mode, query.token)?;
    Ok(Json(StateResponse { state }))
}

/// Issue a one-time token that lets the next provider round trip attach its
/// identity to the caller's account.
#[utoipa::path(
    post,
    path = "/v1/auth/oauth/{provider}/connect-token",
    params(("provider" = Provider, Path, description = "Identity provider")),
    responses(
        (status = 200, description = "One-time connect token", body = ConnectTokenResponse),
        (status = 400, description = "Unknown provider"),
        (status = 401, description = "Not signed in"),
    ),
    security(("bearer" = [])),
    tag = "oauth"
)]
pub async fn connect_token(
    principal: Principal,
    State(state): State<AppState>,
    Path(provider): Path<String>,
) -> Result<Json<ConnectTokenResponse>, AuthError> {
    let provider: Provider = provider.parse()?;
    let token = state.connect.create(principal.user_id, provider).await?;
    Ok(Json(ConnectTokenResponse { token }))
}

#[utoipa::path(
    delete,
    path = "/v1/auth/oauth/{provider}",
    params(("provider" = Provider, Path, description = "Identity provider")),
    responses(
        (status = 204, description = "Provider disconnected"),
        (status = 400, description = "Provider is not connected"),
        (status = 409, description = "Provider is the last sign-in method"),
    ),
    security(("bearer" = [])),
    tag = "oauth"
)]
pub async fn disconnect(
    principal: Principal,
    State(state): State<AppState>,
    Path(provider): Path<String>,
) -> Result<StatusCode, AuthError> {
    let provider: Provider = provider.parse()?;
    state.accounts.disconnect(principal.user_id, provider).await?;
    Ok(StatusCode::NO_CONTENT)
}
