use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use uuid::Uuid;

use crate::{
    api::AppState,
    auth::{AuthError, Principal, SessionSummary},
};

#[utoipa::path(
    get,
    path = "/v1/auth/sessions",
    responses(
        (status = 200, description = "Active sessions of the caller", body = [SessionSummary]),
        (status = 401, description = "Not signed in"),
    ),
    security(("bearer" = [])),
    tag = "sessions"
)]
pub async fn list(
    principal: Principal,
    State(state): State<AppState>,
) -> Result<Json<Vec<SessionSummary>>, AuthError> {
    Ok(Json(state.engine.list_active(principal.user_id).await?))
}

#[utoipa::path(
    delete,
    path = "/v1/auth/sessions/{id}",
    params(("id" = Uuid, Path, description = "Session id")),
    responses(
        (status = 204, description = "Session revoked, or it was not an active session of the caller"),
        (status = 401, description = "Not signed in"),
    ),
    security(("bearer" = [])),
    tag = "sessions"
)]
pub async fn revoke(
    principal: Principal,
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AuthError> {
    state.engine.revoke_one(principal.user_id, id).await?;
    Ok(StatusCode::NO_CONTENT)
}
