//! Auth routes: refresh-token rotation and logout.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::auth::middleware::AuthUser;
use crate::error::{ApiError, ApiErrorBody};
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/auth/refresh", post(refresh))
        .route("/auth/logout", post(logout))
}

// ---------------------------------------------------------------------------
// POST /api/v1/auth/refresh
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, ToSchema)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct RefreshResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expires_in: u64,
}

#[utoipa::path(
    post,
    path = "/api/v1/auth/refresh",
    tag = "Auth",
    request_body = RefreshRequest,
    responses(
        (status = 200, description = "New token pair issued", body = RefreshResponse),
        (status = 401, description = "Refresh token invalid, expired, or already used", body = ApiErrorBody),
    ),
)]
pub async fn refresh(
    State(state): State<AppState>,
    Json(body): Json<RefreshRequest>,
) -> Result<Json<RefreshResponse>, ApiError> {
    let (user_id, pair) = state.tokens.rotate(&body.refresh_token).await?;
    tracing::debug!(%user_id, "refresh token rotated");

    Ok(Json(RefreshResponse {
        access_token: pair.access_token,
        refresh_token: pair.refresh_token,
        token_type: "Bearer".to_string(),
        expires_in: pair.expires_in,
    }))
}

// ---------------------------------------------------------------------------
// POST /api/v1/auth/logout
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct LogoutRequest {
    /// Also revoke this refresh token. Must belong to the same user.
    #[serde(default)]
    pub refresh_token: Option<String>,
}

#[utoipa::path(
    post,
    path = "/api/v1/auth/logout",
    tag = "Auth",
    request_body(content = LogoutRequest, description = "Optional; may be omitted entirely"),
    responses(
        (status = 204, description = "Tokens revoked"),
        (status = 400, description = "Malformed body", body = ApiErrorBody),
        (status = 401, description = "Not authenticated", body = ApiErrorBody),
    ),
    security(("bearer" = [])),
)]
pub async fn logout(
    State(state): State<AppState>,
    user: AuthUser,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    // The body is optional, so it is parsed by hand rather than through `Json`.
    let body: LogoutRequest = if body.iter().all(u8::is_ascii_whitespace) {
        LogoutRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::bad_request(format!("Invalid JSON body: {e}")))?
    };

    if let Some(refresh_token) = body.refresh_token.as_deref() {
        let claims = state.tokens.refresh_claims(refresh_token)?;
        if claims.sub != user.user_id {
            return Err(ApiError::unauthorized("Refresh token belongs to another user"));
        }
        state.tokens.revoke_refresh_token(refresh_token).await?;
    }
    state.tokens.revoke_access_token(&user.token).await?;

    tracing::info!(user_id = %user.user_id, "user logged out");
    Ok(StatusCode::NO_CONTENT)
}
