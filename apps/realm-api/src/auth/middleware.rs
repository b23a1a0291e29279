//! Bearer access-token extraction.

use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::AppState;

/// Authenticated user extracted from the `Authorization: Bearer <token>` header.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: String,
    /// The raw access token, kept so logout can revoke it.
    pub token: String,
}

/// Rejection returned when the bearer token is missing or invalid.
#[derive(Debug)]
pub struct AuthError {
    message: &'static str,
}

impl AuthError {
    pub const MISSING: Self = Self {
        message: "Missing bearer token",
    };
    pub const INVALID: Self = Self {
        message: "Invalid or expired token",
    };
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": {
                "code": "UNAUTHORIZED",
                "message": self.message
            }
        });
        (StatusCode::UNAUTHORIZED, Json(body)).into_response()
    }
}

/// Pull the token out of an `Authorization: Bearer` header, if present.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Validate an access token, mapping every failure to the same rejection.
pub async fn authenticate(state: &AppState, token: &str) -> Result<AuthUser, AuthError> {
    let user_id = state
        .tokens
        .validate_access_token(token)
        .await
        .map_err(|err| {
            tracing::debug!(%err, "access token rejected");
            AuthError::INVALID
        })?;

    Ok(AuthUser {
        user_id,
        token: token.to_string(),
    })
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AuthError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers).ok_or(AuthError::MISSING)?;
        authenticate(state, token).await
    }
}
