//! Session endpoints.
//!
//! - `GET /session/current` reports who the request resolved to.
//! - `POST /session/logout` ends the session; strict logout ends all of them.

use axum::{
    extract::Extension,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::auth::{AuthError, IdentityKind};
use crate::warden::{error::ErrorBody, middleware::RequestScope};

#[derive(ToSchema, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct CurrentSession {
    pub id: i64,
    pub username: String,
    pub kind: IdentityKind,
    pub admin: bool,
    pub moderator: bool,
    pub trust_level: u8,
    pub api: bool,
    pub user_api: bool,
}

#[utoipa::path(
    get,
    path = "/session/current",
    responses (
        (status = 200, description = "Resolved identity", body = CurrentSession),
        (status = 204, description = "Anonymous request"),
        (status = 403, description = "Credentials rejected", body = ErrorBody),
        (status = 429, description = "Rate limited", body = ErrorBody)
    ),
    tag = "session"
)]
pub async fn current(Extension(scope): Extension<RequestScope>) -> Result<Response, AuthError> {
    let (identity, api, user_api) = scope.identity().await?;
    let Some(user) = identity.user() else {
        return Ok(StatusCode::NO_CONTENT.into_response());
    };

    let body = CurrentSession {
        id: user.id,
        username: user.username.clone(),
        kind: identity.kind(),
        admin: user.admin,
        moderator: user.moderator,
        trust_level: user.trust_level,
        api,
        user_api,
    };
    Ok(Json(body).into_response())
}

#[utoipa::path(
    post,
    path = "/session/logout",
    responses (
        (status = 204, description = "Session ended and cookies cleared"),
        (status = 403, description = "Credentials rejected", body = ErrorBody)
    ),
    tag = "session"
)]
pub async fn logout(Extension(scope): Extension<RequestScope>) -> Result<StatusCode, AuthError> {
    scope.log_off().await?;
    Ok(StatusCode::NO_CONTENT)
}
