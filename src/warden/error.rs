//! HTTP mapping for authentication failures.
//!
//! Rejections never say which check failed. The body carries a generic error plus
//! an optional stable code a client can branch on.

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use tracing::error;
use utoipa::ToSchema;

use crate::auth::{AuthError, ResponseCookies};

#[derive(ToSchema, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl ErrorBody {
    fn new(error: &str) -> Self {
        Self {
            error: error.to_string(),
            reason: None,
            error_code: None,
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        match self {
            Self::InvalidAccess(err) => {
                let body = ErrorBody {
                    reason: err.reason,
                    ..ErrorBody::new("invalid_access")
                };
                let mut response = (StatusCode::FORBIDDEN, Json(body)).into_response();
                if let Some(name) = err.delete_cookie {
                    let mut cookies = ResponseCookies::new();
                    cookies.delete(&name);
                    append_cookies(&mut response, &cookies);
                }
                response
            }
            Self::LimitExceeded(err) => {
                let body = ErrorBody {
                    error_code: Some(err.error_code),
                    ..ErrorBody::new("rate_limited")
                };
                let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
                response
                    .headers_mut()
                    .insert(header::RETRY_AFTER, HeaderValue::from(err.available_in));
                response
            }
            Self::Storage(err) => {
                error!("authentication storage failure: {err}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorBody::new("internal_error")),
                )
                    .into_response()
            }
        }
    }
}

/// Write every cookie in `cookies` as a `Set-Cookie` header.
pub(crate) fn append_cookies(response: &mut Response, cookies: &ResponseCookies) {
    match cookies.header_values() {
        Ok(values) => {
            for value in values {
                response.headers_mut().append(header::SET_COOKIE, value);
            }
        }
        Err(err) => error!("failed to build Set-Cookie header: {err}"),
    }
}
