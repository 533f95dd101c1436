use axum::{
    body::Body,
    extract::Extension,
    http::{HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error};
use utoipa::ToSchema;

use crate::{
    APP_USER_AGENT,
    auth::{AuthState, storage::PgStore},
};

/// Database reachability check. `None` when running on the in-memory stores.
#[derive(Clone, Debug, Default)]
pub struct DatabaseProbe(Option<PgStore>);

impl DatabaseProbe {
    #[must_use]
    pub fn postgres(store: PgStore) -> Self {
        Self(Some(store))
    }

    #[must_use]
    pub fn memory() -> Self {
        Self(None)
    }

    async fn status(&self) -> Result<&'static str, &'static str> {
        let Some(store) = &self.0 else {
            return Ok("memory");
        };
        match store.ping().await {
            Ok(()) => Ok("ok"),
            Err(err) => {
                error!("Failed to ping database: {}", err);
                Err("error")
            }
        }
    }
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct Health {
    name: String,
    version: String,
    database: String,
    read_only: bool,
}

#[utoipa::path(
    get,
    path = "/health",
    responses (
        (status = 200, description = "Database is reachable", body = Health),
        (status = 503, description = "Database is unreachable", body = Health)
    ),
    tag = "health"
)]
// axum handler for health
pub async fn health(
    method: Method,
    probe: Extension<DatabaseProbe>,
    auth: Extension<Arc<AuthState>>,
) -> impl IntoResponse {
    let result = probe.0.status().await;

    let health = Health {
        name: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        database: result.unwrap_or_else(|status| status).to_string(),
        read_only: !auth.site().can_write(),
    };

    let body = if method == Method::GET {
        Json(&health).into_response()
    } else {
        Body::empty().into_response()
    };

    let mut headers = HeaderMap::new();
    headers.insert("X-App", HeaderValue::from_static(APP_USER_AGENT));

    if result.is_ok() {
        debug!("Database connection is healthy");
        (StatusCode::OK, headers, body)
    } else {
        debug!("Database connection is unhealthy");
        (StatusCode::SERVICE_UNAVAILABLE, headers, body)
    }
}
