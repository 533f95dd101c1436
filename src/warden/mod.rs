//! HTTP surface.
//!
//! Every route is wrapped by [`middleware::authenticate`] and tagged with its
//! `controller#action` name, which the credential extractor uses to decide
//! whether query-parameter keys are accepted.

use crate::auth::{AuthState, RouteAction};
use anyhow::Result;
use axum::{
    Extension, Router,
    body::Body,
    extract::MatchedPath,
    http::{HeaderName, HeaderValue, Request},
    middleware::from_fn_with_state,
    routing::{MethodRouter, get, post},
};
use std::{future::Future, net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    request_id::PropagateRequestIdLayer, set_header::SetRequestHeaderLayer, trace::TraceLayer,
};
use tracing::{Span, info, info_span};
use ulid::Ulid;

pub mod error;
pub mod handlers;
pub mod middleware;
mod openapi;

pub use handlers::health::DatabaseProbe;
pub use middleware::RequestScope;
pub use openapi::openapi;

/// Wrap `route` in the auth middleware and tag it with `action`.
///
/// The action extension is the outer layer so it is visible to the middleware.
pub fn authenticated(
    route: MethodRouter,
    action: &'static str,
    auth: &Arc<AuthState>,
) -> MethodRouter {
    route
        .layer::<_, std::convert::Infallible>(from_fn_with_state(
            auth.clone(),
            middleware::authenticate,
        ))
        .layer(Extension(RouteAction(action)))
}

/// Build the application router.
pub fn router(auth: Arc<AuthState>, database: DatabaseProbe) -> Router {
    Router::new()
        .route(
            "/health",
            authenticated(get(handlers::health::health), "health#show", &auth),
        )
        .route(
            "/session/current",
            authenticated(get(handlers::session::current), "session#current", &auth),
        )
        .route(
            "/session/logout",
            authenticated(post(handlers::session::logout), "session#destroy", &auth),
        )
        .route("/openapi.json", get(openapi::openapi_json))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestHeaderLayer::if_not_present(
                    HeaderName::from_static("x-request-id"),
                    |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
                ))
                .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                    "x-request-id",
                )))
                .layer(TraceLayer::new_for_http().make_span_with(make_span))
                .layer(Extension(auth))
                .layer(Extension(database)),
        )
}

/// Start the server
/// # Errors
/// Return error if failed to bind or serve
pub async fn new<F>(
    port: u16,
    auth: Arc<AuthState>,
    database: DatabaseProbe,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = router(auth.clone(), database);

    let listener = TcpListener::bind(format!("::0:{port}")).await?;

    info!("Listening on [::]:{}", port);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;

    // Let queued last-seen writes land before the process exits.
    auth.tasks().flush().await;

    Ok(())
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
