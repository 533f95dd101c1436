//! Per-request authentication scope.
//!
//! Flow Overview:
//! 1) `authenticate` builds an [`AuthRequest`] and a fresh [`RequestScope`], and
//!    stores the scope in the request extensions.
//! 2) Handlers pull the scope out and resolve lazily with
//!    [`RequestScope::current_user`]; a request that never asks never resolves.
//! 3) After the handler returns, `refresh_session` runs against the same context
//!    and every collected cookie is appended as `Set-Cookie`.

use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::Response,
};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::error;

use super::error::append_cookies;
use crate::auth::{
    AuthError, AuthRequest, AuthState, Identity, LogOnOptions, RequestContext, ResponseCookies,
    models::User,
};

#[derive(Debug, Default)]
struct ScopeState {
    context: RequestContext,
    cookies: ResponseCookies,
}

/// Handle to the current request's authentication state.
#[derive(Clone, Debug)]
pub struct RequestScope {
    auth: Arc<AuthState>,
    request: Arc<AuthRequest>,
    state: Arc<Mutex<ScopeState>>,
}

impl RequestScope {
    #[must_use]
    pub fn new(auth: Arc<AuthState>, request: AuthRequest) -> Self {
        Self {
            auth,
            request: Arc::new(request),
            state: Arc::new(Mutex::new(ScopeState::default())),
        }
    }

    #[must_use]
    pub fn request(&self) -> &AuthRequest {
        &self.request
    }

    /// # Errors
    /// Propagates resolver rejections.
    pub async fn current_user(&self) -> Result<Option<User>, AuthError> {
        let mut state = self.state.lock().await;
        self.auth
            .resolver()
            .current_user(&self.request, &mut state.context)
            .await
    }

    /// Resolve and return the identity together with the API flags.
    ///
    /// # Errors
    /// Propagates resolver rejections.
    pub async fn identity(&self) -> Result<(Identity, bool, bool), AuthError> {
        let mut state = self.state.lock().await;
        self.auth
            .resolver()
            .current_user(&self.request, &mut state.context)
            .await?;
        let identity = state
            .context
            .identity()
            .cloned()
            .unwrap_or(Identity::Anonymous);
        Ok((identity, state.context.is_api(), state.context.is_user_api()))
    }

    /// # Errors
    /// Returns an error if the session token cannot be issued.
    pub async fn log_on(&self, user: User, options: LogOnOptions) -> Result<User, AuthError> {
        let mut guard = self.state.lock().await;
        let ScopeState { context, cookies } = &mut *guard;
        self.auth
            .sessions()
            .log_on(user, &self.request, context, cookies, options)
            .await
    }

    /// # Errors
    /// Propagates resolver rejections and token store failures.
    pub async fn log_off(&self) -> Result<(), AuthError> {
        let mut guard = self.state.lock().await;
        let ScopeState { context, cookies } = &mut *guard;
        self.auth
            .resolver()
            .current_user(&self.request, context)
            .await?;
        self.auth.sessions().log_off(context, cookies).await
    }

    async fn finish(&self, response: &mut Response) {
        let mut guard = self.state.lock().await;
        let ScopeState { context, cookies } = &mut *guard;
        if let Err(err) = self
            .auth
            .sessions()
            .refresh_session(&self.request, context, cookies)
            .await
        {
            error!("failed to refresh session: {err}");
        }
        append_cookies(response, cookies);
    }
}

/// Attach a [`RequestScope`] to the request and settle its cookies afterwards.
pub async fn authenticate(
    State(auth): State<Arc<AuthState>>,
    request: Request,
    next: Next,
) -> Response {
    let (mut parts, body) = request.into_parts();
    let peer: Option<IpAddr> = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let request_view = AuthRequest::from_parts(&parts, peer, auth.config().client_ip_header());
    let scope = RequestScope::new(auth, request_view);
    parts.extensions.insert(scope.clone());

    let mut response = next.run(Request::from_parts(parts, body)).await;
    scope.finish(&mut response).await;
    response
}
