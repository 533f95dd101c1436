//! Request-time identity resolution.
//!
//! Flow Overview:
//! 1) Shared-session header short-circuits everything else.
//! 2) Admin API key, then user API key, then the session cookie. The cookie is
//!    only a candidate when no key was presented.
//! 3) Every resolved user passes a final active/unsuspended check.
//! 4) Last-seen is bumped on the deferred queue, never inline.
//!
//! Credential-format problems degrade to anonymous and set `bad_token`. Policy
//! violations (limits, forbidden keys, suspended key owners) reject the request.

use std::sync::Arc;
use tracing::{debug, instrument, warn};

use super::{
    clock::Clock,
    config::{AuthConfig, SiteState},
    context::{Identity, RequestContext},
    cookie::AuthCookieCodec,
    credentials::{self, ApiCredentials, AuthRequest, CLIENT_PRESENT_HEADER, Credentials},
    deferred::TaskQueue,
    error::{AuthError, InvalidAccess, StoreError},
    models::{ApiKey, User, UserId},
    rate_limit::{PerformError, RateLimiter},
    route_matcher::RouteMatcher,
    stores::{AuthStores, TokenLookup},
    tokens::{hash_secret, hash_secret_hex},
};

const COOKIE_LIMIT_CODE: &str = "cookie_auth_rate_limit";
const ADMIN_API_LIMIT_CODE: &str = "admin_api_key_rate_limit";
const USER_API_MINUTE_LIMIT_CODE: &str = "user_api_key_limiter_60_mins";
const USER_API_DAY_LIMIT_CODE: &str = "user_api_key_limiter_1_day";
const INVALID_API_CREDENTIALS: &str = "invalid_api_credentials";
const INVALID_USER_API_KEY: &str = "invalid_user_api_key";
const AMBIGUOUS_CREDENTIALS: &str = "ambiguous_credentials";

const MINUTE: u64 = 60;
const DAY: u64 = 24 * 60 * 60;

#[derive(Clone)]
pub struct IdentityResolver {
    config: Arc<AuthConfig>,
    site: Arc<SiteState>,
    stores: AuthStores,
    codec: Arc<AuthCookieCodec>,
    clock: Arc<dyn Clock>,
    tasks: TaskQueue,
    parameter_routes: Arc<Vec<RouteMatcher>>,
}

impl std::fmt::Debug for IdentityResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityResolver")
            .field("config", &self.config)
            .field("site", &self.site)
            .finish_non_exhaustive()
    }
}

impl IdentityResolver {
    #[must_use]
    pub fn new(
        config: Arc<AuthConfig>,
        site: Arc<SiteState>,
        stores: AuthStores,
        codec: Arc<AuthCookieCodec>,
        clock: Arc<dyn Clock>,
        tasks: TaskQueue,
    ) -> Self {
        if config.uses_deprecated_per_key_limit() {
            warn!(
                effective_limit = config.admin_api_reqs_per_minute(),
                "admin API per-key limit is deprecated; it can only raise the global limit"
            );
        }
        let parameter_routes = Arc::new(config.parameter_routes());
        Self {
            config,
            site,
            stores,
            codec,
            clock,
            tasks,
            parameter_routes,
        }
    }

    #[must_use]
    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    /// Resolve (once) and return the acting user. A rejection is replayed on
    /// later calls with the same context.
    ///
    /// # Errors
    /// Returns `AuthError` when a presented credential is forbidden or rate limited,
    /// or when a store fails outside the soft paths.
    #[instrument(skip_all, fields(path = %request.path))]
    pub async fn current_user(
        &self,
        request: &AuthRequest,
        ctx: &mut RequestContext,
    ) -> Result<Option<User>, AuthError> {
        if let Some(err) = ctx.rejection() {
            return Err(err);
        }
        if !ctx.is_resolved() {
            match self.resolve(request, ctx).await {
                Ok(identity) => ctx.set_identity(identity),
                Err(err) => {
                    ctx.record_rejection(&err);
                    return Err(err);
                }
            }
        }
        Ok(ctx.current_user().cloned())
    }

    /// # Errors
    /// Same as [`Self::current_user`], which runs first.
    pub async fn is_api(
        &self,
        request: &AuthRequest,
        ctx: &mut RequestContext,
    ) -> Result<bool, AuthError> {
        self.current_user(request, ctx).await?;
        Ok(ctx.is_api())
    }

    /// # Errors
    /// Same as [`Self::current_user`], which runs first.
    pub async fn is_user_api(
        &self,
        request: &AuthRequest,
        ctx: &mut RequestContext,
    ) -> Result<bool, AuthError> {
        self.current_user(request, ctx).await?;
        Ok(ctx.is_user_api())
    }

    /// A session cookie is present and passes full validation, age included.
    #[must_use]
    pub fn has_auth_cookie(&self, request: &AuthRequest) -> bool {
        request
            .cookie(self.config.cookie_name())
            .is_some_and(|raw| self.codec.decode(raw, true, self.clock.now()).is_ok())
    }

    async fn resolve(
        &self,
        request: &AuthRequest,
        ctx: &mut RequestContext,
    ) -> Result<Identity, AuthError> {
        let credentials =
            credentials::extract(request, self.config.cookie_name(), &self.parameter_routes);

        if let Some(shared_key) = &credentials.shared_session {
            let identity = self.try_shared_session(shared_key).await?;
            return Ok(safety_net(identity));
        }

        if credentials.api.is_some() && credentials.user_api_key.is_some() {
            return Err(InvalidAccess::new().with_reason(AMBIGUOUS_CREDENTIALS).into());
        }

        let identity = if let Some(api) = &credentials.api {
            Identity::ApiUser(self.try_api_key(request, ctx, api).await?)
        } else if let Some(key) = &credentials.user_api_key {
            Identity::UserApiUser(
                self.try_user_api_key(request, ctx, key, &credentials)
                    .await?,
            )
        } else {
            self.try_session_cookie(request, ctx, &credentials)
                .await?
                .map_or(Identity::Anonymous, Identity::SessionUser)
        };

        let identity = safety_net(identity);
        if let Some(user) = identity.user()
            && self.should_update_last_seen(request, ctx)
        {
            self.schedule_last_seen(user, request);
        }
        Ok(identity)
    }

    async fn try_shared_session(&self, shared_key: &str) -> Result<Identity, AuthError> {
        let Some(user_id) = self.stores.shared_sessions.get(shared_key).await? else {
            return Ok(Identity::Anonymous);
        };
        let Ok(user_id) = user_id.trim().parse::<UserId>() else {
            debug!("shared session maps to a non-numeric user id");
            return Ok(Identity::Anonymous);
        };
        Ok(self
            .stores
            .users
            .find_by_id(user_id)
            .await?
            .map_or(Identity::Anonymous, Identity::SessionUser))
    }

    async fn try_session_cookie(
        &self,
        request: &AuthRequest,
        ctx: &mut RequestContext,
        credentials: &Credentials,
    ) -> Result<Option<User>, AuthError> {
        let Some(raw) = credentials.session_cookie.as_deref() else {
            if credentials.logged_in_hint {
                ctx.bad_token = true;
            }
            return Ok(None);
        };

        let now = self.clock.now();
        let cookie = match self.codec.decode(raw, false, now) {
            Ok(cookie) => cookie,
            Err(err) => {
                debug!("rejecting session cookie: {err}");
                ctx.bad_token = true;
                return Ok(None);
            }
        };

        let ip = request
            .client_ip
            .map_or_else(|| "unknown".to_string(), |ip| ip.to_string());
        let limiter = RateLimiter::new(
            self.stores.counters.clone(),
            self.clock.clone(),
            format!("cookie_auth_{ip}"),
            self.config.cookie_attempts_per_minute(),
            MINUTE,
            COOKIE_LIMIT_CODE,
        );
        if !limiter.can_perform().await? {
            return Err(self.cookie_limit_rejection());
        }

        let token_hash = hash_secret(&cookie.token);
        let lookup = TokenLookup {
            token_hash: &token_hash,
            mark_seen: self.site.can_write(),
            now,
            max_age: self.config.maximum_session_age(),
            grace: self.config.rotation_grace(),
        };
        let token = match self
            .stores
            .tokens
            .lookup(lookup, &request.client_context())
            .await
        {
            Ok(token) => token,
            Err(StoreError::ReadOnly) => None,
            Err(err) => return Err(err.into()),
        };
        // A cookie signed for one user never unlocks another user's token.
        let token = token.filter(|token| cookie.user_id.is_none_or(|id| id == token.user_id));

        let user = match &token {
            Some(token) => self.stores.users.find_by_id(token.user_id).await?,
            None => None,
        };

        if user.is_none() {
            ctx.bad_token = true;
            match limiter.perform().await {
                Ok(()) => {}
                Err(PerformError::Limited(_)) => return Err(self.cookie_limit_rejection()),
                Err(PerformError::Store(err)) => return Err(err.into()),
            }
            return Ok(None);
        }

        ctx.session_token = token;
        Ok(user)
    }

    fn cookie_limit_rejection(&self) -> AuthError {
        InvalidAccess::new()
            .with_reason(COOKIE_LIMIT_CODE)
            .deleting_cookie(self.config.cookie_name())
            .into()
    }

    async fn try_api_key(
        &self,
        request: &AuthRequest,
        ctx: &mut RequestContext,
        credentials: &ApiCredentials,
    ) -> Result<User, AuthError> {
        let invalid = || AuthError::from(InvalidAccess::new().with_reason(INVALID_API_CREDENTIALS));

        let Some(key) = self
            .stores
            .api_keys
            .find_active(&hash_secret(&credentials.key))
            .await?
        else {
            return Err(invalid());
        };

        if !key.request_allowed(request.client_ip, &request.route) {
            warn!(
                username = credentials.username.as_deref().unwrap_or_default(),
                ip = ?request.client_ip,
                "unauthorized API access"
            );
            return Err(invalid());
        }

        let Some(user) = self.lookup_api_user(&key, credentials).await? else {
            return Err(invalid());
        };

        if self.site.can_write() {
            let now = self.clock.now();
            match self.stores.api_keys.update_last_used(key.id, now).await {
                Ok(()) | Err(StoreError::ReadOnly) => {}
                Err(err) => warn!(api_key_id = key.id, "failed to update API key last used: {err}"),
            }
        }

        if !user.is_usable() {
            return Err(invalid());
        }

        if !self.config.profiling() {
            RateLimiter::new(
                self.stores.counters.clone(),
                self.clock.clone(),
                "admin_api_min",
                self.config.admin_api_reqs_per_minute(),
                MINUTE,
                ADMIN_API_LIMIT_CODE,
            )
            .perform()
            .await
            .map_err(perform_error)?;
        }

        ctx.is_api = true;
        Ok(user)
    }

    /// Bound user first, then username, then numeric id, then external SSO id.
    async fn lookup_api_user(
        &self,
        key: &ApiKey,
        credentials: &ApiCredentials,
    ) -> Result<Option<User>, StoreError> {
        if let Some(bound) = key.user_id {
            let user = self.stores.users.find_by_id(bound).await?;
            return Ok(user.filter(|user| {
                credentials
                    .username
                    .as_deref()
                    .is_none_or(|name| user.username_lower() == name.to_lowercase())
            }));
        }
        if let Some(username) = credentials.username.as_deref() {
            return self.stores.users.find_by_username(username).await;
        }
        if let Some(user_id) = credentials.user_id.as_deref() {
            let Ok(user_id) = user_id.trim().parse::<UserId>() else {
                return Ok(None);
            };
            return self.stores.users.find_by_id(user_id).await;
        }
        if let Some(external_id) = credentials.external_id.as_deref() {
            let Some(user_id) = self
                .stores
                .single_sign_on
                .user_id_for_external_id(external_id)
                .await?
            else {
                return Ok(None);
            };
            return self.stores.users.find_by_id(user_id).await;
        }
        Ok(None)
    }

    async fn try_user_api_key(
        &self,
        request: &AuthRequest,
        ctx: &mut RequestContext,
        raw_key: &str,
        credentials: &Credentials,
    ) -> Result<User, AuthError> {
        let invalid = || AuthError::from(InvalidAccess::new().with_reason(INVALID_USER_API_KEY));

        let hashed = hash_secret_hex(raw_key);
        ctx.hashed_user_api_key = Some(hashed.clone());

        let Some(key) = self
            .stores
            .user_api_keys
            .find_active(&hash_secret(raw_key))
            .await?
        else {
            return Err(invalid());
        };

        for (scope, limit, window, code) in [
            (
                format!("user_api_min_{hashed}"),
                self.config.user_api_reqs_per_minute(),
                MINUTE,
                USER_API_MINUTE_LIMIT_CODE,
            ),
            (
                format!("user_api_day_{hashed}"),
                self.config.user_api_reqs_per_day(),
                DAY,
                USER_API_DAY_LIMIT_CODE,
            ),
        ] {
            RateLimiter::new(
                self.stores.counters.clone(),
                self.clock.clone(),
                scope,
                limit,
                window,
                code,
            )
            .perform()
            .await
            .map_err(perform_error)?;
        }

        if !key.allows(&request.route) {
            return Err(invalid());
        }

        let Some(user) = self.stores.users.find_by_id(key.user_id).await? else {
            return Err(invalid());
        };
        if !user.is_usable() {
            return Err(invalid());
        }

        if self.site.can_write() {
            let now = self.clock.now();
            let client_id = credentials.user_api_client_id.as_deref();
            match self
                .stores
                .user_api_keys
                .update_last_used(key.id, client_id, now)
                .await
            {
                Ok(()) | Err(StoreError::ReadOnly) => {}
                Err(err) => warn!(
                    user_api_key_id = key.id,
                    "failed to update user API key last used: {err}"
                ),
            }
        }

        ctx.is_user_api = true;
        Ok(user)
    }

    fn should_update_last_seen(&self, request: &AuthRequest, ctx: &RequestContext) -> bool {
        if !self.site.can_write() {
            return false;
        }
        if request.is_xhr() || ctx.is_api || ctx.is_user_api {
            request.header(CLIENT_PRESENT_HEADER) == Some("true")
        } else {
            true
        }
    }

    fn schedule_last_seen(&self, user: &User, request: &AuthRequest) {
        let users = self.stores.users.clone();
        let user_id = user.id;
        let ip = request.client_ip;
        let now = self.clock.now();
        self.tasks.schedule("update_last_seen", async move {
            users.update_last_seen(user_id, ip, now).await?;
            Ok::<(), anyhow::Error>(())
        });
    }
}

/// Discard any identity whose user is suspended or inactive.
fn safety_net(identity: Identity) -> Identity {
    match identity.user() {
        Some(user) if !user.is_usable() => {
            debug!(user_id = user.id, "discarding unusable user");
            Identity::Anonymous
        }
        _ => identity,
    }
}

fn perform_error(err: PerformError) -> AuthError {
    match err {
        PerformError::Limited(limit) => AuthError::LimitExceeded(limit),
        PerformError::Store(err) => AuthError::Storage(err),
    }
}
