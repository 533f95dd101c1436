//! Session lifecycle: log on, rotate on the way out, log off.
//!
//! Cookies are collected in a [`ResponseCookies`] jar and written as `Set-Cookie`
//! headers by the HTTP layer. Rotation is compare-and-set in the token store, so
//! when concurrent requests race only one re-issues the cookie; the others keep
//! authenticating with the previous secret during the grace window.

use axum::http::{HeaderValue, header::InvalidHeaderValue};
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use std::fmt::Write;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

use super::{
    clock::Clock,
    config::{AuthConfig, SiteState},
    context::{Identity, RequestContext},
    cookie::{AuthCookie, AuthCookieCodec},
    credentials::AuthRequest,
    deferred::TaskQueue,
    error::{AuthError, StoreError},
    models::{IssuedToken, SessionToken, User, UserId},
    stores::AuthStores,
    tokens::{generate_session_token, hash_secret},
};

pub const PROFILER_COOKIE: &str = "__profilin";
pub const AUTHENTICATION_DATA_COOKIE: &str = "authentication_data";

const EVENT_CAPACITY: usize = 64;
const EXPIRED: &str = "Thu, 01 Jan 1970 00:00:00 GMT";

/// Published on the session event channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    SessionRefreshed { user_id: UserId },
    LoggedOut { user_id: UserId },
}

#[derive(Clone, Copy, Debug, Default)]
pub struct LogOnOptions {
    /// Staff acting as another user.
    pub impersonate: bool,
}

/// Pending `Set-Cookie` values, one per cookie name; later writes replace earlier ones.
#[derive(Clone, Debug, Default)]
pub struct ResponseCookies {
    entries: Vec<(String, String)>,
}

impl ResponseCookies {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn put(&mut self, name: &str, header: String) {
        if let Some(entry) = self.entries.iter_mut().find(|(n, _)| n == name) {
            entry.1 = header;
        } else {
            self.entries.push((name.to_string(), header));
        }
    }

    /// Instruct the client to drop `name`.
    pub fn delete(&mut self, name: &str) {
        self.put(name, format!("{name}=; Path=/; Max-Age=0; Expires={EXPIRED}"));
    }

    /// Full `Set-Cookie` value queued for `name`, if any.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, header)| header.as_str())
    }

    #[must_use]
    pub fn is_deleted(&self, name: &str) -> bool {
        self.get(name).is_some_and(|header| header.contains("Max-Age=0"))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// # Errors
    /// Returns an error if a queued value is not a valid header value.
    pub fn header_values(&self) -> Result<Vec<HeaderValue>, InvalidHeaderValue> {
        self.entries
            .iter()
            .map(|(_, header)| HeaderValue::from_str(header))
            .collect()
    }
}

pub struct SessionManager {
    config: Arc<AuthConfig>,
    site: Arc<SiteState>,
    stores: AuthStores,
    codec: Arc<AuthCookieCodec>,
    clock: Arc<dyn Clock>,
    tasks: TaskQueue,
    events: broadcast::Sender<SessionEvent>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    #[must_use]
    pub fn new(
        config: Arc<AuthConfig>,
        site: Arc<SiteState>,
        stores: AuthStores,
        codec: Arc<AuthCookieCodec>,
        clock: Arc<dyn Clock>,
        tasks: TaskQueue,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            site,
            stores,
            codec,
            clock,
            tasks,
            events,
        }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Start a session for `user` and make it the request's identity.
    ///
    /// # Errors
    /// Returns an error if the token cannot be generated or persisted.
    #[instrument(skip_all, fields(user_id = user.id))]
    pub async fn log_on(
        &self,
        mut user: User,
        request: &AuthRequest,
        ctx: &mut RequestContext,
        cookies: &mut ResponseCookies,
        options: LogOnOptions,
    ) -> Result<User, AuthError> {
        let now = self.clock.now();
        let issued = self
            .issue_token(&user, request, options.impersonate, now)
            .await?;

        if user.staged {
            user.staged = false;
            self.stores.users.save(&user).await?;
        }
        self.make_developer_admin(&mut user).await?;
        self.enable_bootstrap_mode(&user).await?;

        self.stores
            .tokens
            .enforce_session_count_limit(user.id, self.config.max_sessions_per_user())
            .await?;

        // Only a completed log on may reach the response.
        self.set_auth_cookie(cookies, issued.unhashed(), &user, now)?;

        ctx.session_token = Some(issued.token);
        ctx.set_identity(Identity::SessionUser(user.clone()));
        Ok(user)
    }

    async fn issue_token(
        &self,
        user: &User,
        request: &AuthRequest,
        impersonate: bool,
        now: DateTime<Utc>,
    ) -> Result<IssuedToken, AuthError> {
        let unhashed = generate_session_token().map_err(StoreError::Other)?;
        let token = self
            .stores
            .tokens
            .generate(
                user.id,
                hash_secret(&unhashed),
                &request.client_context(),
                user.is_staff(),
                impersonate,
                now,
            )
            .await?;
        Ok(IssuedToken::new(token, SecretString::from(unhashed)))
    }

    /// Grants admin to active accounts whose email is on the configured developer
    /// list. Empty by default.
    async fn make_developer_admin(&self, user: &mut User) -> Result<(), AuthError> {
        if user.active && !user.admin && self.config.is_developer_email(&user.email) {
            warn!(user_id = user.id, "granting admin to developer email");
            user.admin = true;
            self.stores.users.save(user).await?;
        }
        Ok(())
    }

    async fn enable_bootstrap_mode(&self, user: &User) -> Result<(), AuthError> {
        if self.site.bootstrap_mode_enabled() {
            return Ok(());
        }
        if user.admin && user.last_seen_at.is_none() && self.stores.users.admin_count().await? == 1
        {
            let site = self.site.clone();
            let user_id = user.id;
            self.tasks.schedule("enable_bootstrap_mode", async move {
                if site.enable_bootstrap_mode() {
                    warn!(user_id, "bootstrap mode enabled for first admin");
                }
                Ok::<(), anyhow::Error>(())
            });
        }
        Ok(())
    }

    /// Rotate the session token when due and clear stale cookies.
    ///
    /// # Errors
    /// Returns an error if rotation fails for a reason other than read-only mode.
    #[instrument(skip_all)]
    pub async fn refresh_session(
        &self,
        request: &AuthRequest,
        ctx: &mut RequestContext,
        cookies: &mut ResponseCookies,
    ) -> Result<(), AuthError> {
        if !ctx.is_resolved() || ctx.is_api() {
            return Ok(());
        }
        let user = ctx.current_user().cloned();

        if !ctx.is_user_api()
            && let Some(user) = &user
            && let Some(token) = ctx.session_token.clone()
            && token.user_id == user.id
        {
            let now = self.clock.now();
            if token.needs_rotation(
                now,
                self.config.rotate_after(),
                self.config.urgent_rotate_after(),
            ) {
                self.rotate(&token, user, request, ctx, cookies, now).await?;
            }
        }

        if user.is_none() && request.cookie(self.config.cookie_name()).is_some() {
            cookies.delete(self.config.cookie_name());
        }
        Ok(())
    }

    async fn rotate(
        &self,
        token: &SessionToken,
        user: &User,
        request: &AuthRequest,
        ctx: &mut RequestContext,
        cookies: &mut ResponseCookies,
        now: DateTime<Utc>,
    ) -> Result<(), AuthError> {
        let unhashed = generate_session_token().map_err(StoreError::Other)?;
        let rotated = match self
            .stores
            .tokens
            .rotate(token, hash_secret(&unhashed), &request.client_context(), now)
            .await
        {
            Ok(rotated) => rotated,
            Err(StoreError::ReadOnly) => None,
            Err(err) => return Err(err.into()),
        };
        let Some(rotated) = rotated else {
            debug!(token_id = token.id, "rotation lost to a concurrent request");
            return Ok(());
        };
        let issued = IssuedToken::new(rotated, SecretString::from(unhashed));
        self.set_auth_cookie(cookies, issued.unhashed(), user, now)?;
        ctx.session_token = Some(issued.token);
        info!(user_id = user.id, "session token rotated");
        self.publish(SessionEvent::SessionRefreshed { user_id: user.id });
        Ok(())
    }

    /// End the current session (or every session, under strict logout).
    ///
    /// # Errors
    /// Returns an error if tokens cannot be destroyed.
    #[instrument(skip_all)]
    pub async fn log_off(
        &self,
        ctx: &mut RequestContext,
        cookies: &mut ResponseCookies,
    ) -> Result<(), AuthError> {
        let user = ctx.current_user().cloned();

        if let Some(user) = &user {
            if self.config.log_out_strict() {
                self.stores.tokens.destroy_all(user.id).await?;
                if user.admin {
                    cookies.delete(PROFILER_COOKIE);
                }
                self.publish(SessionEvent::LoggedOut { user_id: user.id });
            } else if let Some(token) = &ctx.session_token {
                self.stores.tokens.destroy(token.id).await?;
            }
        }

        cookies.delete(AUTHENTICATION_DATA_COOKIE);
        cookies.delete(self.config.cookie_name());
        ctx.session_token = None;
        ctx.set_identity(Identity::Anonymous);
        Ok(())
    }

    fn set_auth_cookie(
        &self,
        cookies: &mut ResponseCookies,
        unhashed: &str,
        user: &User,
        now: DateTime<Utc>,
    ) -> Result<(), AuthError> {
        let max_age = self.config.maximum_session_age();
        let cookie = AuthCookie {
            token: unhashed.to_string(),
            user_id: Some(user.id),
            trust_level: Some(user.trust_level),
            issued_at: now.timestamp(),
            valid_for: max_age.num_seconds(),
        };
        let value = self
            .codec
            .encode(&cookie)
            .map_err(|err| StoreError::Other(anyhow::anyhow!("failed to encode cookie: {err}")))?;

        let name = self.config.cookie_name();
        let mut header = format!("{name}={value}; Path=/; HttpOnly");
        if self.config.force_https() {
            header.push_str("; Secure");
        }
        if let Some(same_site) = self.config.same_site().attribute() {
            header.push_str("; SameSite=");
            header.push_str(same_site);
        }
        if self.config.persistent_sessions() {
            let expires = now + max_age;
            let _ = write!(
                header,
                "; Expires={}",
                expires.format("%a, %d %b %Y %H:%M:%S GMT")
            );
        }
        cookies.put(name, header);
        Ok(())
    }
}
