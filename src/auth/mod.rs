//! Request authentication core.
//!
//! `IdentityResolver` decides who is calling; `SessionManager` issues, rotates and
//! revokes the session token around it. Both read persistence through the narrow
//! traits in [`stores`], backed by [`memory`] in tests and [`storage`] in
//! production.
//!
//! ## Rate limits
//!
//! - **Cookie attempts:** failed cookie lookups per client IP per minute. Once
//!   exhausted the response also deletes the session cookie.
//! - **Admin API:** one global per-minute counter across all admin keys.
//! - **User API:** per key, a per-minute and a per-day window; both must pass.
//!
//! Counters live in a shared `CounterStore`, so limits hold across instances when
//! it is backed by Postgres.

pub mod clock;
pub mod config;
pub mod context;
pub mod cookie;
pub mod credentials;
pub mod deferred;
pub mod error;
pub mod memory;
pub mod models;
pub mod rate_limit;
pub mod resolver;
pub mod route_matcher;
pub mod session;
pub mod storage;
pub mod stores;
pub mod tokens;

use secrecy::SecretString;
use std::sync::Arc;

pub use config::{AuthConfig, SameSitePolicy, SiteState};
pub use context::{Identity, IdentityKind, RequestContext};
pub use credentials::{AuthRequest, RouteAction};
pub use error::{AuthError, InvalidAccess, LimitExceeded};
pub use resolver::IdentityResolver;
pub use session::{LogOnOptions, ResponseCookies, SessionEvent, SessionManager};
pub use stores::AuthStores;

use clock::Clock;
use cookie::AuthCookieCodec;
use deferred::TaskQueue;

/// Everything the HTTP layer needs to authenticate requests.
#[derive(Debug)]
pub struct AuthState {
    resolver: IdentityResolver,
    sessions: SessionManager,
    site: Arc<SiteState>,
    tasks: TaskQueue,
}

impl AuthState {
    #[must_use]
    pub fn new(
        config: AuthConfig,
        site: Arc<SiteState>,
        stores: AuthStores,
        cookie_secret: SecretString,
        clock: Arc<dyn Clock>,
        tasks: TaskQueue,
    ) -> Self {
        let config = Arc::new(config);
        let codec = Arc::new(AuthCookieCodec::new(cookie_secret));
        let resolver = IdentityResolver::new(
            config.clone(),
            site.clone(),
            stores.clone(),
            codec.clone(),
            clock.clone(),
            tasks.clone(),
        );
        let sessions = SessionManager::new(config, site.clone(), stores, codec, clock, tasks.clone());
        Self {
            resolver,
            sessions,
            site,
            tasks,
        }
    }

    #[must_use]
    pub fn resolver(&self) -> &IdentityResolver {
        &self.resolver
    }

    #[must_use]
    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    #[must_use]
    pub fn config(&self) -> &AuthConfig {
        self.resolver.config()
    }

    #[must_use]
    pub fn site(&self) -> &SiteState {
        &self.site
    }

    #[must_use]
    pub fn tasks(&self) -> &TaskQueue {
        &self.tasks
    }
}

#[cfg(test)]
mod tests;
