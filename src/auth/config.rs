//! Auth configuration and runtime site flags.

use chrono::Duration;
use std::sync::atomic::{AtomicBool, Ordering};

use super::route_matcher::{RouteMatcher, default_parameter_routes};

const DEFAULT_COOKIE_NAME: &str = "_t";
const DEFAULT_COOKIE_ATTEMPTS_PER_MINUTE: u64 = 10;
const DEFAULT_ADMIN_API_REQS_PER_MINUTE: u64 = 60;
const DEFAULT_USER_API_REQS_PER_MINUTE: u64 = 20;
const DEFAULT_USER_API_REQS_PER_DAY: u64 = 2880;
const DEFAULT_MAXIMUM_SESSION_AGE_HOURS: i64 = 60 * 24;
const DEFAULT_MAX_SESSIONS_PER_USER: usize = 60;
const ROTATE_AFTER_MINUTES: i64 = 10;
const URGENT_ROTATE_AFTER_MINUTES: i64 = 1;
const ROTATION_GRACE_MINUTES: i64 = 1;

/// `SameSite` attribute policy for the session cookie.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SameSitePolicy {
    #[default]
    Lax,
    Strict,
    None,
    /// Omit the attribute entirely.
    Disabled,
}

impl SameSitePolicy {
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "lax" => Some(Self::Lax),
            "strict" => Some(Self::Strict),
            "none" => Some(Self::None),
            "disabled" => Some(Self::Disabled),
            _ => None,
        }
    }

    #[must_use]
    pub fn attribute(&self) -> Option<&'static str> {
        match self {
            Self::Lax => Some("Lax"),
            Self::Strict => Some("Strict"),
            Self::None => Some("None"),
            Self::Disabled => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct AuthConfig {
    cookie_name: String,
    force_https: bool,
    same_site: SameSitePolicy,
    persistent_sessions: bool,
    maximum_session_age_hours: i64,
    max_sessions_per_user: usize,
    log_out_strict: bool,
    cookie_attempts_per_minute: u64,
    admin_api_reqs_per_minute: u64,
    admin_api_reqs_per_key_per_minute: Option<u64>,
    user_api_reqs_per_minute: u64,
    user_api_reqs_per_day: u64,
    developer_emails: Vec<String>,
    profiling: bool,
    extra_parameter_routes: Vec<RouteMatcher>,
    client_ip_header: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthConfig {
    #[must_use]
    pub fn new() -> Self {
        Self {
            cookie_name: DEFAULT_COOKIE_NAME.to_string(),
            force_https: false,
            same_site: SameSitePolicy::default(),
            persistent_sessions: true,
            maximum_session_age_hours: DEFAULT_MAXIMUM_SESSION_AGE_HOURS,
            max_sessions_per_user: DEFAULT_MAX_SESSIONS_PER_USER,
            log_out_strict: true,
            cookie_attempts_per_minute: DEFAULT_COOKIE_ATTEMPTS_PER_MINUTE,
            admin_api_reqs_per_minute: DEFAULT_ADMIN_API_REQS_PER_MINUTE,
            admin_api_reqs_per_key_per_minute: None,
            user_api_reqs_per_minute: DEFAULT_USER_API_REQS_PER_MINUTE,
            user_api_reqs_per_day: DEFAULT_USER_API_REQS_PER_DAY,
            developer_emails: Vec::new(),
            profiling: false,
            extra_parameter_routes: Vec::new(),
            client_ip_header: None,
        }
    }

    #[must_use]
    pub fn with_cookie_name(mut self, name: String) -> Self {
        self.cookie_name = name;
        self
    }

    #[must_use]
    pub fn with_force_https(mut self, force_https: bool) -> Self {
        self.force_https = force_https;
        self
    }

    #[must_use]
    pub fn with_same_site(mut self, policy: SameSitePolicy) -> Self {
        self.same_site = policy;
        self
    }

    #[must_use]
    pub fn with_persistent_sessions(mut self, persistent: bool) -> Self {
        self.persistent_sessions = persistent;
        self
    }

    #[must_use]
    pub fn with_maximum_session_age_hours(mut self, hours: i64) -> Self {
        self.maximum_session_age_hours = hours;
        self
    }

    #[must_use]
    pub fn with_max_sessions_per_user(mut self, max: usize) -> Self {
        self.max_sessions_per_user = max;
        self
    }

    #[must_use]
    pub fn with_log_out_strict(mut self, strict: bool) -> Self {
        self.log_out_strict = strict;
        self
    }

    #[must_use]
    pub fn with_cookie_attempts_per_minute(mut self, attempts: u64) -> Self {
        self.cookie_attempts_per_minute = attempts;
        self
    }

    #[must_use]
    pub fn with_admin_api_reqs_per_minute(mut self, reqs: u64) -> Self {
        self.admin_api_reqs_per_minute = reqs;
        self
    }

    #[must_use]
    pub fn with_admin_api_reqs_per_key_per_minute(mut self, reqs: Option<u64>) -> Self {
        self.admin_api_reqs_per_key_per_minute = reqs;
        self
    }

    #[must_use]
    pub fn with_user_api_reqs_per_minute(mut self, reqs: u64) -> Self {
        self.user_api_reqs_per_minute = reqs;
        self
    }

    #[must_use]
    pub fn with_user_api_reqs_per_day(mut self, reqs: u64) -> Self {
        self.user_api_reqs_per_day = reqs;
        self
    }

    #[must_use]
    pub fn with_developer_emails(mut self, emails: Vec<String>) -> Self {
        self.developer_emails = emails
            .into_iter()
            .map(|email| email.trim().to_lowercase())
            .filter(|email| !email.is_empty())
            .collect();
        self
    }

    #[must_use]
    pub fn with_profiling(mut self, profiling: bool) -> Self {
        self.profiling = profiling;
        self
    }

    /// Extra query-parameter credential routes contributed by extensions.
    #[must_use]
    pub fn with_parameter_routes(mut self, routes: Vec<RouteMatcher>) -> Self {
        self.extra_parameter_routes.extend(routes);
        self
    }

    /// Header set by a trusted reverse proxy carrying the client address.
    #[must_use]
    pub fn with_client_ip_header(mut self, header: Option<String>) -> Self {
        self.client_ip_header = header
            .map(|name| name.trim().to_ascii_lowercase())
            .filter(|name| !name.is_empty());
        self
    }

    #[must_use]
    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }

    #[must_use]
    pub fn force_https(&self) -> bool {
        self.force_https
    }

    #[must_use]
    pub fn same_site(&self) -> SameSitePolicy {
        self.same_site
    }

    #[must_use]
    pub fn persistent_sessions(&self) -> bool {
        self.persistent_sessions
    }

    #[must_use]
    pub fn maximum_session_age(&self) -> Duration {
        Duration::hours(self.maximum_session_age_hours)
    }

    #[must_use]
    pub fn max_sessions_per_user(&self) -> usize {
        self.max_sessions_per_user
    }

    #[must_use]
    pub fn log_out_strict(&self) -> bool {
        self.log_out_strict
    }

    #[must_use]
    pub fn cookie_attempts_per_minute(&self) -> u64 {
        self.cookie_attempts_per_minute
    }

    /// Effective global admin API limit; a configured per-key value can only raise it.
    #[must_use]
    pub fn admin_api_reqs_per_minute(&self) -> u64 {
        self.admin_api_reqs_per_key_per_minute
            .map_or(self.admin_api_reqs_per_minute, |per_key| {
                per_key.max(self.admin_api_reqs_per_minute)
            })
    }

    #[must_use]
    pub fn uses_deprecated_per_key_limit(&self) -> bool {
        self.admin_api_reqs_per_key_per_minute.is_some()
    }

    #[must_use]
    pub fn user_api_reqs_per_minute(&self) -> u64 {
        self.user_api_reqs_per_minute
    }

    #[must_use]
    pub fn user_api_reqs_per_day(&self) -> u64 {
        self.user_api_reqs_per_day
    }

    #[must_use]
    pub fn is_developer_email(&self, email: &str) -> bool {
        let email = email.trim().to_lowercase();
        self.developer_emails.iter().any(|dev| *dev == email)
    }

    #[must_use]
    pub fn profiling(&self) -> bool {
        self.profiling
    }

    /// Built-in allow-list plus extension routes.
    #[must_use]
    pub fn parameter_routes(&self) -> Vec<RouteMatcher> {
        let mut routes = default_parameter_routes();
        routes.extend(self.extra_parameter_routes.iter().cloned());
        routes
    }

    #[must_use]
    pub fn client_ip_header(&self) -> Option<&str> {
        self.client_ip_header.as_deref()
    }

    #[must_use]
    pub fn rotate_after(&self) -> Duration {
        Duration::minutes(ROTATE_AFTER_MINUTES)
    }

    #[must_use]
    pub fn urgent_rotate_after(&self) -> Duration {
        Duration::minutes(URGENT_ROTATE_AFTER_MINUTES)
    }

    #[must_use]
    pub fn rotation_grace(&self) -> Duration {
        Duration::minutes(ROTATION_GRACE_MINUTES)
    }
}

/// Site-wide flags that change at runtime.
#[derive(Debug, Default)]
pub struct SiteState {
    read_only: AtomicBool,
    bootstrap_mode: AtomicBool,
}

impl SiteState {
    #[must_use]
    pub fn new(read_only: bool) -> Self {
        Self {
            read_only: AtomicBool::new(read_only),
            bootstrap_mode: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn can_write(&self) -> bool {
        !self.read_only.load(Ordering::Acquire)
    }

    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::Release);
    }

    #[must_use]
    pub fn bootstrap_mode_enabled(&self) -> bool {
        self.bootstrap_mode.load(Ordering::Acquire)
    }

    /// Returns `true` if this call switched bootstrap mode on.
    pub fn enable_bootstrap_mode(&self) -> bool {
        !self.bootstrap_mode.swap(true, Ordering::AcqRel)
    }
}
