//! Records owned by the external stores, as seen by the resolver.

use axum::http::Method;
use chrono::{DateTime, Duration, Utc};
use ipnetwork::IpNetwork;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

use super::route_matcher::{RouteInfo, RouteMatcher};

pub type UserId = i64;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub email: String,
    pub active: bool,
    pub suspended: bool,
    pub admin: bool,
    pub moderator: bool,
    pub staged: bool,
    pub trust_level: u8,
    pub last_seen_at: Option<DateTime<Utc>>,
}

impl User {
    #[must_use]
    pub fn is_staff(&self) -> bool {
        self.admin || self.moderator
    }

    /// Only active, unsuspended accounts may ever become the current user.
    #[must_use]
    pub fn is_usable(&self) -> bool {
        self.active && !self.suspended
    }

    #[must_use]
    pub fn username_lower(&self) -> String {
        self.username.to_lowercase()
    }
}

/// Admin-issued API key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApiKey {
    pub id: i64,
    /// Statically bound user; `None` means the caller selects a user per request.
    pub user_id: Option<UserId>,
    /// Empty means any address.
    pub allowed_ips: Vec<IpNetwork>,
    /// Empty means unrestricted.
    pub scopes: Vec<RouteMatcher>,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl ApiKey {
    /// IP allow-list and scope check for the current request.
    #[must_use]
    pub fn request_allowed(&self, client_ip: Option<IpAddr>, route: &RouteInfo) -> bool {
        let ip_ok = self.allowed_ips.is_empty()
            || client_ip.is_some_and(|ip| self.allowed_ips.iter().any(|net| net.contains(ip)));
        let scope_ok = self.scopes.is_empty() || self.scopes.iter().any(|s| s.matches(route));
        ip_ok && scope_ok
    }
}

/// Named permissions a user grants to a user-API-key client.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserApiScope {
    Read,
    Write,
    SessionInfo,
    Notifications,
    MessageBus,
}

impl UserApiScope {
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "read" => Some(Self::Read),
            "write" => Some(Self::Write),
            "session_info" => Some(Self::SessionInfo),
            "notifications" => Some(Self::Notifications),
            "message_bus" => Some(Self::MessageBus),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::SessionInfo => "session_info",
            Self::Notifications => "notifications",
            Self::MessageBus => "message_bus",
        }
    }

    fn matchers(self) -> Vec<RouteMatcher> {
        match self {
            Self::Read => vec![RouteMatcher::any().methods([Method::GET, Method::HEAD])],
            Self::Write => vec![RouteMatcher::any()],
            Self::SessionInfo => vec![
                RouteMatcher::any()
                    .methods([Method::GET])
                    .actions(["session#current", "users#topic_tracking_state"]),
            ],
            Self::Notifications => vec![
                RouteMatcher::any()
                    .methods([Method::GET])
                    .actions(["notifications#index"]),
                RouteMatcher::any()
                    .methods([Method::PUT, Method::POST])
                    .actions(["notifications#mark_read"]),
            ],
            Self::MessageBus => vec![RouteMatcher::any().actions(["message_bus#poll"])],
        }
    }

    #[must_use]
    pub fn permits(self, route: &RouteInfo) -> bool {
        self.matchers().iter().any(|m| m.matches(route))
    }
}

/// User-granted API key (e.g. mobile apps).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserApiKey {
    pub id: i64,
    pub user_id: UserId,
    pub client_id: Option<String>,
    pub scopes: Vec<UserApiScope>,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl UserApiKey {
    #[must_use]
    pub fn allows(&self, route: &RouteInfo) -> bool {
        self.scopes.iter().any(|scope| scope.permits(route))
    }
}

/// Request details recorded alongside session tokens.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClientContext {
    pub user_agent: Option<String>,
    pub path: Option<String>,
    pub client_ip: Option<IpAddr>,
}

/// Server-side session token state. Only hashes are persisted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionToken {
    pub id: i64,
    pub user_id: UserId,
    pub auth_token_hash: Vec<u8>,
    pub prev_auth_token_hash: Option<Vec<u8>>,
    pub auth_token_seen: bool,
    pub issued_at: DateTime<Utc>,
    pub rotated_at: DateTime<Utc>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub client_ip: Option<IpAddr>,
    pub user_agent: Option<String>,
    pub path: Option<String>,
    pub staff: bool,
    pub impersonate: bool,
}

/// How a presented hash matched a stored token.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenMatch {
    Current,
    /// Previous generation, still inside the post-rotation grace window.
    Previous,
}

impl SessionToken {
    /// Match rules shared by every [`SessionTokenStore`](super::stores::SessionTokenStore):
    /// the current hash always matches while the session is younger than
    /// `max_age`; the previous hash only within `grace` after a rotation.
    #[must_use]
    pub fn match_hash(
        &self,
        hash: &[u8],
        now: DateTime<Utc>,
        max_age: Duration,
        grace: Duration,
    ) -> Option<TokenMatch> {
        if self.rotated_at <= now - max_age {
            return None;
        }
        if self.auth_token_hash == hash {
            return Some(TokenMatch::Current);
        }
        if self.prev_auth_token_hash.as_deref() == Some(hash) && self.rotated_at > now - grace {
            return Some(TokenMatch::Previous);
        }
        None
    }

    /// Whether this token is due for rotation.
    #[must_use]
    pub fn needs_rotation(
        &self,
        now: DateTime<Utc>,
        rotate_after: Duration,
        urgent_rotate_after: Duration,
    ) -> bool {
        let interval = if self.auth_token_seen {
            rotate_after
        } else {
            urgent_rotate_after
        };
        self.rotated_at < now - interval
    }
}

/// A token fresh from `generate` or `rotate`, with its unhashed secret.
pub struct IssuedToken {
    pub token: SessionToken,
    unhashed: SecretString,
}

impl IssuedToken {
    #[must_use]
    pub fn new(token: SessionToken, unhashed: SecretString) -> Self {
        Self { token, unhashed }
    }

    #[must_use]
    pub fn unhashed(&self) -> &str {
        self.unhashed.expose_secret()
    }
}

impl std::fmt::Debug for IssuedToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedToken")
            .field("token", &self.token)
            .finish_non_exhaustive()
    }
}
