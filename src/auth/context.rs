//! Per-request resolution state.

use serde::{Deserialize, Serialize};

use super::{
    error::{AuthError, InvalidAccess, LimitExceeded},
    models::{SessionToken, User},
};

/// Outcome of a resolution pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Identity {
    Anonymous,
    SessionUser(User),
    ApiUser(User),
    UserApiUser(User),
}

/// Which credential class produced the identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum IdentityKind {
    Anonymous,
    Session,
    ApiKey,
    UserApiKey,
}

impl Identity {
    #[must_use]
    pub fn user(&self) -> Option<&User> {
        match self {
            Self::Anonymous => None,
            Self::SessionUser(user) | Self::ApiUser(user) | Self::UserApiUser(user) => Some(user),
        }
    }

    #[must_use]
    pub fn kind(&self) -> IdentityKind {
        match self {
            Self::Anonymous => IdentityKind::Anonymous,
            Self::SessionUser(_) => IdentityKind::Session,
            Self::ApiUser(_) => IdentityKind::ApiKey,
            Self::UserApiUser(_) => IdentityKind::UserApiKey,
        }
    }
}

/// Policy rejection kept so later lookups in the same request fail the same way.
#[derive(Clone, Debug, PartialEq, Eq)]
enum Rejection {
    InvalidAccess(InvalidAccess),
    LimitExceeded(LimitExceeded),
}

/// Scratch space owned by one request. Never shared across requests.
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    identity: Option<Identity>,
    rejection: Option<Rejection>,
    pub(crate) is_api: bool,
    pub(crate) is_user_api: bool,
    pub(crate) bad_token: bool,
    pub(crate) session_token: Option<SessionToken>,
    pub(crate) hashed_user_api_key: Option<String>,
}

impl RequestContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a resolution pass has completed.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.identity.is_some()
    }

    #[must_use]
    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    #[must_use]
    pub fn current_user(&self) -> Option<&User> {
        self.identity.as_ref().and_then(Identity::user)
    }

    pub(crate) fn set_identity(&mut self, identity: Identity) {
        self.identity = Some(identity);
    }

    /// Remember a forbidden or rate-limited outcome. Storage failures are not
    /// kept, so a later call may retry.
    pub(crate) fn record_rejection(&mut self, err: &AuthError) {
        self.rejection = match err {
            AuthError::InvalidAccess(err) => Some(Rejection::InvalidAccess(err.clone())),
            AuthError::LimitExceeded(err) => Some(Rejection::LimitExceeded(err.clone())),
            AuthError::Storage(_) => None,
        };
    }

    pub(crate) fn rejection(&self) -> Option<AuthError> {
        self.rejection.clone().map(|rejection| match rejection {
            Rejection::InvalidAccess(err) => AuthError::InvalidAccess(err),
            Rejection::LimitExceeded(err) => AuthError::LimitExceeded(err),
        })
    }

    #[must_use]
    pub fn is_rejected(&self) -> bool {
        self.rejection.is_some()
    }

    /// A valid-looking credential did not resolve, or the client believes it
    /// holds a session it does not have.
    #[must_use]
    pub fn bad_token(&self) -> bool {
        self.bad_token
    }

    #[must_use]
    pub fn is_api(&self) -> bool {
        self.is_api
    }

    #[must_use]
    pub fn is_user_api(&self) -> bool {
        self.is_user_api
    }

    #[must_use]
    pub fn session_token(&self) -> Option<&SessionToken> {
        self.session_token.as_ref()
    }

    /// SHA-256 hex of the presented user API key.
    #[must_use]
    pub fn hashed_user_api_key(&self) -> Option<&str> {
        self.hashed_user_api_key.as_deref()
    }
}
