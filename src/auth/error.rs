//! Error taxonomy for identity resolution.
//!
//! Credential-format problems (`InvalidCookie`) are absorbed by the resolver and
//! degrade toward anonymous. Policy violations surface as `AuthError` and end the
//! request without an identity.

use thiserror::Error;

/// A signed session cookie that failed structure, signature, or age checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InvalidCookie {
    #[error("malformed cookie")]
    Malformed,
    #[error("invalid base64url encoding")]
    Base64,
    #[error("invalid cookie signature")]
    Signature,
    #[error("invalid cookie token")]
    Token,
    #[error("cookie expired")]
    Expired,
}

/// A fixed-window limiter tripped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("rate limit exceeded: {error_code} (retry in {available_in}s)")]
pub struct LimitExceeded {
    pub error_code: String,
    /// Seconds until the current window closes.
    pub available_in: u64,
}

/// Credentials were presented but are invalid, expired, or forbidden.
#[derive(Debug, Clone, Default, PartialEq, Eq, Error)]
#[error("invalid access")]
pub struct InvalidAccess {
    /// Stable machine-readable code for client-side handling.
    pub reason: Option<String>,
    /// Name of a cookie the response must delete.
    pub delete_cookie: Option<String>,
}

impl InvalidAccess {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    #[must_use]
    pub fn deleting_cookie(mut self, name: impl Into<String>) -> Self {
        self.delete_cookie = Some(name.into());
        self
    }
}

/// Failures reported by the external stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing database refuses writes; callers on soft paths treat this as "no result".
    #[error("store is read-only")]
    ReadOnly,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        // SQLSTATE 25006: read_only_sql_transaction
        if let sqlx::Error::Database(db_err) = &err
            && db_err.code().is_some_and(|code| code.as_ref() == "25006")
        {
            return Self::ReadOnly;
        }
        Self::Other(err.into())
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error(transparent)]
    InvalidAccess(#[from] InvalidAccess),
    #[error(transparent)]
    LimitExceeded(#[from] LimitExceeded),
    #[error("storage failure: {0}")]
    Storage(#[from] StoreError),
}

impl AuthError {
    /// Stable code exposed to clients, if any.
    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::InvalidAccess(err) => err.reason.as_deref(),
            Self::LimitExceeded(err) => Some(err.error_code.as_str()),
            Self::Storage(_) => None,
        }
    }

    #[must_use]
    pub fn delete_cookie(&self) -> Option<&str> {
        match self {
            Self::InvalidAccess(err) => err.delete_cookie.as_deref(),
            _ => None,
        }
    }
}
