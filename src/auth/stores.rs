//! Narrow interfaces to the persistence the resolver consumes but does not own.
//!
//! Secrets are hashed before they cross these traits: stores look up and persist
//! hashes only.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::net::IpAddr;
use std::sync::Arc;

use super::{
    error::StoreError,
    models::{ApiKey, ClientContext, SessionToken, User, UserApiKey, UserId},
    rate_limit::CounterStore,
};

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_by_id(&self, id: UserId) -> Result<Option<User>, StoreError>;

    /// Case-insensitive lookup.
    async fn find_by_username(&self, username: &str) -> Result<Option<User>, StoreError>;

    async fn save(&self, user: &User) -> Result<(), StoreError>;

    async fn admin_count(&self) -> Result<u64, StoreError>;

    async fn update_last_seen(
        &self,
        id: UserId,
        ip: Option<IpAddr>,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}

#[async_trait]
pub trait ApiKeyStore: Send + Sync {
    /// Active (not revoked) key by its hash.
    async fn find_active(&self, key_hash: &[u8]) -> Result<Option<ApiKey>, StoreError>;

    async fn update_last_used(&self, id: i64, at: DateTime<Utc>) -> Result<(), StoreError>;
}

#[async_trait]
pub trait UserApiKeyStore: Send + Sync {
    /// Active (not revoked) key by its hash.
    async fn find_active(&self, key_hash: &[u8]) -> Result<Option<UserApiKey>, StoreError>;

    async fn update_last_used(
        &self,
        id: i64,
        client_id: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}

#[async_trait]
pub trait SingleSignOnStore: Send + Sync {
    async fn user_id_for_external_id(&self, external_id: &str)
    -> Result<Option<UserId>, StoreError>;
}

/// Parameters of a lookup against the session token store.
#[derive(Clone, Copy, Debug)]
pub struct TokenLookup<'a> {
    pub token_hash: &'a [u8],
    pub mark_seen: bool,
    pub now: DateTime<Utc>,
    pub max_age: Duration,
    /// How long a rotated-out secret keeps authenticating.
    pub grace: Duration,
}

#[async_trait]
pub trait SessionTokenStore: Send + Sync {
    /// Find a live token by hash. With `mark_seen`, a current-generation match is
    /// flagged as seen and its last-seen context refreshed.
    async fn lookup(
        &self,
        lookup: TokenLookup<'_>,
        context: &ClientContext,
    ) -> Result<Option<SessionToken>, StoreError>;

    async fn generate(
        &self,
        user_id: UserId,
        token_hash: Vec<u8>,
        context: &ClientContext,
        staff: bool,
        impersonate: bool,
        now: DateTime<Utc>,
    ) -> Result<SessionToken, StoreError>;

    /// Replace the secret of `token` if it still carries `token.auth_token_hash`.
    /// Returns `None` when a concurrent rotation already won.
    async fn rotate(
        &self,
        token: &SessionToken,
        new_hash: Vec<u8>,
        context: &ClientContext,
        now: DateTime<Utc>,
    ) -> Result<Option<SessionToken>, StoreError>;

    async fn destroy(&self, id: i64) -> Result<(), StoreError>;

    async fn destroy_all(&self, user_id: UserId) -> Result<(), StoreError>;

    /// Evict the oldest sessions of `user_id` beyond `max_sessions`.
    async fn enforce_session_count_limit(
        &self,
        user_id: UserId,
        max_sessions: usize,
    ) -> Result<(), StoreError>;
}

/// Fast key-value lookup used by the shared-session bypass.
#[async_trait]
pub trait SharedSessionCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
}

/// Every collaborator the resolver and session manager need.
#[derive(Clone)]
pub struct AuthStores {
    pub users: Arc<dyn UserStore>,
    pub api_keys: Arc<dyn ApiKeyStore>,
    pub user_api_keys: Arc<dyn UserApiKeyStore>,
    pub single_sign_on: Arc<dyn SingleSignOnStore>,
    pub tokens: Arc<dyn SessionTokenStore>,
    pub shared_sessions: Arc<dyn SharedSessionCache>,
    pub counters: Arc<dyn CounterStore>,
}

impl AuthStores {
    /// Wire every interface to one backing store.
    pub fn from_single<S>(store: Arc<S>, counters: Arc<dyn CounterStore>) -> Self
    where
        S: UserStore
            + ApiKeyStore
            + UserApiKeyStore
            + SingleSignOnStore
            + SessionTokenStore
            + SharedSessionCache
            + 'static,
    {
        Self {
            users: store.clone(),
            api_keys: store.clone(),
            user_api_keys: store.clone(),
            single_sign_on: store.clone(),
            tokens: store.clone(),
            shared_sessions: store,
            counters,
        }
    }
}
