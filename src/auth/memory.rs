//! In-process store implementations for tests and local development.
//!
//! Nothing here survives a restart and nothing is shared between instances; use
//! `storage::PgStore` and `storage::PgCounterStore` for real deployments.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use super::{
    error::StoreError,
    models::{ApiKey, ClientContext, SessionToken, TokenMatch, User, UserApiKey, UserId},
    rate_limit::CounterStore,
    stores::{
        ApiKeyStore, SessionTokenStore, SharedSessionCache, SingleSignOnStore, TokenLookup,
        UserApiKeyStore, UserStore,
    },
    tokens::hash_secret,
};

#[derive(Debug)]
struct Counter {
    count: u64,
    expires_at: Instant,
}

/// Fixed-window counters in a concurrent map. The entry API holds the shard lock
/// across read-modify-write, so increments on one key are atomic.
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    counters: DashMap<String, Counter>,
}

impl MemoryCounterStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Drop expired counters.
    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.counters.retain(|_, counter| counter.expires_at > now);
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn peek(&self, key: &str) -> Result<u64, StoreError> {
        let now = Instant::now();
        Ok(self
            .counters
            .get(key)
            .filter(|counter| counter.expires_at > now)
            .map_or(0, |counter| counter.count))
    }

    async fn increment(&self, key: &str, ttl_seconds: u64) -> Result<u64, StoreError> {
        let now = Instant::now();
        let mut entry = self.counters.entry(key.to_string()).or_insert(Counter {
            count: 0,
            expires_at: now + Duration::from_secs(ttl_seconds),
        });
        if entry.expires_at <= now {
            entry.count = 0;
            entry.expires_at = now + Duration::from_secs(ttl_seconds);
        }
        entry.count += 1;
        Ok(entry.count)
    }
}

#[derive(Debug, Default)]
struct Tables {
    users: HashMap<UserId, User>,
    api_keys: HashMap<Vec<u8>, ApiKey>,
    user_api_keys: HashMap<Vec<u8>, UserApiKey>,
    external_ids: HashMap<String, UserId>,
    tokens: HashMap<i64, SessionToken>,
    shared_sessions: HashMap<String, String>,
}

/// All record stores behind one lock.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    next_token_id: AtomicI64,
    read_only: AtomicBool,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write fail with `StoreError::ReadOnly`, like a replica would.
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::Release);
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.read_only.load(Ordering::Acquire) {
            return Err(StoreError::ReadOnly);
        }
        Ok(())
    }

    pub async fn insert_user(&self, user: User) {
        self.tables.lock().await.users.insert(user.id, user);
    }

    pub async fn user(&self, id: UserId) -> Option<User> {
        self.tables.lock().await.users.get(&id).cloned()
    }

    /// Register an API key under the hash of `secret`.
    pub async fn insert_api_key(&self, secret: &str, key: ApiKey) {
        self.tables
            .lock()
            .await
            .api_keys
            .insert(hash_secret(secret), key);
    }

    pub async fn api_key(&self, id: i64) -> Option<ApiKey> {
        let tables = self.tables.lock().await;
        tables.api_keys.values().find(|key| key.id == id).cloned()
    }

    /// Register a user API key under the hash of `secret`.
    pub async fn insert_user_api_key(&self, secret: &str, key: UserApiKey) {
        self.tables
            .lock()
            .await
            .user_api_keys
            .insert(hash_secret(secret), key);
    }

    pub async fn user_api_key(&self, id: i64) -> Option<UserApiKey> {
        let tables = self.tables.lock().await;
        tables
            .user_api_keys
            .values()
            .find(|key| key.id == id)
            .cloned()
    }

    pub async fn link_external_id(&self, external_id: &str, user_id: UserId) {
        self.tables
            .lock()
            .await
            .external_ids
            .insert(external_id.to_string(), user_id);
    }

    pub async fn insert_shared_session(&self, key: &str, user_id: UserId) {
        self.tables
            .lock()
            .await
            .shared_sessions
            .insert(key.to_string(), user_id.to_string());
    }

    pub async fn token(&self, id: i64) -> Option<SessionToken> {
        self.tables.lock().await.tokens.get(&id).cloned()
    }

    /// Live tokens of `user_id`, oldest first.
    pub async fn tokens_for(&self, user_id: UserId) -> Vec<SessionToken> {
        let tables = self.tables.lock().await;
        let mut tokens: Vec<_> = tables
            .tokens
            .values()
            .filter(|token| token.user_id == user_id)
            .cloned()
            .collect();
        tokens.sort_by_key(|token| (token.rotated_at, token.id));
        tokens
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn find_by_id(&self, id: UserId) -> Result<Option<User>, StoreError> {
        Ok(self.tables.lock().await.users.get(&id).cloned())
    }

    async fn find_by_username(&self, username: &str) -> Result<Option<User>, StoreError> {
        let username = username.to_lowercase();
        let tables = self.tables.lock().await;
        Ok(tables
            .users
            .values()
            .find(|user| user.username_lower() == username)
            .cloned())
    }

    async fn save(&self, user: &User) -> Result<(), StoreError> {
        self.check_writable()?;
        self.tables.lock().await.users.insert(user.id, user.clone());
        Ok(())
    }

    async fn admin_count(&self) -> Result<u64, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables.users.values().filter(|user| user.admin).count() as u64)
    }

    async fn update_last_seen(
        &self,
        id: UserId,
        _ip: Option<IpAddr>,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.check_writable()?;
        if let Some(user) = self.tables.lock().await.users.get_mut(&id) {
            user.last_seen_at = Some(at);
        }
        Ok(())
    }
}

#[async_trait]
impl ApiKeyStore for MemoryStore {
    async fn find_active(&self, key_hash: &[u8]) -> Result<Option<ApiKey>, StoreError> {
        Ok(self.tables.lock().await.api_keys.get(key_hash).cloned())
    }

    async fn update_last_used(&self, id: i64, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut tables = self.tables.lock().await;
        if let Some(key) = tables.api_keys.values_mut().find(|key| key.id == id) {
            key.last_used_at = Some(at);
        }
        Ok(())
    }
}

#[async_trait]
impl UserApiKeyStore for MemoryStore {
    async fn find_active(&self, key_hash: &[u8]) -> Result<Option<UserApiKey>, StoreError> {
        Ok(self.tables.lock().await.user_api_keys.get(key_hash).cloned())
    }

    async fn update_last_used(
        &self,
        id: i64,
        client_id: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut tables = self.tables.lock().await;
        if let Some(key) = tables.user_api_keys.values_mut().find(|key| key.id == id) {
            key.last_used_at = Some(at);
            if let Some(client_id) = client_id {
                key.client_id = Some(client_id.to_string());
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SingleSignOnStore for MemoryStore {
    async fn user_id_for_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<UserId>, StoreError> {
        Ok(self
            .tables
            .lock()
            .await
            .external_ids
            .get(external_id)
            .copied())
    }
}

#[async_trait]
impl SessionTokenStore for MemoryStore {
    async fn lookup(
        &self,
        lookup: TokenLookup<'_>,
        context: &ClientContext,
    ) -> Result<Option<SessionToken>, StoreError> {
        if lookup.mark_seen {
            self.check_writable()?;
        }
        let mut tables = self.tables.lock().await;
        let found = tables.tokens.values_mut().find_map(|token| {
            let matched =
                token.match_hash(lookup.token_hash, lookup.now, lookup.max_age, lookup.grace)?;
            Some((token, matched))
        });
        let Some((token, matched)) = found else {
            return Ok(None);
        };

        if lookup.mark_seen && matched == TokenMatch::Current {
            token.auth_token_seen = true;
            token.last_seen_at = Some(lookup.now);
            token.client_ip = context.client_ip.or(token.client_ip);
            if context.user_agent.is_some() {
                token.user_agent.clone_from(&context.user_agent);
            }
            if context.path.is_some() {
                token.path.clone_from(&context.path);
            }
        }
        Ok(Some(token.clone()))
    }

    async fn generate(
        &self,
        user_id: UserId,
        token_hash: Vec<u8>,
        context: &ClientContext,
        staff: bool,
        impersonate: bool,
        now: DateTime<Utc>,
    ) -> Result<SessionToken, StoreError> {
        self.check_writable()?;
        let id = self.next_token_id.fetch_add(1, Ordering::AcqRel) + 1;
        let token = SessionToken {
            id,
            user_id,
            auth_token_hash: token_hash,
            prev_auth_token_hash: None,
            auth_token_seen: false,
            issued_at: now,
            rotated_at: now,
            last_seen_at: None,
            client_ip: context.client_ip,
            user_agent: context.user_agent.clone(),
            path: context.path.clone(),
            staff,
            impersonate,
        };
        self.tables.lock().await.tokens.insert(id, token.clone());
        Ok(token)
    }

    async fn rotate(
        &self,
        token: &SessionToken,
        new_hash: Vec<u8>,
        context: &ClientContext,
        now: DateTime<Utc>,
    ) -> Result<Option<SessionToken>, StoreError> {
        self.check_writable()?;
        let mut tables = self.tables.lock().await;
        let Some(stored) = tables.tokens.get_mut(&token.id) else {
            return Ok(None);
        };
        if stored.auth_token_hash != token.auth_token_hash {
            return Ok(None);
        }
        let previous = std::mem::replace(&mut stored.auth_token_hash, new_hash);
        stored.prev_auth_token_hash = Some(previous);
        stored.auth_token_seen = false;
        stored.rotated_at = now;
        stored.client_ip = context.client_ip.or(stored.client_ip);
        if context.user_agent.is_some() {
            stored.user_agent.clone_from(&context.user_agent);
        }
        Ok(Some(stored.clone()))
    }

    async fn destroy(&self, id: i64) -> Result<(), StoreError> {
        self.check_writable()?;
        self.tables.lock().await.tokens.remove(&id);
        Ok(())
    }

    async fn destroy_all(&self, user_id: UserId) -> Result<(), StoreError> {
        self.check_writable()?;
        self.tables
            .lock()
            .await
            .tokens
            .retain(|_, token| token.user_id != user_id);
        Ok(())
    }

    async fn enforce_session_count_limit(
        &self,
        user_id: UserId,
        max_sessions: usize,
    ) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut tables = self.tables.lock().await;
        let mut owned: Vec<(DateTime<Utc>, i64)> = tables
            .tokens
            .values()
            .filter(|token| token.user_id == user_id)
            .map(|token| (token.rotated_at, token.id))
            .collect();
        if owned.len() <= max_sessions {
            return Ok(());
        }
        // Newest first; everything past the cap goes.
        owned.sort_unstable_by(|a, b| b.cmp(a));
        for (_, id) in owned.into_iter().skip(max_sessions) {
            tables.tokens.remove(&id);
        }
        Ok(())
    }
}

#[async_trait]
impl SharedSessionCache for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.tables.lock().await.shared_sessions.get(key).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn lookup(hash: &[u8], now: DateTime<Utc>, mark_seen: bool) -> TokenLookup<'_> {
        TokenLookup {
            token_hash: hash,
            mark_seen,
            now,
            max_age: ChronoDuration::days(60),
            grace: ChronoDuration::minutes(1),
        }
    }

    #[tokio::test]
    async fn counter_increments_are_per_key() -> anyhow::Result<()> {
        let store = MemoryCounterStore::new();
        assert_eq!(store.increment("a:1", 60).await?, 1);
        assert_eq!(store.increment("a:1", 60).await?, 2);
        assert_eq!(store.increment("b:1", 60).await?, 1);
        assert_eq!(store.peek("a:1").await?, 2);
        assert_eq!(store.peek("missing").await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn expired_counters_read_as_zero() -> anyhow::Result<()> {
        let store = MemoryCounterStore::new();
        store.increment("a:1", 0).await?;
        assert_eq!(store.peek("a:1").await?, 0);
        store.purge_expired();
        assert!(store.counters.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn lookup_marks_seen_only_when_asked() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let now = Utc::now();
        let ctx = ClientContext::default();
        let token = store.generate(1, vec![1], &ctx, false, false, now).await?;
        assert!(!token.auth_token_seen);

        let found = store.lookup(lookup(&[1], now, false), &ctx).await?;
        assert!(found.is_some_and(|t| !t.auth_token_seen));

        let seen_ctx = ClientContext {
            user_agent: Some("agent".to_string()),
            path: Some("/latest".to_string()),
            client_ip: Some(IpAddr::from([127, 0, 0, 1])),
        };
        let found = store.lookup(lookup(&[1], now, true), &seen_ctx).await?;
        let found = found.ok_or_else(|| anyhow::anyhow!("token missing"))?;
        assert!(found.auth_token_seen);
        assert_eq!(found.path.as_deref(), Some("/latest"));
        Ok(())
    }

    #[tokio::test]
    async fn rotation_is_compare_and_set() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let now = Utc::now();
        let ctx = ClientContext::default();
        let token = store.generate(1, vec![1], &ctx, false, false, now).await?;

        let first = store.rotate(&token, vec![2], &ctx, now).await?;
        let second = store.rotate(&token, vec![3], &ctx, now).await?;
        assert!(first.is_some());
        assert!(second.is_none());

        let stored = store
            .token(token.id)
            .await
            .ok_or_else(|| anyhow::anyhow!("token missing"))?;
        assert_eq!(stored.auth_token_hash, vec![2]);
        assert_eq!(stored.prev_auth_token_hash, Some(vec![1]));
        Ok(())
    }

    #[tokio::test]
    async fn session_limit_evicts_oldest() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let now = Utc::now();
        let ctx = ClientContext::default();
        for minute in 0..4u8 {
            store
                .generate(
                    9,
                    vec![minute],
                    &ctx,
                    false,
                    false,
                    now + ChronoDuration::minutes(i64::from(minute)),
                )
                .await?;
        }
        store.enforce_session_count_limit(9, 2).await?;
        let left: Vec<_> = store
            .tokens_for(9)
            .await
            .into_iter()
            .map(|t| t.auth_token_hash)
            .collect();
        assert_eq!(left, vec![vec![2], vec![3]]);
        Ok(())
    }

    #[tokio::test]
    async fn read_only_rejects_writes() {
        let store = MemoryStore::new();
        store.set_read_only(true);
        let result = store
            .generate(1, vec![1], &ClientContext::default(), false, false, Utc::now())
            .await;
        assert!(matches!(result, Err(StoreError::ReadOnly)));
    }

    #[tokio::test]
    async fn username_lookup_ignores_case() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        store
            .insert_user(User {
                id: 1,
                username: "Alice".to_string(),
                email: "alice@example.com".to_string(),
                active: true,
                suspended: false,
                admin: false,
                moderator: false,
                staged: false,
                trust_level: 1,
                last_seen_at: None,
            })
            .await;
        assert!(store.find_by_username("alice").await?.is_some());
        assert!(store.find_by_username("ALICE").await?.is_some());
        assert!(store.find_by_username("bob").await?.is_none());
        Ok(())
    }
}
