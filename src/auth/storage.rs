//! Postgres-backed stores.
//!
//! Flow Overview:
//! 1) Every secret arrives pre-hashed; tables keep `BYTEA` SHA-256 digests only.
//! 2) Session token rotation is a conditional `UPDATE .. WHERE auth_token = $old`,
//!    so exactly one concurrent rotation wins.
//! 3) Rate-limit counters use `INSERT .. ON CONFLICT DO UPDATE .. RETURNING` for
//!    atomic increment across instances.
//!
//! Schema lives in `sql/schema.sql`.

use anyhow::anyhow;
use async_trait::async_trait;
use axum::http::Method;
use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use sqlx::{PgPool, Row, postgres::PgRow};
use std::net::IpAddr;
use tracing::{Instrument, Span};

use super::{
    error::StoreError,
    models::{ApiKey, ClientContext, SessionToken, TokenMatch, User, UserApiKey, UserApiScope, UserId},
    rate_limit::CounterStore,
    route_matcher::RouteMatcher,
    stores::{
        ApiKeyStore, SessionTokenStore, SharedSessionCache, SingleSignOnStore, TokenLookup,
        UserApiKeyStore, UserStore,
    },
};

const USER_COLUMNS: &str = "id, username, email, active, suspended, admin, moderator, staged, \
     trust_level, last_seen_at";

const TOKEN_COLUMNS: &str = "id, user_id, auth_token, prev_auth_token, auth_token_seen, \
     created_at, rotated_at, seen_at, client_ip, user_agent, path, staff, impersonate";

fn query_span(operation: &'static str, statement: &str) -> Span {
    tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = operation,
        db.statement = statement
    )
}

fn user_from_row(row: &PgRow) -> Result<User, StoreError> {
    let trust_level: i16 = row.try_get("trust_level")?;
    Ok(User {
        id: row.try_get("id")?,
        username: row.try_get("username")?,
        email: row.try_get("email")?,
        active: row.try_get("active")?,
        suspended: row.try_get("suspended")?,
        admin: row.try_get("admin")?,
        moderator: row.try_get("moderator")?,
        staged: row.try_get("staged")?,
        trust_level: u8::try_from(trust_level).unwrap_or(0),
        last_seen_at: row.try_get("last_seen_at")?,
    })
}

fn token_from_row(row: &PgRow) -> Result<SessionToken, StoreError> {
    let client_ip: Option<IpNetwork> = row.try_get("client_ip")?;
    Ok(SessionToken {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        auth_token_hash: row.try_get("auth_token")?,
        prev_auth_token_hash: row.try_get("prev_auth_token")?,
        auth_token_seen: row.try_get("auth_token_seen")?,
        issued_at: row.try_get("created_at")?,
        rotated_at: row.try_get("rotated_at")?,
        last_seen_at: row.try_get("seen_at")?,
        client_ip: client_ip.map(|net| net.ip()),
        user_agent: row.try_get("user_agent")?,
        path: row.try_get("path")?,
        staff: row.try_get("staff")?,
        impersonate: row.try_get("impersonate")?,
    })
}

/// Scope rows: each row is one rule; `NULL` method or format means "any".
fn scope_from_row(row: &PgRow) -> Result<RouteMatcher, StoreError> {
    let method: Option<String> = row.try_get("http_method")?;
    let action: String = row.try_get("action")?;
    let format: Option<String> = row.try_get("format")?;

    let mut matcher = RouteMatcher::any().actions([action]);
    if let Some(method) = method {
        let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
            .map_err(|err| StoreError::Other(anyhow!("invalid scope method: {err}")))?;
        matcher = matcher.methods([method]);
    }
    if let Some(format) = format {
        matcher = matcher.formats([format]);
    }
    Ok(matcher)
}

/// Record stores over one connection pool.
#[derive(Clone, Debug)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Liveness probe used by the health endpoint.
    ///
    /// # Errors
    /// Returns an error if the database cannot be reached.
    pub async fn ping(&self) -> Result<(), StoreError> {
        let query = "SELECT 1";
        sqlx::query(query)
            .execute(&self.pool)
            .instrument(query_span("SELECT", query))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl UserStore for PgStore {
    async fn find_by_id(&self, id: UserId) -> Result<Option<User>, StoreError> {
        let query = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", &query))
            .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn find_by_username(&self, username: &str) -> Result<Option<User>, StoreError> {
        let query = format!("SELECT {USER_COLUMNS} FROM users WHERE username_lower = $1");
        let row = sqlx::query(&query)
            .bind(username.to_lowercase())
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", &query))
            .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn save(&self, user: &User) -> Result<(), StoreError> {
        let query = r"
            UPDATE users
            SET username = $2, username_lower = LOWER($2), email = $3, active = $4,
                suspended = $5, admin = $6, moderator = $7, staged = $8, trust_level = $9,
                last_seen_at = $10
            WHERE id = $1
        ";
        sqlx::query(query)
            .bind(user.id)
            .bind(&user.username)
            .bind(&user.email)
            .bind(user.active)
            .bind(user.suspended)
            .bind(user.admin)
            .bind(user.moderator)
            .bind(user.staged)
            .bind(i16::from(user.trust_level))
            .bind(user.last_seen_at)
            .execute(&self.pool)
            .instrument(query_span("UPDATE", query))
            .await?;
        Ok(())
    }

    async fn admin_count(&self) -> Result<u64, StoreError> {
        let query = "SELECT COUNT(*) FROM users WHERE admin AND id > 0";
        let row = sqlx::query(query)
            .fetch_one(&self.pool)
            .instrument(query_span("SELECT", query))
            .await?;
        let count: i64 = row.try_get(0)?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn update_last_seen(
        &self,
        id: UserId,
        ip: Option<IpAddr>,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let query = r"
            UPDATE users
            SET last_seen_at = $2, ip_address = COALESCE($3, ip_address)
            WHERE id = $1 AND (last_seen_at IS NULL OR last_seen_at < $2)
        ";
        sqlx::query(query)
            .bind(id)
            .bind(at)
            .bind(ip.map(IpNetwork::from))
            .execute(&self.pool)
            .instrument(query_span("UPDATE", query))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ApiKeyStore for PgStore {
    async fn find_active(&self, key_hash: &[u8]) -> Result<Option<ApiKey>, StoreError> {
        let query = r"
            SELECT id, user_id, allowed_ips, last_used_at
            FROM api_keys
            WHERE key_hash = $1 AND revoked_at IS NULL
        ";
        let Some(row) = sqlx::query(query)
            .bind(key_hash)
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", query))
            .await?
        else {
            return Ok(None);
        };
        let id: i64 = row.try_get("id")?;
        let allowed_ips: Option<Vec<IpNetwork>> = row.try_get("allowed_ips")?;

        let scope_query =
            "SELECT http_method, action, format FROM api_key_scopes WHERE api_key_id = $1";
        let scope_rows = sqlx::query(scope_query)
            .bind(id)
            .fetch_all(&self.pool)
            .instrument(query_span("SELECT", scope_query))
            .await?;
        let scopes = scope_rows
            .iter()
            .map(scope_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(ApiKey {
            id,
            user_id: row.try_get("user_id")?,
            allowed_ips: allowed_ips.unwrap_or_default(),
            scopes,
            last_used_at: row.try_get("last_used_at")?,
        }))
    }

    async fn update_last_used(&self, id: i64, at: DateTime<Utc>) -> Result<(), StoreError> {
        let query = "UPDATE api_keys SET last_used_at = $2 WHERE id = $1";
        sqlx::query(query)
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .instrument(query_span("UPDATE", query))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl UserApiKeyStore for PgStore {
    async fn find_active(&self, key_hash: &[u8]) -> Result<Option<UserApiKey>, StoreError> {
        let query = r"
            SELECT id, user_id, client_id, scopes, last_used_at
            FROM user_api_keys
            WHERE key_hash = $1 AND revoked_at IS NULL
        ";
        let Some(row) = sqlx::query(query)
            .bind(key_hash)
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", query))
            .await?
        else {
            return Ok(None);
        };
        let scope_names: Vec<String> = row.try_get("scopes")?;
        Ok(Some(UserApiKey {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            client_id: row.try_get("client_id")?,
            scopes: scope_names
                .iter()
                .filter_map(|name| UserApiScope::parse(name))
                .collect(),
            last_used_at: row.try_get("last_used_at")?,
        }))
    }

    async fn update_last_used(
        &self,
        id: i64,
        client_id: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let query = r"
            UPDATE user_api_keys
            SET last_used_at = $2, client_id = COALESCE($3, client_id)
            WHERE id = $1
        ";
        sqlx::query(query)
            .bind(id)
            .bind(at)
            .bind(client_id)
            .execute(&self.pool)
            .instrument(query_span("UPDATE", query))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl SingleSignOnStore for PgStore {
    async fn user_id_for_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<UserId>, StoreError> {
        let query = "SELECT user_id FROM single_sign_on_records WHERE external_id = $1";
        let row = sqlx::query(query)
            .bind(external_id)
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", query))
            .await?;
        Ok(row.map(|row| row.try_get("user_id")).transpose()?)
    }
}

#[async_trait]
impl SessionTokenStore for PgStore {
    async fn lookup(
        &self,
        lookup: TokenLookup<'_>,
        context: &ClientContext,
    ) -> Result<Option<SessionToken>, StoreError> {
        let query = format!(
            "SELECT {TOKEN_COLUMNS} FROM user_auth_tokens \
             WHERE (auth_token = $1 OR prev_auth_token = $1) AND rotated_at > $2"
        );
        let Some(row) = sqlx::query(&query)
            .bind(lookup.token_hash)
            .bind(lookup.now - lookup.max_age)
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", &query))
            .await?
        else {
            return Ok(None);
        };
        let token = token_from_row(&row)?;
        let Some(matched) =
            token.match_hash(lookup.token_hash, lookup.now, lookup.max_age, lookup.grace)
        else {
            return Ok(None);
        };
        if !lookup.mark_seen || matched == TokenMatch::Previous {
            return Ok(Some(token));
        }

        let update = format!(
            "UPDATE user_auth_tokens \
             SET auth_token_seen = TRUE, seen_at = $3, client_ip = COALESCE($4, client_ip), \
                 user_agent = COALESCE($5, user_agent), path = COALESCE($6, path) \
             WHERE id = $1 AND auth_token = $2 \
             RETURNING {TOKEN_COLUMNS}"
        );
        let updated = sqlx::query(&update)
            .bind(token.id)
            .bind(lookup.token_hash)
            .bind(lookup.now)
            .bind(context.client_ip.map(IpNetwork::from))
            .bind(context.user_agent.as_deref())
            .bind(context.path.as_deref())
            .fetch_optional(&self.pool)
            .instrument(query_span("UPDATE", &update))
            .await?;
        match updated {
            Some(row) => Ok(Some(token_from_row(&row)?)),
            // Rotated between the read and the write; the old generation still stands.
            None => Ok(Some(token)),
        }
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
        let query = format!(
            "INSERT INTO user_auth_tokens \
                 (user_id, auth_token, auth_token_seen, created_at, rotated_at, client_ip, \
                  user_agent, path, staff, impersonate) \
             VALUES ($1, $2, FALSE, $3, $3, $4, $5, $6, $7, $8) \
             RETURNING {TOKEN_COLUMNS}"
        );
        let row = sqlx::query(&query)
            .bind(user_id)
            .bind(token_hash)
            .bind(now)
            .bind(context.client_ip.map(IpNetwork::from))
            .bind(context.user_agent.as_deref())
            .bind(context.path.as_deref())
            .bind(staff)
            .bind(impersonate)
            .fetch_one(&self.pool)
            .instrument(query_span("INSERT", &query))
            .await?;
        token_from_row(&row)
    }

    async fn rotate(
        &self,
        token: &SessionToken,
        new_hash: Vec<u8>,
        context: &ClientContext,
        now: DateTime<Utc>,
    ) -> Result<Option<SessionToken>, StoreError> {
        let query = format!(
            "UPDATE user_auth_tokens \
             SET prev_auth_token = auth_token, auth_token = $3, auth_token_seen = FALSE, \
                 rotated_at = $4, client_ip = COALESCE($5, client_ip), \
                 user_agent = COALESCE($6, user_agent) \
             WHERE id = $1 AND auth_token = $2 \
             RETURNING {TOKEN_COLUMNS}"
        );
        let row = sqlx::query(&query)
            .bind(token.id)
            .bind(&token.auth_token_hash)
            .bind(new_hash)
            .bind(now)
            .bind(context.client_ip.map(IpNetwork::from))
            .bind(context.user_agent.as_deref())
            .fetch_optional(&self.pool)
            .instrument(query_span("UPDATE", &query))
            .await?;
        row.as_ref().map(token_from_row).transpose()
    }

    async fn destroy(&self, id: i64) -> Result<(), StoreError> {
        let query = "DELETE FROM user_auth_tokens WHERE id = $1";
        sqlx::query(query)
            .bind(id)
            .execute(&self.pool)
            .instrument(query_span("DELETE", query))
            .await?;
        Ok(())
    }

    async fn destroy_all(&self, user_id: UserId) -> Result<(), StoreError> {
        let query = "DELETE FROM user_auth_tokens WHERE user_id = $1";
        sqlx::query(query)
            .bind(user_id)
            .execute(&self.pool)
            .instrument(query_span("DELETE", query))
            .await?;
        Ok(())
    }

    async fn enforce_session_count_limit(
        &self,
        user_id: UserId,
        max_sessions: usize,
    ) -> Result<(), StoreError> {
        let query = r"
            DELETE FROM user_auth_tokens
            WHERE user_id = $1 AND id NOT IN (
                SELECT id FROM user_auth_tokens
                WHERE user_id = $1
                ORDER BY rotated_at DESC, id DESC
                LIMIT $2
            )
        ";
        sqlx::query(query)
            .bind(user_id)
            .bind(i64::try_from(max_sessions).unwrap_or(i64::MAX))
            .execute(&self.pool)
            .instrument(query_span("DELETE", query))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl SharedSessionCache for PgStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let query = r"
            SELECT user_id::text AS user_id
            FROM shared_sessions
            WHERE key = $1 AND (expires_at IS NULL OR expires_at > NOW())
        ";
        let row = sqlx::query(query)
            .bind(key)
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", query))
            .await?;
        Ok(row.map(|row| row.try_get("user_id")).transpose()?)
    }
}

/// Fixed-window counters shared by every instance.
#[derive(Clone, Debug)]
pub struct PgCounterStore {
    pool: PgPool,
}

impl PgCounterStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Delete counters whose window has closed.
    ///
    /// # Errors
    /// Returns an error if the delete fails.
    pub async fn purge_expired(&self) -> Result<u64, StoreError> {
        let query = "DELETE FROM rate_limit_counters WHERE expires_at <= NOW()";
        let result = sqlx::query(query)
            .execute(&self.pool)
            .instrument(query_span("DELETE", query))
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl CounterStore for PgCounterStore {
    async fn peek(&self, key: &str) -> Result<u64, StoreError> {
        let query = "SELECT count FROM rate_limit_counters WHERE key = $1 AND expires_at > NOW()";
        let row = sqlx::query(query)
            .bind(key)
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", query))
            .await?;
        let count: i64 = match row {
            Some(row) => row.try_get("count")?,
            None => 0,
        };
        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn increment(&self, key: &str, ttl_seconds: u64) -> Result<u64, StoreError> {
        let query = r"
            INSERT INTO rate_limit_counters (key, count, expires_at)
            VALUES ($1, 1, NOW() + ($2 * INTERVAL '1 second'))
            ON CONFLICT (key) DO UPDATE SET
                count = CASE
                    WHEN rate_limit_counters.expires_at <= NOW() THEN 1
                    ELSE rate_limit_counters.count + 1
                END,
                expires_at = CASE
                    WHEN rate_limit_counters.expires_at <= NOW() THEN EXCLUDED.expires_at
                    ELSE rate_limit_counters.expires_at
                END
            RETURNING count
        ";
        let row = sqlx::query(query)
            .bind(key)
            .bind(i64::try_from(ttl_seconds).unwrap_or(i64::MAX))
            .fetch_one(&self.pool)
            .instrument(query_span("UPSERT", query))
            .await?;
        let count: i64 = row.try_get("count")?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}
