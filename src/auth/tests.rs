//! Resolver and session manager scenarios over the in-memory stores.

use anyhow::{Result, anyhow};
use axum::http::{Request, request::Builder};
use chrono::Duration;
use secrecy::SecretString;
use std::net::IpAddr;
use std::sync::Arc;

use super::{
    AuthConfig, AuthError, AuthState, AuthStores, Identity, IdentityKind, LogOnOptions,
    RequestContext, ResponseCookies, RouteAction, SameSitePolicy, SessionEvent, SiteState,
    clock::{Clock, ManualClock},
    cookie::{AuthCookie, AuthCookieCodec},
    credentials::AuthRequest,
    deferred::TaskQueue,
    memory::{MemoryCounterStore, MemoryStore},
    models::{ApiKey, User, UserApiKey, UserApiScope},
    rate_limit::CounterStore,
    tokens::{generate_session_token, hash_secret_hex},
};

const COOKIE_SECRET: &str = "test-cookie-secret-material";

struct Harness {
    store: Arc<MemoryStore>,
    counters: Arc<MemoryCounterStore>,
    clock: Arc<ManualClock>,
    site: Arc<SiteState>,
    state: AuthState,
}

impl Harness {
    fn new(config: AuthConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let counters = Arc::new(MemoryCounterStore::new());
        let clock = Arc::new(ManualClock::aligned());
        let site = Arc::new(SiteState::new(false));
        let stores = AuthStores::from_single(store.clone(), counters.clone());
        let state = AuthState::new(
            config,
            site.clone(),
            stores,
            SecretString::from(COOKIE_SECRET.to_string()),
            clock.clone(),
            TaskQueue::spawn(),
        );
        Self {
            store,
            counters,
            clock,
            site,
            state,
        }
    }

    async fn resolve(
        &self,
        request: &AuthRequest,
    ) -> (Result<Option<User>, AuthError>, RequestContext) {
        let mut ctx = RequestContext::new();
        let result = self.state.resolver().current_user(request, &mut ctx).await;
        (result, ctx)
    }

    async fn log_on_with(&self, user: User, options: LogOnOptions) -> Result<(String, RequestContext)> {
        let request = request(Request::post("/session"));
        let mut ctx = RequestContext::new();
        let mut cookies = ResponseCookies::new();
        self.state
            .sessions()
            .log_on(user, &request, &mut ctx, &mut cookies, options)
            .await?;
        let value = cookie_value(&cookies, "_t").ok_or_else(|| anyhow!("no session cookie"))?;
        Ok((value, ctx))
    }

    async fn log_on(&self, user: User) -> Result<String> {
        Ok(self.log_on_with(user, LogOnOptions::default()).await?.0)
    }

    /// A correctly signed cookie whose token the server never issued.
    fn forged_cookie(&self) -> Result<String> {
        let codec = AuthCookieCodec::new(SecretString::from(COOKIE_SECRET.to_string()));
        let cookie = AuthCookie {
            token: generate_session_token()?,
            user_id: Some(1),
            trust_level: Some(1),
            issued_at: self.clock.now().timestamp(),
            valid_for: 3600,
        };
        Ok(codec.encode(&cookie)?)
    }

    fn admin_window_key(&self) -> String {
        format!("admin_api_min:{}", self.clock.now().timestamp() / 60)
    }
}

fn request(builder: Builder) -> AuthRequest {
    request_from(builder, [10, 0, 0, 1])
}

fn request_from(builder: Builder, peer: [u8; 4]) -> AuthRequest {
    let (parts, ()) = builder
        .body(())
        .map(Request::into_parts)
        .unwrap_or_else(|_| Request::new(()).into_parts());
    AuthRequest::from_parts(&parts, Some(IpAddr::from(peer)), None)
}

fn with_cookie(path: &str, value: &str) -> AuthRequest {
    request(Request::get(path).header("Cookie", format!("_t={value}")))
}

fn cookie_value(cookies: &ResponseCookies, name: &str) -> Option<String> {
    let header = cookies.get(name)?;
    let pair = header.split(';').next()?;
    let (_, value) = pair.split_once('=')?;
    (!value.is_empty()).then(|| value.to_string())
}

fn user(id: i64, username: &str) -> User {
    User {
        id,
        username: username.to_string(),
        email: format!("{}@example.com", username.to_lowercase()),
        active: true,
        suspended: false,
        admin: false,
        moderator: false,
        staged: false,
        trust_level: 1,
        last_seen_at: None,
    }
}

fn api_key(id: i64, user_id: Option<i64>) -> ApiKey {
    ApiKey {
        id,
        user_id,
        allowed_ips: Vec::new(),
        scopes: Vec::new(),
        last_used_at: None,
    }
}

fn user_api_key(id: i64, user_id: i64, scopes: Vec<UserApiScope>) -> UserApiKey {
    UserApiKey {
        id,
        user_id,
        client_id: None,
        scopes,
        last_used_at: None,
    }
}

fn invalid_access_reason(result: Result<Option<User>, AuthError>) -> Option<String> {
    match result {
        Err(AuthError::InvalidAccess(err)) => Some(err.reason.unwrap_or_default()),
        _ => None,
    }
}

#[tokio::test]
async fn no_credentials_resolve_anonymous_without_touching_limiters() -> Result<()> {
    let h = Harness::new(AuthConfig::new());
    let (result, ctx) = h.resolve(&request(Request::get("/latest"))).await;

    assert_eq!(result?, None);
    assert_eq!(ctx.identity(), Some(&Identity::Anonymous));
    assert!(!ctx.bad_token());
    assert!(h.counters.is_empty());
    Ok(())
}

#[tokio::test]
async fn api_key_resolves_bound_user_and_counts_admin_limit() -> Result<()> {
    let h = Harness::new(AuthConfig::new());
    h.store.insert_user(user(1, "alice")).await;
    h.store.insert_api_key("k1", api_key(10, Some(1))).await;

    let (result, ctx) = h
        .resolve(&request(Request::get("/latest.json").header("Api-Key", "k1")))
        .await;

    assert_eq!(result?.map(|u| u.username), Some("alice".to_string()));
    assert!(ctx.is_api());
    assert_eq!(ctx.identity().map(Identity::kind), Some(IdentityKind::ApiKey));
    assert_eq!(h.counters.peek(&h.admin_window_key()).await?, 1);
    let key = h.store.api_key(10).await.ok_or_else(|| anyhow!("key missing"))?;
    assert!(key.last_used_at.is_some());
    Ok(())
}

#[tokio::test]
async fn api_key_takes_precedence_over_cookie() -> Result<()> {
    let h = Harness::new(AuthConfig::new());
    h.store.insert_user(user(1, "alice")).await;
    h.store.insert_user(user(2, "bob")).await;
    h.store.insert_api_key("k1", api_key(10, Some(1))).await;
    let bob_cookie = h.log_on(user(2, "bob")).await?;

    let (result, ctx) = h
        .resolve(&request(
            Request::get("/latest.json")
                .header("Api-Key", "k1")
                .header("Cookie", format!("_t={bob_cookie}")),
        ))
        .await;

    assert_eq!(result?.map(|u| u.id), Some(1));
    assert!(ctx.session_token().is_none());
    Ok(())
}

#[tokio::test]
async fn api_user_selectors() -> Result<()> {
    let h = Harness::new(AuthConfig::new());
    h.store.insert_user(user(1, "Alice")).await;
    h.store.insert_api_key("any-user", api_key(10, None)).await;
    h.store.link_external_id("ext-1", 1).await;

    for (header, value) in [
        ("Api-Username", "alice"),
        ("Api-User-Id", "1"),
        ("Api-User-External-Id", "ext-1"),
    ] {
        let (result, _) = h
            .resolve(&request(
                Request::get("/latest.json")
                    .header("Api-Key", "any-user")
                    .header(header, value),
            ))
            .await;
        assert_eq!(result?.map(|u| u.id), Some(1), "selector {header}");
    }

    let (result, _) = h
        .resolve(&request(Request::get("/latest.json").header("Api-Key", "any-user")))
        .await;
    assert_eq!(
        invalid_access_reason(result).as_deref(),
        Some("invalid_api_credentials")
    );

    let (result, _) = h
        .resolve(&request(
            Request::get("/latest.json")
                .header("Api-Key", "any-user")
                .header("Api-User-Id", "not-a-number"),
        ))
        .await;
    assert!(invalid_access_reason(result).is_some());
    Ok(())
}

#[tokio::test]
async fn bound_key_rejects_mismatched_username() -> Result<()> {
    let h = Harness::new(AuthConfig::new());
    h.store.insert_user(user(1, "alice")).await;
    h.store.insert_user(user(2, "bob")).await;
    h.store.insert_api_key("k1", api_key(10, Some(1))).await;

    let (result, _) = h
        .resolve(&request(
            Request::get("/latest.json")
                .header("Api-Key", "k1")
                .header("Api-Username", "bob"),
        ))
        .await;
    assert!(invalid_access_reason(result).is_some());
    Ok(())
}

#[tokio::test]
async fn unknown_api_key_is_rejected() {
    let h = Harness::new(AuthConfig::new());
    let (result, ctx) = h
        .resolve(&request(Request::get("/latest.json").header("Api-Key", "nope")))
        .await;
    assert!(invalid_access_reason(result).is_some());
    assert!(!ctx.is_resolved());
}

#[tokio::test]
async fn rejection_is_replayed_within_a_request() -> Result<()> {
    let h = Harness::new(AuthConfig::new());
    h.store.insert_user(user(1, "alice")).await;
    let req = request(Request::get("/latest.json").header("Api-Key", "k1"));

    let mut ctx = RequestContext::new();
    let first = h.state.resolver().current_user(&req, &mut ctx).await;
    assert_eq!(
        invalid_access_reason(first).as_deref(),
        Some("invalid_api_credentials")
    );
    assert!(ctx.is_rejected());

    // The key appearing now does not matter: the request already failed.
    h.store.insert_api_key("k1", api_key(10, Some(1))).await;
    let second = h.state.resolver().current_user(&req, &mut ctx).await;
    assert_eq!(
        invalid_access_reason(second).as_deref(),
        Some("invalid_api_credentials")
    );
    assert_eq!(h.counters.peek(&h.admin_window_key()).await?, 0);
    Ok(())
}

#[tokio::test]
async fn api_key_ip_allow_list_is_enforced() -> Result<()> {
    let h = Harness::new(AuthConfig::new());
    h.store.insert_user(user(1, "alice")).await;
    let mut key = api_key(10, Some(1));
    key.allowed_ips = vec!["10.0.0.0/8".parse()?];
    h.store.insert_api_key("k1", key).await;

    let (allowed, _) = h
        .resolve(&request(Request::get("/latest.json").header("Api-Key", "k1")))
        .await;
    assert_eq!(allowed?.map(|u| u.id), Some(1));

    let (denied, _) = h
        .resolve(&request_from(
            Request::get("/latest.json").header("Api-Key", "k1"),
            [192, 168, 1, 1],
        ))
        .await;
    assert!(invalid_access_reason(denied).is_some());
    Ok(())
}

#[tokio::test]
async fn forwarded_header_cannot_satisfy_ip_allow_list() -> Result<()> {
    let h = Harness::new(AuthConfig::new());
    h.store.insert_user(user(1, "alice")).await;
    let mut key = api_key(10, Some(1));
    key.allowed_ips = vec!["192.0.2.0/24".parse()?];
    h.store.insert_api_key("k1", key).await;

    let (denied, _) = h
        .resolve(&request(
            Request::get("/latest.json")
                .header("Api-Key", "k1")
                .header("X-Forwarded-For", "192.0.2.7")
                .header("X-Real-IP", "192.0.2.7"),
        ))
        .await;
    assert_eq!(
        invalid_access_reason(denied).as_deref(),
        Some("invalid_api_credentials")
    );
    Ok(())
}

#[tokio::test]
async fn configured_ip_header_names_the_client() -> Result<()> {
    let h = Harness::new(AuthConfig::new().with_client_ip_header(Some("X-Real-IP".to_string())));
    h.store.insert_user(user(1, "alice")).await;
    let mut key = api_key(10, Some(1));
    key.allowed_ips = vec!["192.0.2.0/24".parse()?];
    h.store.insert_api_key("k1", key).await;

    let (parts, ()) = Request::get("/latest.json")
        .header("Api-Key", "k1")
        .header("X-Real-IP", "192.0.2.7")
        .body(())
        .map(Request::into_parts)
        .unwrap_or_else(|_| Request::new(()).into_parts());
    let behind_proxy = AuthRequest::from_parts(
        &parts,
        Some(IpAddr::from([10, 0, 0, 1])),
        h.state.config().client_ip_header(),
    );
    let (allowed, _) = h.resolve(&behind_proxy).await;
    assert_eq!(allowed?.map(|u| u.id), Some(1));
    Ok(())
}

#[tokio::test]
async fn admin_api_limit_applies_unless_profiling() -> Result<()> {
    let h = Harness::new(AuthConfig::new().with_admin_api_reqs_per_minute(2));
    h.store.insert_user(user(1, "alice")).await;
    h.store.insert_api_key("k1", api_key(10, Some(1))).await;
    let req = request(Request::get("/latest.json").header("Api-Key", "k1"));

    for _ in 0..2 {
        assert!(h.resolve(&req).await.0.is_ok());
    }
    match h.resolve(&req).await.0 {
        Err(AuthError::LimitExceeded(err)) => {
            assert_eq!(err.error_code, "admin_api_key_rate_limit");
            assert!(err.available_in <= 60);
        }
        other => panic!("expected limit, got {other:?}"),
    }

    let profiling = Harness::new(
        AuthConfig::new()
            .with_admin_api_reqs_per_minute(2)
            .with_profiling(true),
    );
    profiling.store.insert_user(user(1, "alice")).await;
    profiling.store.insert_api_key("k1", api_key(10, Some(1))).await;
    for _ in 0..5 {
        assert!(profiling.resolve(&req).await.0.is_ok());
    }
    assert!(profiling.counters.is_empty());
    Ok(())
}

#[tokio::test]
async fn query_credentials_only_on_allow_listed_routes() -> Result<()> {
    let h = Harness::new(AuthConfig::new());
    h.store.insert_user(user(1, "alice")).await;
    h.store.insert_api_key("k1", api_key(10, None)).await;

    let (mut parts, ()) = Request::get("/latest.rss?api_key=k1&api_username=alice")
        .body(())
        .map(Request::into_parts)
        .unwrap_or_else(|_| Request::new(()).into_parts());
    parts.extensions.insert(RouteAction("list#latest_feed"));
    let feed = AuthRequest::from_parts(&parts, None, None);
    let (result, ctx) = h.resolve(&feed).await;
    assert_eq!(result?.map(|u| u.id), Some(1));
    assert!(ctx.is_api());

    let (result, ctx) = h
        .resolve(&request(Request::get("/latest.json?api_key=k1&api_username=alice")))
        .await;
    assert_eq!(result?, None);
    assert!(!ctx.is_api());
    Ok(())
}

#[tokio::test]
async fn session_cookie_resolves_and_marks_seen() -> Result<()> {
    let h = Harness::new(AuthConfig::new());
    h.store.insert_user(user(1, "alice")).await;
    let cookie = h.log_on(user(1, "alice")).await?;

    let (result, ctx) = h.resolve(&with_cookie("/t/1", &cookie)).await;
    assert_eq!(result?.map(|u| u.id), Some(1));
    assert_eq!(ctx.identity().map(Identity::kind), Some(IdentityKind::Session));
    let token = ctx.session_token().ok_or_else(|| anyhow!("token missing"))?;
    assert!(token.auth_token_seen);
    assert_eq!(token.path.as_deref(), Some("/t/1"));
    assert!(h.counters.is_empty(), "successful lookups are not counted");
    Ok(())
}

#[tokio::test]
async fn tampered_cookie_never_resolves() -> Result<()> {
    let h = Harness::new(AuthConfig::new());
    h.store.insert_user(user(1, "alice")).await;
    let cookie = h.log_on(user(1, "alice")).await?;
    let (payload, _) = cookie.split_once('.').ok_or_else(|| anyhow!("bad cookie"))?;
    let tampered = format!("{payload}.AAAA");

    let (result, ctx) = h.resolve(&with_cookie("/", &tampered)).await;
    assert_eq!(result?, None);
    assert!(ctx.bad_token());
    Ok(())
}

#[tokio::test]
async fn cookie_signed_for_another_user_is_ignored() -> Result<()> {
    let h = Harness::new(AuthConfig::new());
    h.store.insert_user(user(1, "alice")).await;
    h.store.insert_user(user(2, "bob")).await;
    let cookie = h.log_on(user(1, "alice")).await?;

    let codec = AuthCookieCodec::new(SecretString::from(COOKIE_SECRET.to_string()));
    let mut decoded = codec.decode(&cookie, false, h.clock.now())?;
    decoded.user_id = Some(2);
    let swapped = codec.encode(&decoded)?;

    let (result, ctx) = h.resolve(&with_cookie("/", &swapped)).await;
    assert_eq!(result?, None);
    assert!(ctx.bad_token());
    Ok(())
}

#[tokio::test]
async fn failed_cookie_lookups_are_rate_limited_per_ip() -> Result<()> {
    let h = Harness::new(AuthConfig::new().with_cookie_attempts_per_minute(3));
    let forged = h.forged_cookie()?;
    let req = with_cookie("/", &forged);

    for _ in 0..3 {
        let (result, ctx) = h.resolve(&req).await;
        assert_eq!(result?, None);
        assert!(ctx.bad_token());
    }
    match h.resolve(&req).await.0 {
        Err(AuthError::InvalidAccess(err)) => {
            assert_eq!(err.delete_cookie.as_deref(), Some("_t"));
            assert_eq!(err.reason.as_deref(), Some("cookie_auth_rate_limit"));
        }
        other => panic!("expected rejection, got {other:?}"),
    }

    // Another address has its own budget.
    let other_ip = request_from(
        Request::get("/").header("Cookie", format!("_t={forged}")),
        [172, 16, 0, 9],
    );
    assert_eq!(h.resolve(&other_ip).await.0?, None);

    // The window resets.
    h.clock.advance(Duration::seconds(60));
    assert_eq!(h.resolve(&req).await.0?, None);
    Ok(())
}

#[tokio::test]
async fn spoofed_forwarded_header_does_not_reset_cookie_limiter() -> Result<()> {
    let h = Harness::new(AuthConfig::new().with_cookie_attempts_per_minute(3));
    let forged = h.forged_cookie()?;

    let mut rejected = 0;
    for i in 0..10 {
        let req = request(
            Request::get("/")
                .header("Cookie", format!("_t={forged}"))
                .header("X-Forwarded-For", format!("203.0.113.{i}")),
        );
        if invalid_access_reason(h.resolve(&req).await.0).as_deref()
            == Some("cookie_auth_rate_limit")
        {
            rejected += 1;
        }
    }
    assert_eq!(rejected, 7);
    Ok(())
}

#[tokio::test]
async fn logged_in_hint_without_cookie_marks_bad_token() -> Result<()> {
    let h = Harness::new(AuthConfig::new());
    let (result, ctx) = h
        .resolve(&request(Request::get("/").header("X-Logged-In", "true")))
        .await;
    assert_eq!(result?, None);
    assert!(ctx.bad_token());
    Ok(())
}

#[tokio::test]
async fn read_only_token_store_degrades_to_no_token() -> Result<()> {
    let h = Harness::new(AuthConfig::new());
    h.store.insert_user(user(1, "alice")).await;
    let cookie = h.log_on(user(1, "alice")).await?;
    h.store.set_read_only(true);

    let (result, ctx) = h.resolve(&with_cookie("/", &cookie)).await;
    assert_eq!(result?, None);
    assert!(ctx.bad_token());
    Ok(())
}

#[tokio::test]
async fn read_only_site_still_resolves_without_marking_seen() -> Result<()> {
    let h = Harness::new(AuthConfig::new());
    h.store.insert_user(user(1, "alice")).await;
    let cookie = h.log_on(user(1, "alice")).await?;
    h.site.set_read_only(true);

    let (result, ctx) = h.resolve(&with_cookie("/", &cookie)).await;
    assert_eq!(result?.map(|u| u.id), Some(1));
    assert!(ctx.session_token().is_some_and(|t| !t.auth_token_seen));
    Ok(())
}

#[tokio::test]
async fn sessions_expire_at_maximum_age() -> Result<()> {
    let h = Harness::new(AuthConfig::new().with_maximum_session_age_hours(1));
    h.store.insert_user(user(1, "alice")).await;
    let cookie = h.log_on(user(1, "alice")).await?;

    h.clock.advance(Duration::minutes(30));
    assert_eq!(h.resolve(&with_cookie("/", &cookie)).await.0?.map(|u| u.id), Some(1));

    h.clock.advance(Duration::minutes(31));
    let (result, ctx) = h.resolve(&with_cookie("/", &cookie)).await;
    assert_eq!(result?, None);
    assert!(ctx.bad_token());
    Ok(())
}

#[tokio::test]
async fn suspended_users_never_resolve() -> Result<()> {
    let h = Harness::new(AuthConfig::new());
    h.store.insert_user(user(1, "alice")).await;
    let cookie = h.log_on(user(1, "alice")).await?;
    h.store.insert_api_key("k1", api_key(10, Some(1))).await;
    h.store
        .insert_user_api_key("u1", user_api_key(20, 1, vec![UserApiScope::Read]))
        .await;
    h.store
        .insert_user(User {
            suspended: true,
            ..user(1, "alice")
        })
        .await;

    let (by_cookie, ctx) = h.resolve(&with_cookie("/", &cookie)).await;
    assert_eq!(by_cookie?, None);
    assert_eq!(ctx.identity(), Some(&Identity::Anonymous));

    let (by_api_key, _) = h
        .resolve(&request(Request::get("/latest.json").header("Api-Key", "k1")))
        .await;
    assert!(invalid_access_reason(by_api_key).is_some());

    let (by_user_api_key, _) = h
        .resolve(&request(Request::get("/latest.json").header("User-Api-Key", "u1")))
        .await;
    assert!(invalid_access_reason(by_user_api_key).is_some());
    Ok(())
}

#[tokio::test]
async fn user_api_key_resolves_with_both_limits() -> Result<()> {
    let h = Harness::new(AuthConfig::new().with_user_api_reqs_per_minute(2));
    h.store.insert_user(user(1, "alice")).await;
    h.store
        .insert_user_api_key("u1", user_api_key(20, 1, vec![UserApiScope::Read]))
        .await;
    let req = request(
        Request::get("/latest.json")
            .header("User-Api-Key", "u1")
            .header("User-Api-Client-Id", "app-1"),
    );

    let (result, ctx) = h.resolve(&req).await;
    assert_eq!(result?.map(|u| u.id), Some(1));
    assert!(ctx.is_user_api());
    assert!(!ctx.is_api());
    assert_eq!(ctx.hashed_user_api_key(), Some(hash_secret_hex("u1").as_str()));

    let key = h
        .store
        .user_api_key(20)
        .await
        .ok_or_else(|| anyhow!("key missing"))?;
    assert!(key.last_used_at.is_some());
    assert_eq!(key.client_id.as_deref(), Some("app-1"));

    let hashed = hash_secret_hex("u1");
    let day_key = format!("user_api_day_{hashed}:{}", h.clock.now().timestamp() / 86_400);
    assert_eq!(h.counters.peek(&day_key).await?, 1);

    assert!(h.resolve(&req).await.0.is_ok());
    match h.resolve(&req).await.0 {
        Err(AuthError::LimitExceeded(err)) => {
            assert_eq!(err.error_code, "user_api_key_limiter_60_mins");
        }
        other => panic!("expected limit, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn user_api_daily_limit_is_independent() -> Result<()> {
    let h = Harness::new(
        AuthConfig::new()
            .with_user_api_reqs_per_minute(100)
            .with_user_api_reqs_per_day(2),
    );
    h.store.insert_user(user(1, "alice")).await;
    h.store
        .insert_user_api_key("u1", user_api_key(20, 1, vec![UserApiScope::Read]))
        .await;
    let req = request(Request::get("/latest.json").header("User-Api-Key", "u1"));

    assert!(h.resolve(&req).await.0.is_ok());
    h.clock.advance(Duration::minutes(5));
    assert!(h.resolve(&req).await.0.is_ok());
    h.clock.advance(Duration::minutes(5));
    match h.resolve(&req).await.0 {
        Err(AuthError::LimitExceeded(err)) => {
            assert_eq!(err.error_code, "user_api_key_limiter_1_day");
        }
        other => panic!("expected limit, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn user_api_key_scope_is_enforced() -> Result<()> {
    let h = Harness::new(AuthConfig::new());
    h.store.insert_user(user(1, "alice")).await;
    h.store
        .insert_user_api_key("u1", user_api_key(20, 1, vec![UserApiScope::Read]))
        .await;

    let (result, _) = h
        .resolve(&request(Request::post("/posts.json").header("User-Api-Key", "u1")))
        .await;
    assert_eq!(
        invalid_access_reason(result).as_deref(),
        Some("invalid_user_api_key")
    );

    let (result, _) = h
        .resolve(&request(Request::get("/posts.json").header("User-Api-Key", "missing")))
        .await;
    assert!(invalid_access_reason(result).is_some());
    Ok(())
}

#[tokio::test]
async fn both_key_kinds_are_ambiguous() {
    let h = Harness::new(AuthConfig::new());
    let (result, _) = h
        .resolve(&request(
            Request::get("/latest.json")
                .header("Api-Key", "k1")
                .header("User-Api-Key", "u1"),
        ))
        .await;
    assert_eq!(
        invalid_access_reason(result).as_deref(),
        Some("ambiguous_credentials")
    );
}

#[tokio::test]
async fn shared_session_header_bypasses_other_credentials() -> Result<()> {
    let h = Harness::new(AuthConfig::new());
    h.store.insert_user(user(1, "alice")).await;
    h.store
        .insert_user(User {
            suspended: true,
            ..user(2, "mallory")
        })
        .await;
    h.store.insert_shared_session("shared-1", 1).await;
    h.store.insert_shared_session("shared-2", 2).await;

    let (result, _) = h
        .resolve(&request(
            Request::get("/")
                .header("X-Shared-Session-Key", "shared-1")
                .header("Api-Key", "not-checked"),
        ))
        .await;
    assert_eq!(result?.map(|u| u.id), Some(1));

    let (result, _) = h
        .resolve(&request(Request::get("/").header("X-Shared-Session-Key", "unknown")))
        .await;
    assert_eq!(result?, None);

    let (result, _) = h
        .resolve(&request(Request::get("/").header("X-Shared-Session-Key", "shared-2")))
        .await;
    assert_eq!(result?, None);
    Ok(())
}

#[tokio::test]
async fn last_seen_policy() -> Result<()> {
    let h = Harness::new(AuthConfig::new());
    h.store.insert_user(user(1, "alice")).await;
    let cookie = h.log_on(user(1, "alice")).await?;

    let xhr = request(
        Request::get("/")
            .header("Cookie", format!("_t={cookie}"))
            .header("X-Requested-With", "XMLHttpRequest"),
    );
    h.resolve(&xhr).await.0?;
    h.state.tasks().flush().await;
    assert!(h.store.user(1).await.is_some_and(|u| u.last_seen_at.is_none()));

    let xhr_present = request(
        Request::get("/")
            .header("Cookie", format!("_t={cookie}"))
            .header("X-Requested-With", "XMLHttpRequest")
            .header("X-Client-Present", "true"),
    );
    h.resolve(&xhr_present).await.0?;
    h.state.tasks().flush().await;
    assert!(h.store.user(1).await.is_some_and(|u| u.last_seen_at.is_some()));
    Ok(())
}

#[tokio::test]
async fn page_loads_update_last_seen_unless_read_only() -> Result<()> {
    let h = Harness::new(AuthConfig::new());
    h.store.insert_user(user(1, "alice")).await;
    let cookie = h.log_on(user(1, "alice")).await?;

    h.site.set_read_only(true);
    h.resolve(&with_cookie("/", &cookie)).await.0?;
    h.state.tasks().flush().await;
    assert!(h.store.user(1).await.is_some_and(|u| u.last_seen_at.is_none()));

    h.site.set_read_only(false);
    h.resolve(&with_cookie("/", &cookie)).await.0?;
    h.state.tasks().flush().await;
    assert_eq!(
        h.store.user(1).await.and_then(|u| u.last_seen_at),
        Some(h.clock.now())
    );
    Ok(())
}

#[tokio::test]
async fn api_requests_need_client_present_hint_for_last_seen() -> Result<()> {
    let h = Harness::new(AuthConfig::new());
    h.store.insert_user(user(1, "alice")).await;
    h.store.insert_api_key("k1", api_key(10, Some(1))).await;

    h.resolve(&request(Request::get("/latest.json").header("Api-Key", "k1")))
        .await
        .0?;
    h.state.tasks().flush().await;
    assert!(h.store.user(1).await.is_some_and(|u| u.last_seen_at.is_none()));
    Ok(())
}

#[tokio::test]
async fn rotation_reissues_cookie_and_keeps_old_secret_briefly() -> Result<()> {
    let h = Harness::new(AuthConfig::new());
    let mut events = h.state.sessions().subscribe();
    h.store.insert_user(user(1, "alice")).await;
    let old_cookie = h.log_on(user(1, "alice")).await?;

    h.clock.advance(Duration::minutes(11));
    let req = with_cookie("/", &old_cookie);
    let (result, mut ctx) = h.resolve(&req).await;
    assert_eq!(result?.map(|u| u.id), Some(1));

    let mut cookies = ResponseCookies::new();
    h.state
        .sessions()
        .refresh_session(&req, &mut ctx, &mut cookies)
        .await?;
    let new_cookie = cookie_value(&cookies, "_t").ok_or_else(|| anyhow!("not rotated"))?;
    assert_ne!(new_cookie, old_cookie);
    assert_eq!(events.try_recv()?, SessionEvent::SessionRefreshed { user_id: 1 });

    // In-flight requests with the old secret still authenticate.
    h.clock.advance(Duration::seconds(30));
    let (result, mut ctx) = h.resolve(&with_cookie("/", &old_cookie)).await;
    assert_eq!(result?.map(|u| u.id), Some(1));
    let mut cookies = ResponseCookies::new();
    h.state
        .sessions()
        .refresh_session(&req, &mut ctx, &mut cookies)
        .await?;
    assert!(cookies.is_empty());

    let (result, _) = h.resolve(&with_cookie("/", &new_cookie)).await;
    assert_eq!(result?.map(|u| u.id), Some(1));

    // After the grace window the old secret is dead.
    h.clock.advance(Duration::minutes(2));
    let (result, ctx) = h.resolve(&with_cookie("/", &old_cookie)).await;
    assert_eq!(result?, None);
    assert!(ctx.bad_token());
    let (result, _) = h.resolve(&with_cookie("/", &new_cookie)).await;
    assert_eq!(result?.map(|u| u.id), Some(1));
    Ok(())
}

#[tokio::test]
async fn concurrent_rotation_has_one_winner() -> Result<()> {
    let h = Harness::new(AuthConfig::new());
    h.store.insert_user(user(1, "alice")).await;
    let cookie = h.log_on(user(1, "alice")).await?;
    h.clock.advance(Duration::minutes(11));

    let req = with_cookie("/", &cookie);
    let (first, mut first_ctx) = h.resolve(&req).await;
    let (second, mut second_ctx) = h.resolve(&req).await;
    assert!(first?.is_some() && second?.is_some());

    let mut first_cookies = ResponseCookies::new();
    let mut second_cookies = ResponseCookies::new();
    h.state
        .sessions()
        .refresh_session(&req, &mut first_ctx, &mut first_cookies)
        .await?;
    h.state
        .sessions()
        .refresh_session(&req, &mut second_ctx, &mut second_cookies)
        .await?;

    assert!(cookie_value(&first_cookies, "_t").is_some());
    assert!(second_cookies.is_empty());
    assert_eq!(h.store.tokens_for(1).await.len(), 1);
    Ok(())
}

#[tokio::test]
async fn refresh_session_skips_api_and_unresolved_requests() -> Result<()> {
    let h = Harness::new(AuthConfig::new());
    h.store.insert_user(user(1, "alice")).await;
    h.store.insert_api_key("k1", api_key(10, Some(1))).await;
    let forged = h.forged_cookie()?;

    let unresolved = with_cookie("/", &forged);
    let mut ctx = RequestContext::new();
    let mut cookies = ResponseCookies::new();
    h.state
        .sessions()
        .refresh_session(&unresolved, &mut ctx, &mut cookies)
        .await?;
    assert!(cookies.is_empty());

    let api = request(
        Request::get("/latest.json")
            .header("Api-Key", "k1")
            .header("Cookie", format!("_t={forged}")),
    );
    let (_, mut ctx) = h.resolve(&api).await;
    h.state
        .sessions()
        .refresh_session(&api, &mut ctx, &mut cookies)
        .await?;
    assert!(cookies.is_empty());
    Ok(())
}

#[tokio::test]
async fn refresh_session_clears_cookie_for_anonymous() -> Result<()> {
    let h = Harness::new(AuthConfig::new());
    let req = with_cookie("/", &h.forged_cookie()?);
    let (result, mut ctx) = h.resolve(&req).await;
    assert_eq!(result?, None);

    let mut cookies = ResponseCookies::new();
    h.state
        .sessions()
        .refresh_session(&req, &mut ctx, &mut cookies)
        .await?;
    assert!(cookies.is_deleted("_t"));
    Ok(())
}

#[tokio::test]
async fn log_on_records_token_and_sets_cookie_attributes() -> Result<()> {
    let h = Harness::new(
        AuthConfig::new()
            .with_force_https(true)
            .with_same_site(SameSitePolicy::Strict),
    );
    h.store.insert_user(user(1, "alice")).await;

    let request = request(Request::post("/session").header("User-Agent", "tests"));
    let mut ctx = RequestContext::new();
    let mut cookies = ResponseCookies::new();
    h.state
        .sessions()
        .log_on(
            user(1, "alice"),
            &request,
            &mut ctx,
            &mut cookies,
            LogOnOptions { impersonate: true },
        )
        .await?;

    let header = cookies.get("_t").ok_or_else(|| anyhow!("no cookie"))?;
    assert!(header.contains("HttpOnly"));
    assert!(header.contains("; Secure"));
    assert!(header.contains("SameSite=Strict"));
    assert!(header.contains("Expires="));

    let token = ctx.session_token().ok_or_else(|| anyhow!("no token"))?;
    assert!(token.impersonate);
    assert_eq!(token.user_agent.as_deref(), Some("tests"));
    assert_eq!(ctx.current_user().map(|u| u.id), Some(1));
    Ok(())
}

#[tokio::test]
async fn failed_log_on_sets_no_cookie() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let replica = Arc::new(MemoryStore::new());
    replica.set_read_only(true);
    let mut stores = AuthStores::from_single(store, Arc::new(MemoryCounterStore::new()));
    stores.users = replica;
    let state = AuthState::new(
        AuthConfig::new(),
        Arc::new(SiteState::new(false)),
        stores,
        SecretString::from(COOKIE_SECRET.to_string()),
        Arc::new(ManualClock::aligned()),
        TaskQueue::spawn(),
    );

    let mut staged = user(1, "alice");
    staged.staged = true;
    let request = request(Request::post("/session"));
    let mut ctx = RequestContext::new();
    let mut cookies = ResponseCookies::new();
    let result = state
        .sessions()
        .log_on(staged, &request, &mut ctx, &mut cookies, LogOnOptions::default())
        .await;

    assert!(result.is_err());
    assert!(cookies.get("_t").is_none());
    assert!(ctx.current_user().is_none());
    Ok(())
}

#[tokio::test]
async fn cookie_attributes_follow_policy() -> Result<()> {
    let h = Harness::new(
        AuthConfig::new()
            .with_persistent_sessions(false)
            .with_same_site(SameSitePolicy::Disabled),
    );
    h.store.insert_user(user(1, "alice")).await;

    let request = request(Request::post("/session"));
    let mut ctx = RequestContext::new();
    let mut cookies = ResponseCookies::new();
    h.state
        .sessions()
        .log_on(user(1, "alice"), &request, &mut ctx, &mut cookies, LogOnOptions::default())
        .await?;

    let header = cookies.get("_t").ok_or_else(|| anyhow!("no cookie"))?;
    assert!(header.contains("HttpOnly"));
    assert!(!header.contains("Secure"));
    assert!(!header.contains("SameSite"));
    assert!(!header.contains("Expires"));
    Ok(())
}

#[tokio::test]
async fn log_on_unstages_and_promotes_developers() -> Result<()> {
    let h = Harness::new(
        AuthConfig::new().with_developer_emails(vec!["dev@example.com".to_string()]),
    );
    let staged = User {
        staged: true,
        email: "dev@example.com".to_string(),
        ..user(1, "dev")
    };
    h.store.insert_user(staged.clone()).await;
    // Another admin exists, so no bootstrap.
    h.store
        .insert_user(User {
            admin: true,
            ..user(2, "root")
        })
        .await;

    h.log_on(staged).await?;
    let stored = h.store.user(1).await.ok_or_else(|| anyhow!("user missing"))?;
    assert!(!stored.staged);
    assert!(stored.admin);

    h.state.tasks().flush().await;
    assert!(!h.site.bootstrap_mode_enabled());
    Ok(())
}

#[tokio::test]
async fn first_admin_enables_bootstrap_mode() -> Result<()> {
    let h = Harness::new(AuthConfig::new());
    let admin = User {
        admin: true,
        ..user(1, "admin")
    };
    h.store.insert_user(admin.clone()).await;

    h.log_on(admin).await?;
    h.state.tasks().flush().await;
    assert!(h.site.bootstrap_mode_enabled());
    Ok(())
}

#[tokio::test]
async fn log_on_enforces_session_count_limit() -> Result<()> {
    let h = Harness::new(AuthConfig::new().with_max_sessions_per_user(2));
    h.store.insert_user(user(1, "alice")).await;

    let oldest = h.log_on(user(1, "alice")).await?;
    for _ in 0..2 {
        h.clock.advance(Duration::seconds(5));
        h.log_on(user(1, "alice")).await?;
    }

    assert_eq!(h.store.tokens_for(1).await.len(), 2);
    let (result, _) = h.resolve(&with_cookie("/", &oldest)).await;
    assert_eq!(result?, None);
    Ok(())
}

#[tokio::test]
async fn strict_log_off_destroys_every_session() -> Result<()> {
    let h = Harness::new(AuthConfig::new());
    let mut events = h.state.sessions().subscribe();
    let admin = User {
        admin: true,
        ..user(1, "alice")
    };
    h.store.insert_user(admin.clone()).await;
    h.store.insert_user(user(2, "bob")).await;
    let first = h.log_on(admin.clone()).await?;
    h.log_on(admin).await?;

    let req = with_cookie("/", &first);
    let (_, mut ctx) = h.resolve(&req).await;
    let mut cookies = ResponseCookies::new();
    h.state.sessions().log_off(&mut ctx, &mut cookies).await?;

    assert!(h.store.tokens_for(1).await.is_empty());
    assert!(cookies.is_deleted("_t"));
    assert!(cookies.is_deleted("authentication_data"));
    assert!(cookies.is_deleted("__profilin"));
    assert_eq!(ctx.identity(), Some(&Identity::Anonymous));
    assert_eq!(events.try_recv()?, SessionEvent::LoggedOut { user_id: 1 });
    Ok(())
}

#[tokio::test]
async fn lenient_log_off_destroys_only_current_session() -> Result<()> {
    let h = Harness::new(AuthConfig::new().with_log_out_strict(false));
    h.store.insert_user(user(1, "alice")).await;
    let first = h.log_on(user(1, "alice")).await?;
    let second = h.log_on(user(1, "alice")).await?;

    let (_, mut ctx) = h.resolve(&with_cookie("/", &first)).await;
    let mut cookies = ResponseCookies::new();
    h.state.sessions().log_off(&mut ctx, &mut cookies).await?;

    assert_eq!(h.store.tokens_for(1).await.len(), 1);
    assert!(cookies.is_deleted("_t"));
    assert!(cookies.get("__profilin").is_none());
    let (result, _) = h.resolve(&with_cookie("/", &second)).await;
    assert_eq!(result?.map(|u| u.id), Some(1));
    Ok(())
}

#[tokio::test]
async fn anonymous_log_off_still_clears_cookies() -> Result<()> {
    let h = Harness::new(AuthConfig::new());
    let (_, mut ctx) = h.resolve(&request(Request::post("/session/logout"))).await;
    let mut cookies = ResponseCookies::new();
    h.state.sessions().log_off(&mut ctx, &mut cookies).await?;
    assert!(cookies.is_deleted("_t"));
    assert!(cookies.is_deleted("authentication_data"));
    Ok(())
}

#[tokio::test]
async fn has_auth_cookie_checks_age() -> Result<()> {
    let h = Harness::new(AuthConfig::new().with_maximum_session_age_hours(1));
    h.store.insert_user(user(1, "alice")).await;
    let cookie = h.log_on(user(1, "alice")).await?;
    let resolver = h.state.resolver();

    assert!(resolver.has_auth_cookie(&with_cookie("/", &cookie)));
    assert!(!resolver.has_auth_cookie(&with_cookie("/", "garbage")));
    assert!(!resolver.has_auth_cookie(&request(Request::get("/"))));

    h.clock.advance(Duration::hours(2));
    assert!(!resolver.has_auth_cookie(&with_cookie("/", &cookie)));
    Ok(())
}

#[tokio::test]
async fn is_api_forces_resolution() -> Result<()> {
    let h = Harness::new(AuthConfig::new());
    h.store.insert_user(user(1, "alice")).await;
    h.store.insert_api_key("k1", api_key(10, Some(1))).await;
    let req = request(Request::get("/latest.json").header("Api-Key", "k1"));

    let mut ctx = RequestContext::new();
    assert!(h.state.resolver().is_api(&req, &mut ctx).await?);
    assert!(ctx.is_resolved());
    assert!(!h.state.resolver().is_user_api(&req, &mut ctx).await?);
    // Memoized: the admin counter moved once.
    assert_eq!(h.counters.peek(&h.admin_window_key()).await?, 1);
    Ok(())
}
