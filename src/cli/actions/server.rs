use crate::{
    auth::{
        AuthConfig, AuthState, AuthStores, SiteState,
        clock::SystemClock,
        deferred::TaskQueue,
        memory::{MemoryCounterStore, MemoryStore},
        storage::{PgCounterStore, PgStore},
    },
    cli::telemetry,
    warden::{self, DatabaseProbe},
};
use anyhow::{Context, Result};
use secrecy::SecretString;
use sqlx::postgres::PgPoolOptions;
use std::{sync::Arc, time::Duration};
use tracing::{debug, error, info, warn};
use url::Url;

const COUNTER_PURGE_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub dsn: Option<String>,
    pub auth_config: AuthConfig,
    pub cookie_secret: SecretString,
    pub read_only: bool,
}

/// Execute the server action.
/// # Errors
/// Returns an error if the database is unreachable or the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    log_startup_args(&args);

    let (stores, probe) = match &args.dsn {
        Some(dsn) => {
            let pool = PgPoolOptions::new()
                .min_connections(1)
                .max_connections(5)
                .max_lifetime(Duration::from_secs(60 * 2))
                .test_before_acquire(true)
                .connect(dsn)
                .await
                .context("Failed to connect to database")?;

            let store = PgStore::new(pool.clone());
            let counters = PgCounterStore::new(pool);
            spawn_pg_counter_purge(counters.clone());

            (
                AuthStores::from_single(Arc::new(store.clone()), Arc::new(counters)),
                DatabaseProbe::postgres(store),
            )
        }
        None => {
            warn!("No DSN configured, using in-memory stores");
            let counters = Arc::new(MemoryCounterStore::new());
            spawn_memory_counter_purge(counters.clone());

            (
                AuthStores::from_single(Arc::new(MemoryStore::new()), counters),
                DatabaseProbe::memory(),
            )
        }
    };

    let site = Arc::new(SiteState::new(args.read_only));
    let auth = Arc::new(AuthState::new(
        args.auth_config,
        site,
        stores,
        args.cookie_secret,
        Arc::new(SystemClock),
        TaskQueue::spawn(),
    ));

    let result = warden::new(args.port, auth, probe, shutdown_signal()).await;

    telemetry::shutdown_tracer();

    result
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", err);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

fn spawn_pg_counter_purge(counters: PgCounterStore) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(COUNTER_PURGE_INTERVAL);
        loop {
            interval.tick().await;
            match counters.purge_expired().await {
                Ok(purged) => debug!(purged, "purged expired rate limit counters"),
                Err(err) => warn!("Failed to purge rate limit counters: {}", err),
            }
        }
    });
}

fn spawn_memory_counter_purge(counters: Arc<MemoryCounterStore>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(COUNTER_PURGE_INTERVAL);
        loop {
            interval.tick().await;
            counters.purge_expired();
        }
    });
}

fn log_startup_args(args: &Args) {
    let config = &args.auth_config;
    let entries = [
        ("listen", format!("tcp:{}", args.port)),
        (
            "dsn",
            args.dsn
                .as_deref()
                .map_or_else(|| "memory".to_string(), redact_dsn),
        ),
        ("cookie_name", config.cookie_name().to_string()),
        ("force_https", config.force_https().to_string()),
        ("same_site", format!("{:?}", config.same_site()).to_lowercase()),
        ("persistent_sessions", config.persistent_sessions().to_string()),
        (
            "maximum_session_age_hours",
            config.maximum_session_age().num_hours().to_string(),
        ),
        (
            "max_sessions_per_user",
            config.max_sessions_per_user().to_string(),
        ),
        ("log_out_strict", config.log_out_strict().to_string()),
        (
            "cookie_attempts_per_minute",
            config.cookie_attempts_per_minute().to_string(),
        ),
        (
            "admin_api_reqs_per_minute",
            config.admin_api_reqs_per_minute().to_string(),
        ),
        (
            "user_api_reqs_per_minute",
            config.user_api_reqs_per_minute().to_string(),
        ),
        (
            "user_api_reqs_per_day",
            config.user_api_reqs_per_day().to_string(),
        ),
        (
            "client_ip_header",
            config.client_ip_header().unwrap_or("peer").to_string(),
        ),
        ("read_only", args.read_only.to_string()),
    ];
    log_entries("Startup configuration", &entries);
}

fn redact_dsn(dsn: &str) -> String {
    match Url::parse(dsn) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("REDACTED"));
            }
            parsed.to_string()
        }
        Err(_) => "invalid-dsn".to_string(),
    }
}

fn log_entries(title: &str, entries: &[(&str, String)]) {
    let max_key_len = entries.iter().map(|(key, _)| key.len()).max().unwrap_or(0);
    let mut message = format!("warden {}\n\n{title}:", env!("CARGO_PKG_VERSION"));
    for (key, value) in entries {
        let padding = " ".repeat(max_key_len.saturating_sub(key.len()));
        let _ =
            std::fmt::Write::write_fmt(&mut message, format_args!("\n  {key}:{padding} {value}"));
    }
    info!("{message}");
}
