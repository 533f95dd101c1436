use anyhow::{Context, Result};
use clap::{Arg, ArgAction, ArgMatches, Command, builder::ValueParser};
use secrecy::SecretString;

use crate::auth::{AuthConfig, SameSitePolicy};

pub const ARG_COOKIE_NAME: &str = "cookie-name";
pub const ARG_COOKIE_SECRET: &str = "cookie-secret";
pub const ARG_FORCE_HTTPS: &str = "force-https";
pub const ARG_SAME_SITE: &str = "same-site";
pub const ARG_PERSISTENT_SESSIONS: &str = "persistent-sessions";
pub const ARG_MAXIMUM_SESSION_AGE_HOURS: &str = "maximum-session-age-hours";
pub const ARG_MAX_SESSIONS_PER_USER: &str = "max-sessions-per-user";
pub const ARG_LOG_OUT_STRICT: &str = "log-out-strict";
pub const ARG_COOKIE_ATTEMPTS_PER_MINUTE: &str = "max-cookie-attempts-per-minute";
pub const ARG_ADMIN_API_REQS_PER_MINUTE: &str = "admin-api-reqs-per-minute";
pub const ARG_ADMIN_API_REQS_PER_KEY_PER_MINUTE: &str = "admin-api-reqs-per-key-per-minute";
pub const ARG_USER_API_REQS_PER_MINUTE: &str = "user-api-reqs-per-minute";
pub const ARG_USER_API_REQS_PER_DAY: &str = "user-api-reqs-per-day";
pub const ARG_DEVELOPER_EMAILS: &str = "developer-emails";
pub const ARG_PROFILING: &str = "profiling";
pub const ARG_READ_ONLY: &str = "read-only";
pub const ARG_CLIENT_IP_HEADER: &str = "client-ip-header";

pub fn with_args(command: Command) -> Command {
    let command = with_cookie_args(command);
    let command = with_session_args(command);
    let command = with_limit_args(command);
    with_site_args(command)
}

fn validator_same_site() -> ValueParser {
    ValueParser::from(move |value: &str| -> std::result::Result<String, String> {
        SameSitePolicy::parse(value)
            .map(|_| value.to_lowercase())
            .ok_or_else(|| "expected one of: lax, strict, none, disabled".to_string())
    })
}

fn with_cookie_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_COOKIE_NAME)
                .long(ARG_COOKIE_NAME)
                .help("Session cookie name")
                .env("WARDEN_COOKIE_NAME")
                .default_value("_t"),
        )
        .arg(
            Arg::new(ARG_COOKIE_SECRET)
                .long(ARG_COOKIE_SECRET)
                .help("Secret used to sign session cookies")
                .env("WARDEN_COOKIE_SECRET")
                .hide_env_values(true)
                .required(true),
        )
        .arg(
            Arg::new(ARG_FORCE_HTTPS)
                .long(ARG_FORCE_HTTPS)
                .help("Mark the session cookie Secure")
                .env("WARDEN_FORCE_HTTPS")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new(ARG_SAME_SITE)
                .long(ARG_SAME_SITE)
                .help("SameSite policy for the session cookie: lax, strict, none, disabled")
                .env("WARDEN_SAME_SITE")
                .default_value("lax")
                .value_parser(validator_same_site()),
        )
        .arg(
            Arg::new(ARG_PERSISTENT_SESSIONS)
                .long(ARG_PERSISTENT_SESSIONS)
                .help("Give the session cookie an Expires attribute")
                .env("WARDEN_PERSISTENT_SESSIONS")
                .default_value("true")
                .value_parser(clap::value_parser!(bool)),
        )
}

fn with_session_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_MAXIMUM_SESSION_AGE_HOURS)
                .long(ARG_MAXIMUM_SESSION_AGE_HOURS)
                .help("Maximum session age in hours, measured from the last rotation")
                .env("WARDEN_MAXIMUM_SESSION_AGE_HOURS")
                .default_value("1440")
                .value_parser(clap::value_parser!(i64).range(1..)),
        )
        .arg(
            Arg::new(ARG_MAX_SESSIONS_PER_USER)
                .long(ARG_MAX_SESSIONS_PER_USER)
                .help("Concurrent sessions kept per user; the oldest are evicted")
                .env("WARDEN_MAX_SESSIONS_PER_USER")
                .default_value("60")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new(ARG_LOG_OUT_STRICT)
                .long(ARG_LOG_OUT_STRICT)
                .help("Logout destroys every session of the user, not just the current one")
                .env("WARDEN_LOG_OUT_STRICT")
                .default_value("true")
                .value_parser(clap::value_parser!(bool)),
        )
}

fn with_limit_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_COOKIE_ATTEMPTS_PER_MINUTE)
                .long(ARG_COOKIE_ATTEMPTS_PER_MINUTE)
                .help("Failed session cookie lookups allowed per client IP per minute")
                .env("WARDEN_MAX_COOKIE_ATTEMPTS_PER_MINUTE")
                .default_value("10")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_ADMIN_API_REQS_PER_MINUTE)
                .long(ARG_ADMIN_API_REQS_PER_MINUTE)
                .help("Admin API requests allowed per minute across all keys")
                .env("WARDEN_ADMIN_API_REQS_PER_MINUTE")
                .default_value("60")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_ADMIN_API_REQS_PER_KEY_PER_MINUTE)
                .long(ARG_ADMIN_API_REQS_PER_KEY_PER_MINUTE)
                .help("Deprecated: raises the admin API limit when larger")
                .env("WARDEN_ADMIN_API_REQS_PER_KEY_PER_MINUTE")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_USER_API_REQS_PER_MINUTE)
                .long(ARG_USER_API_REQS_PER_MINUTE)
                .help("User API requests allowed per key per minute")
                .env("WARDEN_USER_API_REQS_PER_MINUTE")
                .default_value("20")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_USER_API_REQS_PER_DAY)
                .long(ARG_USER_API_REQS_PER_DAY)
                .help("User API requests allowed per key per day")
                .env("WARDEN_USER_API_REQS_PER_DAY")
                .default_value("2880")
                .value_parser(clap::value_parser!(u64)),
        )
}

fn with_site_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_DEVELOPER_EMAILS)
                .long(ARG_DEVELOPER_EMAILS)
                .help("Comma separated emails granted admin on login")
                .env("WARDEN_DEVELOPER_EMAILS")
                .value_delimiter(','),
        )
        .arg(
            Arg::new(ARG_PROFILING)
                .long(ARG_PROFILING)
                .help("Profiling mode: skips the admin API rate limit")
                .env("WARDEN_PROFILING")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new(ARG_READ_ONLY)
                .long(ARG_READ_ONLY)
                .help("Start in read-only mode: no writebacks, no last-seen updates")
                .env("WARDEN_READ_ONLY")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new(ARG_CLIENT_IP_HEADER)
                .long(ARG_CLIENT_IP_HEADER)
                .help("Header a trusted reverse proxy sets to the client address, e.g. X-Real-IP; unset means the socket peer")
                .env("WARDEN_IP_HEADER"),
        )
}

#[derive(Debug)]
pub struct Options {
    pub config: AuthConfig,
    pub cookie_secret: SecretString,
    pub read_only: bool,
}

impl Options {
    /// # Errors
    /// Returns an error if a required argument is missing or malformed.
    pub fn parse(matches: &ArgMatches) -> Result<Self> {
        let cookie_secret = matches
            .get_one::<String>(ARG_COOKIE_SECRET)
            .cloned()
            .context("missing required argument: --cookie-secret")?;

        let same_site = matches
            .get_one::<String>(ARG_SAME_SITE)
            .and_then(|value| SameSitePolicy::parse(value))
            .unwrap_or_default();

        let developer_emails = matches
            .get_many::<String>(ARG_DEVELOPER_EMAILS)
            .map(|emails| emails.cloned().collect())
            .unwrap_or_default();

        let config = AuthConfig::new()
            .with_cookie_name(
                matches
                    .get_one::<String>(ARG_COOKIE_NAME)
                    .cloned()
                    .context("missing required argument: --cookie-name")?,
            )
            .with_force_https(matches.get_flag(ARG_FORCE_HTTPS))
            .with_same_site(same_site)
            .with_persistent_sessions(flag_value(matches, ARG_PERSISTENT_SESSIONS, true))
            .with_maximum_session_age_hours(
                matches
                    .get_one::<i64>(ARG_MAXIMUM_SESSION_AGE_HOURS)
                    .copied()
                    .unwrap_or(1440),
            )
            .with_max_sessions_per_user(
                matches
                    .get_one::<usize>(ARG_MAX_SESSIONS_PER_USER)
                    .copied()
                    .unwrap_or(60),
            )
            .with_log_out_strict(flag_value(matches, ARG_LOG_OUT_STRICT, true))
            .with_cookie_attempts_per_minute(number(matches, ARG_COOKIE_ATTEMPTS_PER_MINUTE, 10))
            .with_admin_api_reqs_per_minute(number(matches, ARG_ADMIN_API_REQS_PER_MINUTE, 60))
            .with_admin_api_reqs_per_key_per_minute(
                matches
                    .get_one::<u64>(ARG_ADMIN_API_REQS_PER_KEY_PER_MINUTE)
                    .copied(),
            )
            .with_user_api_reqs_per_minute(number(matches, ARG_USER_API_REQS_PER_MINUTE, 20))
            .with_user_api_reqs_per_day(number(matches, ARG_USER_API_REQS_PER_DAY, 2880))
            .with_developer_emails(developer_emails)
            .with_profiling(matches.get_flag(ARG_PROFILING))
            .with_client_ip_header(matches.get_one::<String>(ARG_CLIENT_IP_HEADER).cloned());

        Ok(Self {
            config,
            cookie_secret: SecretString::from(cookie_secret),
            read_only: matches.get_flag(ARG_READ_ONLY),
        })
    }
}

fn flag_value(matches: &ArgMatches, id: &str, default: bool) -> bool {
    matches.get_one::<bool>(id).copied().unwrap_or(default)
}

fn number(matches: &ArgMatches, id: &str, default: u64) -> u64 {
    matches.get_one::<u64>(id).copied().unwrap_or(default)
}
