//! # Warden (request-time identity and session lifecycle)
//!
//! `warden` decides, for every inbound HTTP request, who is calling: an anonymous
//! visitor, a session-cookie user, an admin API key acting as some user, or a
//! user-API-key client. It also issues, rotates and revokes the session token
//! that backs the cookie.
//!
//! ## Credential priority
//!
//! 1. `X-Shared-Session-Key` from a trusted upstream short-circuits everything.
//! 2. `API-Key` or `User-Api-Key` (headers, or query parameters on allow-listed
//!    feed/calendar/inbound-mail routes). Presenting both is rejected.
//! 3. The signed session cookie, only when no key is present.
//!
//! Every path fails closed: a presented-but-invalid key rejects the request, a
//! broken cookie degrades to anonymous, and a suspended or inactive user never
//! resolves.
//!
//! ## Layout
//!
//! - [`auth`] holds the resolver, session manager, rate limiter and stores.
//! - [`warden`] is the axum surface: routes, auth middleware and error mapping.
//! - [`cli`] parses configuration and starts the server.

pub mod auth;
pub mod cli;
pub mod warden;

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);
