//! Request view and candidate-credential extraction.
//!
//! Header credentials are always read. Query-parameter credentials are only read
//! on routes matched by the parameter-route allow-list (feeds, calendar exports,
//! inbound mail). The session cookie is only read when no key form is present.

use axum::http::{HeaderMap, Method, header, request::Parts};
use std::collections::HashMap;
use std::net::IpAddr;

use super::{
    models::ClientContext,
    route_matcher::{RouteInfo, RouteMatcher},
};

pub const API_KEY_HEADER: &str = "api-key";
pub const API_USERNAME_HEADER: &str = "api-username";
pub const API_USER_ID_HEADER: &str = "api-user-id";
pub const API_USER_EXTERNAL_ID_HEADER: &str = "api-user-external-id";
pub const USER_API_KEY_HEADER: &str = "user-api-key";
pub const USER_API_CLIENT_ID_HEADER: &str = "user-api-client-id";
pub const SHARED_SESSION_HEADER: &str = "x-shared-session-key";
pub const LOGGED_IN_HEADER: &str = "x-logged-in";
pub const CLIENT_PRESENT_HEADER: &str = "x-client-present";

pub const API_KEY_PARAM: &str = "api_key";
pub const API_USERNAME_PARAM: &str = "api_username";
pub const API_USER_ID_PARAM: &str = "api_user_id";
pub const API_USER_EXTERNAL_ID_PARAM: &str = "api_user_external_id";
pub const USER_API_KEY_PARAM: &str = "user_api_key";

const DEFAULT_FORMAT: &str = "html";

/// `controller#action` identifier attached to a route as a request extension.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RouteAction(pub &'static str);

/// Everything the resolver needs from an inbound request.
#[derive(Clone, Debug)]
pub struct AuthRequest {
    pub method: Method,
    pub path: String,
    pub route: RouteInfo,
    pub client_ip: Option<IpAddr>,
    headers: HeaderMap,
    query: HashMap<String, String>,
    cookies: HashMap<String, String>,
}

impl AuthRequest {
    /// Build from request parts. `peer` is the socket address. `ip_header` names
    /// the header a trusted proxy sets; without one the peer is the client.
    #[must_use]
    pub fn from_parts(parts: &Parts, peer: Option<IpAddr>, ip_header: Option<&str>) -> Self {
        let path = parts.uri.path().to_string();
        let query = parse_query(parts.uri.query());
        let action = parts.extensions.get::<RouteAction>().map(|action| action.0);
        let format = request_format(&path, &query, &parts.headers);
        Self {
            method: parts.method.clone(),
            route: RouteInfo::new(parts.method.clone(), action, Some(&format)),
            path,
            client_ip: ip_header
                .and_then(|name| ip_from_header(name, &parts.headers))
                .or(peer),
            cookies: parse_cookies(&parts.headers),
            headers: parts.headers.clone(),
            query,
        }
    }

    /// Non-empty header value.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    /// Non-empty query parameter value.
    #[must_use]
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .get(name)
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }

    #[must_use]
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies
            .get(name)
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }

    #[must_use]
    pub fn is_xhr(&self) -> bool {
        self.header("x-requested-with")
            .is_some_and(|value| value.eq_ignore_ascii_case("xmlhttprequest"))
    }

    #[must_use]
    pub fn user_agent(&self) -> Option<&str> {
        self.header(header::USER_AGENT.as_str())
    }

    #[must_use]
    pub fn client_context(&self) -> ClientContext {
        ClientContext {
            user_agent: self.user_agent().map(ToString::to_string),
            path: Some(self.path.clone()),
            client_ip: self.client_ip,
        }
    }
}

/// Where a key was read from. Selectors that accompany a key are read from the
/// same place.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeySource {
    Header,
    Query,
}

/// Admin API key plus the optional acting-user selectors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApiCredentials {
    pub key: String,
    pub source: KeySource,
    pub username: Option<String>,
    pub user_id: Option<String>,
    pub external_id: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Credentials {
    pub shared_session: Option<String>,
    pub api: Option<ApiCredentials>,
    pub user_api_key: Option<String>,
    pub user_api_client_id: Option<String>,
    pub session_cookie: Option<String>,
    /// Client claims to hold a session (`X-Logged-In`).
    pub logged_in_hint: bool,
}

impl Credentials {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shared_session.is_none()
            && self.api.is_none()
            && self.user_api_key.is_none()
            && self.session_cookie.is_none()
    }
}

/// Pull every candidate credential out of `request`.
#[must_use]
pub fn extract(
    request: &AuthRequest,
    cookie_name: &str,
    parameter_routes: &[RouteMatcher],
) -> Credentials {
    let params_allowed = parameter_routes
        .iter()
        .any(|matcher| matcher.matches(&request.route));

    let api = extract_api_credentials(request, params_allowed);
    let user_api_key = request
        .header(USER_API_KEY_HEADER)
        .or_else(|| {
            params_allowed
                .then(|| request.query_param(USER_API_KEY_PARAM))
                .flatten()
        })
        .map(ToString::to_string);

    let session_cookie = if api.is_none() && user_api_key.is_none() {
        request.cookie(cookie_name).map(ToString::to_string)
    } else {
        None
    };

    Credentials {
        shared_session: request.header(SHARED_SESSION_HEADER).map(ToString::to_string),
        api,
        user_api_key,
        user_api_client_id: request
            .header(USER_API_CLIENT_ID_HEADER)
            .map(ToString::to_string),
        session_cookie,
        logged_in_hint: request.header(LOGGED_IN_HEADER).is_some(),
    }
}

fn extract_api_credentials(request: &AuthRequest, params_allowed: bool) -> Option<ApiCredentials> {
    if let Some(key) = request.header(API_KEY_HEADER) {
        return Some(ApiCredentials {
            key: key.to_string(),
            source: KeySource::Header,
            username: request.header(API_USERNAME_HEADER).map(ToString::to_string),
            user_id: request.header(API_USER_ID_HEADER).map(ToString::to_string),
            external_id: request
                .header(API_USER_EXTERNAL_ID_HEADER)
                .map(ToString::to_string),
        });
    }
    if !params_allowed {
        return None;
    }
    let key = request.query_param(API_KEY_PARAM)?;
    Some(ApiCredentials {
        key: key.to_string(),
        source: KeySource::Query,
        username: request.query_param(API_USERNAME_PARAM).map(ToString::to_string),
        user_id: request.query_param(API_USER_ID_PARAM).map(ToString::to_string),
        external_id: request
            .query_param(API_USER_EXTERNAL_ID_PARAM)
            .map(ToString::to_string),
    })
}

/// Last address in `header`; a proxy appends the peer it saw to any list the
/// client sent.
fn ip_from_header(header: &str, headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get(header)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.rsplit(',').next())
        .map(str::trim)
        .and_then(|value| value.parse().ok())
}

fn parse_query(query: Option<&str>) -> HashMap<String, String> {
    let mut params = HashMap::new();
    if let Some(query) = query {
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            params.entry(key.into_owned()).or_insert_with(|| value.into_owned());
        }
    }
    params
}

fn parse_cookies(headers: &HeaderMap) -> HashMap<String, String> {
    let mut cookies = HashMap::new();
    for value in headers.get_all(header::COOKIE) {
        let Ok(value) = value.to_str() else {
            continue;
        };
        for pair in value.split(';') {
            let Some((key, val)) = pair.trim().split_once('=') else {
                continue;
            };
            cookies
                .entry(key.trim().to_string())
                .or_insert_with(|| val.trim().to_string());
        }
    }
    cookies
}

/// `.rss` style suffix, then `?format=`, then `Accept: application/json`.
fn request_format(path: &str, query: &HashMap<String, String>, headers: &HeaderMap) -> String {
    let last_segment = path.rsplit('/').next().unwrap_or_default();
    if let Some((stem, ext)) = last_segment.rsplit_once('.')
        && !stem.is_empty()
        && !ext.is_empty()
    {
        return ext.to_ascii_lowercase();
    }
    if let Some(format) = query.get("format").filter(|format| !format.is_empty()) {
        return format.to_ascii_lowercase();
    }
    let wants_json = headers
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|accept| accept.contains("application/json"));
    if wants_json {
        "json".to_string()
    } else {
        DEFAULT_FORMAT.to_string()
    }
}
