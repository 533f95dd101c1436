//! Declarative `{method, action, format}` predicates.
//!
//! Used to gate which endpoints may receive credentials as query parameters, and
//! to express API-key and user-API-key scopes.

use axum::http::Method;
use std::collections::HashSet;

/// The parts of a request a [`RouteMatcher`] looks at.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteInfo {
    pub method: Method,
    /// `controller#action` identifier of the matched route, if any.
    pub action: Option<String>,
    /// Requested response format (`html`, `json`, `rss`, `ics`, ...).
    pub format: Option<String>,
}

impl RouteInfo {
    #[must_use]
    pub fn new(method: Method, action: Option<&str>, format: Option<&str>) -> Self {
        Self {
            method,
            action: action.map(ToString::to_string),
            format: format.map(str::to_ascii_lowercase),
        }
    }
}

/// Immutable rule: `None` on any axis means "any".
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RouteMatcher {
    methods: Option<HashSet<Method>>,
    actions: Option<HashSet<String>>,
    formats: Option<HashSet<String>>,
}

impl RouteMatcher {
    /// A matcher that accepts every request.
    #[must_use]
    pub fn any() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn methods<I: IntoIterator<Item = Method>>(mut self, methods: I) -> Self {
        self.methods = Some(methods.into_iter().collect());
        self
    }

    #[must_use]
    pub fn actions<I, S>(mut self, actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.actions = Some(actions.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn formats<I, S>(mut self, formats: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.formats = Some(
            formats
                .into_iter()
                .map(|f| f.as_ref().to_ascii_lowercase())
                .collect(),
        );
        self
    }

    #[must_use]
    pub fn matches(&self, route: &RouteInfo) -> bool {
        let method_ok = self
            .methods
            .as_ref()
            .is_none_or(|methods| methods.contains(&route.method));
        if !method_ok {
            return false;
        }

        let action_ok = self.actions.as_ref().is_none_or(|actions| {
            route
                .action
                .as_ref()
                .is_some_and(|action| actions.contains(action))
        });
        if !action_ok {
            return false;
        }

        self.formats.as_ref().is_none_or(|formats| {
            route
                .format
                .as_ref()
                .is_some_and(|format| formats.contains(format))
        })
    }
}

const FEED_FILTERS: [&str; 6] = ["latest", "unread", "new", "read", "posted", "bookmarks"];
const TOP_PERIODS: [&str; 6] = ["all", "yearly", "quarterly", "monthly", "weekly", "daily"];

/// Built-in allow-list of routes that accept API credentials as query parameters:
/// RSS feeds, the bookmarks calendar export, and the inbound-mail webhook.
#[must_use]
pub fn default_parameter_routes() -> Vec<RouteMatcher> {
    let mut feed_actions: Vec<String> = [
        "posts#latest",
        "posts#user_posts_feed",
        "groups#posts_feed",
        "groups#mentions_feed",
        "list#user_topics_feed",
        "list#category_feed",
        "topics#feed",
        "badges#show",
        "tags#tag_feed",
        "tags#show",
    ]
    .iter()
    .map(ToString::to_string)
    .collect();
    feed_actions.extend(FEED_FILTERS.iter().map(|f| format!("list#{f}_feed")));
    feed_actions.extend(TOP_PERIODS.iter().map(|p| format!("list#top_{p}_feed")));
    feed_actions.extend(FEED_FILTERS.iter().map(|f| format!("tags#show_{f}")));

    vec![
        RouteMatcher::any()
            .methods([Method::GET])
            .actions(feed_actions)
            .formats(["rss"]),
        RouteMatcher::any()
            .methods([Method::GET])
            .actions(["users#bookmarks"])
            .formats(["ics"]),
        RouteMatcher::any()
            .methods([Method::POST])
            .actions(["admin/email#handle_mail"]),
    ]
}
