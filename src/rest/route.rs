//! Route key resolution
//!
//! Collapses concrete request paths into the shape used for local
//! rate-limit bookkeeping before the server-assigned bucket is known.

use reqwest::Method;
use regex::Regex;
use std::fmt;
use std::sync::LazyLock;

static NUMERIC_SEGMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/(\w+)/\d+").expect("numeric segment pattern"));

static REACTION_SEGMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/reactions/[^/]+").expect("reaction segment pattern"));

/// Normalized (method, path-shape) key, e.g. `GET /channels/:id/messages`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteKey(String);

impl RouteKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resolve the route key for a request
///
/// Numeric path segments become `:id` and `/reactions/<emoji>` becomes
/// `/reactions/:emoji`. The method is part of the key, so `GET` and `POST`
/// on one path are tracked separately, as is a message `DELETE`.
pub fn resolve_route(method: &Method, path: &str) -> RouteKey {
    let path = path.split('?').next().unwrap_or_default();
    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    };

    let collapsed = NUMERIC_SEGMENT.replace_all(&path, "/$1/:id");

    let shape = if collapsed.contains("/reactions/") {
        REACTION_SEGMENT.replace(&collapsed, "/reactions/:emoji").into_owned()
    } else {
        collapsed.into_owned()
    };

    RouteKey(format!("{method} {shape}"))
}
