//! The per-verb route table
//!
//! Routes are registered per HTTP verb (with `all` expanded at load time, not
//! at match time) and tried in registration order. Resolution follows the
//! precedence policy: an explicit `?action=` naming a loaded action always
//! wins; otherwise the first matching route binds its captured variables into
//! the connection's params and sets either `params.action` or `params.file`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use super::matcher::match_url;
use super::RouteError;
use crate::action::ApiVersion;
use crate::connection::Connection;
use crate::registry::ApiRegistry;

/// Verbs a route may be registered under; `all` expands to each of these
pub const VERBS: [&str; 6] = ["head", "get", "post", "put", "patch", "delete"];

// ============================================================================
// Route Declarations
// ============================================================================

/// One route as declared by application code
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRoute {
    /// Pattern string using `:name` and `:name(regex)` segments
    pub path: String,

    /// Action to resolve to (mutually exclusive with `dir` in practice)
    #[serde(default)]
    pub action: Option<String>,

    /// Backfilled onto the connection when it has no explicit version
    #[serde(default)]
    pub api_version: Option<ApiVersion>,

    /// Capture an arbitrary-depth trailing remainder in the last segment
    #[serde(default)]
    pub match_trailing_path_parts: bool,

    /// Static-mapped directory; matching sets `params.file` instead of an action
    #[serde(default)]
    pub dir: Option<String>,
}

/// Declared routes keyed by verb (`get`, `post`, ..., or `all`)
pub type RawRoutes = HashMap<String, Vec<RawRoute>>;

/// One registered route
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    pub verb: String,
    pub path: String,
    pub action: Option<String>,
    pub api_version: Option<ApiVersion>,
    pub match_trailing_path_parts: bool,
    pub dir: Option<String>,
}

// ============================================================================
// Route Table
// ============================================================================

/// All registered routes per HTTP verb
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: HashMap<String, Vec<Route>>,
    param_whitelist: HashSet<String>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the in-memory route table. Idempotent; `None` clears it.
    ///
    /// Routes under the `all` verb are expanded into one entry per supported
    /// verb here, at load time; a key that is neither `all` nor a supported
    /// verb is rejected rather than silently never matching. Afterwards the
    /// whitelist of acceptable param names is recomputed so route-bound
    /// variable names become implicitly acceptable to scrubbing.
    pub fn load_routes(&mut self, raw: Option<RawRoutes>) -> Result<(), RouteError> {
        self.routes.clear();

        if let Some(raw) = raw {
            for (verb, declared) in raw {
                let verbs: Vec<String> = if verb.eq_ignore_ascii_case("all") {
                    VERBS.iter().map(|v| v.to_string()).collect()
                } else if VERBS.contains(&verb.to_lowercase().as_str()) {
                    vec![verb.to_lowercase()]
                } else {
                    return Err(RouteError::UnknownVerb { verb });
                };
                for verb in verbs {
                    let list = self.routes.entry(verb.clone()).or_default();
                    for route in &declared {
                        list.push(Route {
                            verb: verb.clone(),
                            path: route.path.clone(),
                            action: route.action.clone(),
                            api_version: route.api_version.clone(),
                            match_trailing_path_parts: route.match_trailing_path_parts,
                            dir: route.dir.clone(),
                        });
                    }
                }
            }
        }

        self.recompute_param_whitelist();

        let total: usize = self.routes.values().map(Vec::len).sum();
        tracing::info!(routes = total, "route table loaded");
        Ok(())
    }

    /// Variable names captured by any registered route
    pub fn param_whitelist(&self) -> &HashSet<String> {
        &self.param_whitelist
    }

    /// Registered routes for one verb, in registration order
    pub fn routes_for(&self, verb: &str) -> &[Route] {
        self.routes.get(verb).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Resolve a connection's path to an action or file request, mutating
    /// `connection.params`.
    ///
    /// Returns `true` when a route matched (or routing was skipped because an
    /// explicit action param already names a loaded action).
    pub async fn process_route(
        &self,
        connection: &Arc<Connection>,
        registry: &ApiRegistry,
        verb: &str,
        path_parts: &[String],
    ) -> bool {
        // An explicit ?action= naming a real loaded action wins over any route
        if let Some(Value::String(action)) = connection.param("action").await {
            if registry.has_action(&action) {
                return true;
            }
        }

        let verb = verb.to_lowercase();
        // HEAD falls back to GET's route list if no HEAD routes exist
        let candidates = if verb == "head" && !self.routes.contains_key("head") {
            self.routes_for("get")
        } else {
            self.routes_for(&verb)
        };

        for route in candidates {
            let result = match match_url(path_parts, &route.path, route.match_trailing_path_parts)
            {
                Ok(result) => result,
                Err(err) => {
                    tracing::warn!(path = %route.path, error = %err, "skipping unmatchable route");
                    continue;
                }
            };
            if !result.matched {
                continue;
            }

            // Backfill the route's apiVersion without overriding an explicit one
            if let Some(version) = &route.api_version {
                if connection.param("apiVersion").await.is_none() {
                    connection
                        .set_param("apiVersion", Value::String(version.to_string()))
                        .await;
                }
            }

            for (key, value) in &result.params {
                let key = decode_component(key).unwrap_or_else(|| key.clone());
                let value = decode_component(value).unwrap_or_else(|| value.clone());
                connection.set_param(key, Value::String(value)).await;
            }

            connection.set_matched_route(route.clone()).await;

            if route.dir.is_some() {
                // Residual file path: everything after the pattern's literal prefix
                let pattern_len = super::matcher::split_segments(&route.path).len();
                let prefix_len = if route.match_trailing_path_parts {
                    pattern_len.saturating_sub(1)
                } else {
                    pattern_len
                };
                let file = path_parts[prefix_len.min(path_parts.len())..].join("/");
                connection.set_param("file", Value::String(file)).await;
            } else if let Some(action) = &route.action {
                // Route action wins whenever the pre-existing action value
                // does not resolve to a real loaded action
                connection
                    .set_param("action", Value::String(action.clone()))
                    .await;
            }

            return true;
        }

        false
    }

    fn recompute_param_whitelist(&mut self) {
        self.param_whitelist.clear();
        for routes in self.routes.values() {
            for route in routes {
                for segment in route.path.split('/') {
                    if let Some(colon) = segment.find(':') {
                        let variable = &segment[colon + 1..];
                        let name = match variable.find('(') {
                            Some(paren) => &variable[..paren],
                            None => variable,
                        };
                        if !name.is_empty() {
                            self.param_whitelist.insert(name.to_string());
                        }
                    }
                }
            }
        }
    }
}

/// Percent-decode one captured component, treating `+` as space.
///
/// Returns `None` for a malformed encoding (the caller keeps the raw text,
/// matching the "silently ignore a single bad decode" rule).
fn decode_component(raw: &str) -> Option<String> {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' => {
                let hi = hex_value(*bytes.get(i + 1)?)?;
                let lo = hex_value(*bytes.get(i + 2)?)?;
                out.push(hi * 16 + lo);
                i += 2;
            }
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8(out).ok()
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}
