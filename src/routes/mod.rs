//! URL routing: pattern matching and the per-verb route table
//!
//! Patterns use `:name` segments for unconditional captures and
//! `:name(regex)` segments for guarded captures; a route may additionally
//! capture an arbitrary-depth trailing remainder. The [`RouteTable`] resolves
//! a connection's path to an action name or a static file request, honoring
//! the explicit-`?action=`-wins precedence rule.

pub mod matcher;
pub mod table;

use thiserror::Error;

pub use matcher::{match_url, RouteMatch};
pub use table::{RawRoute, RawRoutes, Route, RouteTable};

/// Errors raised while registering or matching routes
#[derive(Error, Debug)]
pub enum RouteError {
    /// A `:name(regex)` segment carried an invalid regex
    #[error("invalid pattern segment in '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// A route was registered under an unsupported HTTP verb
    #[error("unknown verb '{verb}'")]
    UnknownVerb { verb: String },
}
