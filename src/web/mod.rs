//! HTTP transport: turns axum requests into pipeline runs
//!
//! The transport owns no business logic. It builds a [`Connection`] per
//! request, merges query and body params, lets the route table resolve the
//! path, runs the pipeline, and maps the terminal status onto an HTTP
//! status code.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use serde_json::Value;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::action::processor::ActionStatus;
use crate::connection::{Connection, JsonMap};
use crate::error::{Error, Result};
use crate::metrics;
use crate::server::Server;

// ============================================================================
// App State
// ============================================================================

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub server: Arc<Server>,
}

// ============================================================================
// Web Server
// ============================================================================

/// The HTTP front of one [`Server`]
pub struct WebServer {
    server: Arc<Server>,
}

impl WebServer {
    pub fn new(server: Arc<Server>) -> Self {
        Self { server }
    }

    /// Build the router with all routes
    pub fn build_router(&self) -> Router {
        let state = AppState {
            server: Arc::clone(&self.server),
        };
        let config = &self.server.config().web;

        let mut router = Router::new()
            .route("/api/status", get(server_status))
            .route("/metrics", get(prometheus_metrics))
            .route("/", any(handle_request))
            .route("/{*path}", any(handle_request))
            .with_state(state);

        if config.enable_cors {
            router = router.layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            );
        }

        if config.enable_request_logging {
            router = router.layer(TraceLayer::new_for_http());
        }

        router
    }

    /// Bind and serve until the shutdown signal resolves
    pub async fn start_with_shutdown(
        &self,
        shutdown_signal: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> Result<()> {
        let router = self.build_router();
        let config = &self.server.config().web;
        let addr = format!("{}:{}", config.host, config.port);

        tracing::info!(%addr, "starting web server");
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| Error::other(format!("failed to bind {addr}: {e}")))?;

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| Error::other(format!("web server failed: {e}")))?;

        tracing::info!("web server shutdown complete");
        Ok(())
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Status introspection endpoint
async fn server_status(State(state): State<AppState>) -> Json<Value> {
    let status = state.server.status().await;
    Json(serde_json::to_value(status).unwrap_or(Value::Null))
}

/// Prometheus text exposition
async fn prometheus_metrics() -> Response {
    match metrics::encode_metrics() {
        Ok(text) => (StatusCode::OK, text).into_response(),
        Err(err) => {
            tracing::error!(error = %err, "metrics encoding failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// The catch-all: every other path goes through routing and the pipeline
async fn handle_request(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let server = &state.server;

    let remote_ip = remote_ip(&headers);
    let user_agent = headers
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let connection = server
        .connections()
        .add(Connection::new("web", remote_ip, user_agent))
        .await;

    connection
        .set_params(collect_params(&uri, &headers, &body))
        .await;

    let verb = method.as_str().to_lowercase();
    let path_parts = split_path(uri.path());
    server.resolve_route(&connection, &verb, &path_parts).await;

    let completed = server.process(&connection).await;
    let code = http_status(&completed.status);
    metrics::record_http_request(code.as_u16());

    server.connections().destroy(&connection.id).await;

    (code, Json(completed.response)).into_response()
}

// ============================================================================
// Request Plumbing
// ============================================================================

/// Best-effort client address: proxies first, then unknown
fn remote_ip(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .unwrap_or_else(|| String::from("unknown"))
}

/// Merge query-string params with a JSON object body; body keys win
fn collect_params(uri: &Uri, headers: &HeaderMap, body: &Bytes) -> JsonMap {
    let mut params = JsonMap::new();

    if let Some(query) = uri.query() {
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            params.insert(key.into_owned(), Value::String(value.into_owned()));
        }
    }

    let is_json = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("application/json"))
        .unwrap_or(false);
    if is_json && !body.is_empty() {
        if let Ok(Value::Object(map)) = serde_json::from_slice::<Value>(body) {
            params.extend(map);
        }
    }

    params
}

/// Split a URI path into non-empty segments
fn split_path(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Map a terminal pipeline status onto an HTTP status code
fn http_status(status: &ActionStatus) -> StatusCode {
    match status {
        ActionStatus::Success => StatusCode::OK,
        ActionStatus::UnknownAction => StatusCode::NOT_FOUND,
        ActionStatus::MissingParams(_) | ActionStatus::ValidatorErrors(_) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        ActionStatus::TooManyRequests => StatusCode::TOO_MANY_REQUESTS,
        ActionStatus::ServerShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        ActionStatus::UnsupportedServerType | ActionStatus::Error(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_path_drops_empty_segments() {
        assert_eq!(split_path("/a//b/"), vec!["a", "b"]);
        assert!(split_path("/").is_empty());
    }

    #[test]
    fn test_query_params_parse_as_strings() {
        let uri: Uri = "/x?word=hi+there&n=3".parse().unwrap();
        let params = collect_params(&uri, &HeaderMap::new(), &Bytes::new());
        assert_eq!(params["word"], Value::String(String::from("hi there")));
        assert_eq!(params["n"], Value::String(String::from("3")));
    }

    #[test]
    fn test_json_body_overrides_query() {
        let uri: Uri = "/x?word=query".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("content-type", "application/json".parse().unwrap());
        let body = Bytes::from(r#"{"word": "body", "count": 2}"#);

        let params = collect_params(&uri, &headers, &body);
        assert_eq!(params["word"], Value::String(String::from("body")));
        assert_eq!(params["count"], serde_json::json!(2));
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(http_status(&ActionStatus::Success), StatusCode::OK);
        assert_eq!(
            http_status(&ActionStatus::UnknownAction),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            http_status(&ActionStatus::MissingParams(vec![])),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            http_status(&ActionStatus::TooManyRequests),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            http_status(&ActionStatus::ServerShuttingDown),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
