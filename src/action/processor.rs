//! The request-to-action execution pipeline
//!
//! One [`ActionProcessor`] drives a single incoming request through
//! admission, middleware, scrubbing, validation, execution, and the
//! completion funnel. Every request exits through [`complete`] exactly once,
//! whatever gate stopped it, so accounting and logging cannot be skipped.
//!
//! [`complete`]: ActionProcessor::complete

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;

use super::params::{self, Params, ValidationOutcome};
use super::{Action, ActionContext, ApiVersion, ResponseBody};
use crate::config::Config;
use crate::connection::{Connection, JsonMap};
use crate::exception;
use crate::metrics;
use crate::registry::ApiRegistry;

/// Terminal status of one processed request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionStatus {
    Success,
    ServerShuttingDown,
    TooManyRequests,
    UnknownAction,
    UnsupportedServerType,
    MissingParams(Vec<String>),
    ValidatorErrors(Vec<String>),
    Error(String),
}

impl ActionStatus {
    /// Stable string form used in logs, metrics, and transport mapping
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Success => "success",
            ActionStatus::ServerShuttingDown => "server_shutting_down",
            ActionStatus::TooManyRequests => "too_many_requests",
            ActionStatus::UnknownAction => "unknown_action",
            ActionStatus::UnsupportedServerType => "unsupported_server_type",
            ActionStatus::MissingParams(_) => "missing_params",
            ActionStatus::ValidatorErrors(_) => "validator_errors",
            ActionStatus::Error(_) => "error",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ActionStatus::Success)
    }
}

/// Everything the transport needs to render one finished request
#[derive(Debug, Clone)]
pub struct CompletedAction {
    pub action: String,
    pub version: ApiVersion,
    pub status: ActionStatus,
    pub response: Value,
    pub duration: Duration,
}

/// Drives requests through the execution pipeline
///
/// One processor is built per server and shared across requests; all
/// per-request state lives on the stack of [`ActionProcessor::process`].
pub struct ActionProcessor {
    config: Arc<Config>,
    registry: Arc<ApiRegistry>,
    route_whitelist: HashSet<String>,
}

impl ActionProcessor {
    pub fn new(
        config: Arc<Config>,
        registry: Arc<ApiRegistry>,
        route_whitelist: HashSet<String>,
    ) -> Self {
        Self {
            config,
            registry,
            route_whitelist,
        }
    }

    /// Run one request end to end.
    ///
    /// Admission gates fire in a fixed order: shutdown, per-connection
    /// concurrency, action resolution, connection-type block. Only a request
    /// that passes all four reaches middleware and the action body.
    pub async fn process(&self, connection: &Arc<Connection>, shutting_down: bool) -> CompletedAction {
        let started = Instant::now();
        let raw = connection.params().await;

        let action_name = raw
            .get("action")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let requested_version = raw.get("apiVersion").and_then(ApiVersion::from_value);

        connection.increment_pending();
        metrics::inc_pending_actions();

        let mut ctx = ActionContext {
            connection: Arc::clone(connection),
            action: action_name.clone(),
            version: requested_version.clone().unwrap_or_default(),
            params: Params::new(raw),
            response: ResponseBody::Object(JsonMap::new()),
        };

        if shutting_down {
            return self.complete(ctx, ActionStatus::ServerShuttingDown, started).await;
        }

        if connection.pending_actions() > self.config.general.simultaneous_actions {
            return self.complete(ctx, ActionStatus::TooManyRequests, started).await;
        }

        let Some(action) = self
            .registry
            .action(&action_name, requested_version.as_ref())
        else {
            return self.complete(ctx, ActionStatus::UnknownAction, started).await;
        };
        // An omitted version resolves to the registered template's own
        ctx.version = action.version();

        if action
            .blocked_connection_types()
            .iter()
            .any(|t| t == &connection.connection_type)
        {
            return self
                .complete(ctx, ActionStatus::UnsupportedServerType, started)
                .await;
        }

        let status = self.run_action(&action, &mut ctx).await;
        self.complete(ctx, status, started).await
    }

    /// Middleware, scrubbing, validation, freeze, body
    async fn run_action(&self, action: &Arc<dyn Action>, ctx: &mut ActionContext) -> ActionStatus {
        let middleware = self.registry.middleware_for(&action.middleware());

        for mw in &middleware {
            if let Err(err) = mw.pre_process(ctx).await {
                exception::report_action(&ctx.action, &ctx.connection.id, &err);
                return ActionStatus::Error(err.to_string());
            }
        }

        let inputs = action.inputs();

        if self.config.general.enable_param_scrubbing {
            let mut whitelist: HashSet<String> =
                self.config.general.safe_params.iter().cloned().collect();
            whitelist.extend(self.route_whitelist.iter().cloned());
            if let Some(values) = ctx.params.values_mut() {
                let removed = params::scrub_params(values, &inputs, &whitelist);
                if !removed.is_empty() {
                    tracing::debug!(action = %ctx.action, ?removed, "scrubbed undeclared params");
                }
            }
        }

        let mut outcome = ValidationOutcome::default();
        if let Some(values) = ctx.params.values_mut() {
            let mut keys: Vec<&String> = inputs.keys().collect();
            keys.sort();
            for key in keys {
                params::validate_param(
                    &inputs[key],
                    values,
                    key,
                    None,
                    self.registry.functions(),
                    &self.config.general.missing_param_values,
                    &mut outcome,
                );
            }
        }
        if !outcome.missing_params.is_empty() {
            return ActionStatus::MissingParams(outcome.missing_params);
        }
        if !outcome.validator_errors.is_empty() {
            return ActionStatus::ValidatorErrors(outcome.validator_errors);
        }

        // The body sees an immutable bag; mutation attempts surface as errors
        ctx.params.freeze();

        if let Err(err) = action.run(ctx).await {
            exception::report_action(&ctx.action, &ctx.connection.id, &err);
            return ActionStatus::Error(err.to_string());
        }

        for mw in &middleware {
            if let Err(err) = mw.post_process(ctx).await {
                exception::report_action(&ctx.action, &ctx.connection.id, &err);
                return ActionStatus::Error(err.to_string());
            }
        }

        ActionStatus::Success
    }

    /// The single exit funnel: renders the error message, settles the
    /// connection's pending count, and emits the completion log and metrics.
    async fn complete(
        &self,
        mut ctx: ActionContext,
        status: ActionStatus,
        started: Instant,
    ) -> CompletedAction {
        let messages = &self.config.errors;
        let message = match &status {
            ActionStatus::Success => None,
            ActionStatus::ServerShuttingDown => Some(messages.server_shutting_down()),
            ActionStatus::TooManyRequests => Some(messages.too_many_pending_actions()),
            ActionStatus::UnknownAction => Some(messages.unknown_action(&ctx.action)),
            ActionStatus::UnsupportedServerType => {
                Some(messages.unsupported_server_type(&ctx.connection.connection_type))
            }
            ActionStatus::MissingParams(missing) => Some(messages.missing_params(missing)),
            ActionStatus::ValidatorErrors(errors) => Some(messages.validator_errors(errors)),
            ActionStatus::Error(raw) => Some(raw.clone()),
        };

        if let Some(message) = message {
            // An error the action body already set wins over the template
            let already_reported = ctx.response.has_error();
            match &mut ctx.response {
                ResponseBody::Object(map) => {
                    if !already_reported {
                        map.insert(String::from("error"), Value::String(message));
                    }
                }
                // Non-object bodies are replaced outright by the error
                other => *other = ResponseBody::Text(message),
            }
        }

        ctx.connection.decrement_pending();
        metrics::dec_pending_actions();
        let duration = started.elapsed();

        metrics::record_action(&ctx.action, status.as_str(), duration.as_secs_f64());
        let logged = Value::Object(params::filter_params_for_logging(
            ctx.params.as_map(),
            &self.config.general.secret_params,
            self.config.general.max_logged_param_length,
        ));
        tracing::info!(
            action = %ctx.action,
            status = status.as_str(),
            connection_id = %ctx.connection.id,
            duration_ms = duration.as_millis() as u64,
            params = %logged,
            "action completed"
        );

        CompletedAction {
            action: ctx.action,
            version: ctx.version,
            status,
            response: ctx.response.into_value(),
            duration,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionError, ActionMiddleware, InputSpec};
    use crate::registry::RegistryBuilder;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;

    struct Echo;

    #[async_trait]
    impl Action for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn inputs(&self) -> HashMap<String, InputSpec> {
            HashMap::from([("word".to_string(), InputSpec::required())])
        }

        async fn run(&self, ctx: &mut ActionContext) -> Result<(), ActionError> {
            let word = ctx.params.get("word").cloned().unwrap_or(Value::Null);
            ctx.response.set("word", word);
            Ok(())
        }
    }

    struct FrozenProbe;

    #[async_trait]
    impl Action for FrozenProbe {
        fn name(&self) -> &str {
            "frozen_probe"
        }

        async fn run(&self, ctx: &mut ActionContext) -> Result<(), ActionError> {
            // The bag froze before run; this insert must be rejected
            ctx.params.insert("sneaky", json!(true))?;
            Ok(())
        }
    }

    struct WebOnly;

    #[async_trait]
    impl Action for WebOnly {
        fn name(&self) -> &str {
            "web_only"
        }

        fn blocked_connection_types(&self) -> Vec<String> {
            vec![String::from("websocket")]
        }

        async fn run(&self, _ctx: &mut ActionContext) -> Result<(), ActionError> {
            Ok(())
        }
    }

    struct Versioned(u32);

    #[async_trait]
    impl Action for Versioned {
        fn name(&self) -> &str {
            "versioned"
        }

        fn version(&self) -> ApiVersion {
            ApiVersion::Number(self.0)
        }

        async fn run(&self, ctx: &mut ActionContext) -> Result<(), ActionError> {
            ctx.response.set("ran", json!(self.0));
            Ok(())
        }
    }

    struct SelfReporting;

    #[async_trait]
    impl Action for SelfReporting {
        fn name(&self) -> &str {
            "self_reporting"
        }

        async fn run(&self, ctx: &mut ActionContext) -> Result<(), ActionError> {
            ctx.response.set("error", json!("upstream quota exceeded"));
            Err(ActionError::failed("call failed"))
        }
    }

    struct Vetoer;

    #[async_trait]
    impl ActionMiddleware for Vetoer {
        fn name(&self) -> &str {
            "vetoer"
        }

        fn global(&self) -> bool {
            true
        }

        async fn pre_process(&self, ctx: &mut ActionContext) -> Result<(), ActionError> {
            if ctx.params.get("veto").is_some() {
                return Err(ActionError::failed("vetoed"));
            }
            Ok(())
        }
    }

    fn processor() -> ActionProcessor {
        let registry = RegistryBuilder::new()
            .register_action(Arc::new(Echo))
            .register_action(Arc::new(FrozenProbe))
            .register_action(Arc::new(WebOnly))
            .register_action(Arc::new(SelfReporting))
            .register_action(Arc::new(Versioned(1)))
            .register_action(Arc::new(Versioned(3)))
            .register_middleware(Arc::new(Vetoer))
            .build()
            .unwrap();
        ActionProcessor::new(
            Arc::new(Config::default()),
            Arc::new(registry),
            HashSet::new(),
        )
    }

    fn web_connection() -> Arc<Connection> {
        Arc::new(Connection::new("web", "127.0.0.1", "tests"))
    }

    #[tokio::test]
    async fn test_successful_action() {
        let processor = processor();
        let connection = web_connection();
        connection
            .set_params(json!({"action": "echo", "word": "hi"}).as_object().cloned().unwrap())
            .await;

        let completed = processor.process(&connection, false).await;
        assert_eq!(completed.status, ActionStatus::Success);
        assert_eq!(completed.response["word"], json!("hi"));
        assert_eq!(connection.pending_actions(), 0);
        assert_eq!(connection.total_actions(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_gate_precedes_unknown_action() {
        let processor = processor();
        let connection = web_connection();
        connection
            .set_params(json!({"action": "no_such_action"}).as_object().cloned().unwrap())
            .await;

        let completed = processor.process(&connection, true).await;
        assert_eq!(completed.status, ActionStatus::ServerShuttingDown);
    }

    #[tokio::test]
    async fn test_unknown_action() {
        let processor = processor();
        let connection = web_connection();
        connection
            .set_params(json!({"action": "nope"}).as_object().cloned().unwrap())
            .await;

        let completed = processor.process(&connection, false).await;
        assert_eq!(completed.status, ActionStatus::UnknownAction);
        let error = completed.response["error"].as_str().unwrap();
        assert!(error.contains("nope"));
    }

    #[tokio::test]
    async fn test_body_set_error_survives_completion() {
        let processor = processor();
        let connection = web_connection();
        connection
            .set_params(json!({"action": "self_reporting"}).as_object().cloned().unwrap())
            .await;

        let completed = processor.process(&connection, false).await;
        assert!(matches!(completed.status, ActionStatus::Error(_)));
        assert_eq!(
            completed.response["error"],
            json!("upstream quota exceeded")
        );
    }

    #[tokio::test]
    async fn test_concurrency_gate() {
        let processor = processor();
        let connection = web_connection();
        connection
            .set_params(json!({"action": "echo", "word": "hi"}).as_object().cloned().unwrap())
            .await;
        for _ in 0..processor.config.general.simultaneous_actions {
            connection.increment_pending();
        }

        let completed = processor.process(&connection, false).await;
        assert_eq!(completed.status, ActionStatus::TooManyRequests);
    }

    #[tokio::test]
    async fn test_blocked_connection_type() {
        let processor = processor();
        let connection = Arc::new(Connection::new("websocket", "127.0.0.1", "tests"));
        connection
            .set_params(json!({"action": "web_only"}).as_object().cloned().unwrap())
            .await;

        let completed = processor.process(&connection, false).await;
        assert_eq!(completed.status, ActionStatus::UnsupportedServerType);
    }

    #[tokio::test]
    async fn test_missing_required_param() {
        let processor = processor();
        let connection = web_connection();
        connection
            .set_params(json!({"action": "echo"}).as_object().cloned().unwrap())
            .await;

        let completed = processor.process(&connection, false).await;
        assert_eq!(
            completed.status,
            ActionStatus::MissingParams(vec![String::from("word")])
        );
        assert!(completed.response["error"].as_str().unwrap().contains("word"));
    }

    #[tokio::test]
    async fn test_params_frozen_during_run() {
        let processor = processor();
        let connection = web_connection();
        connection
            .set_params(json!({"action": "frozen_probe"}).as_object().cloned().unwrap())
            .await;

        let completed = processor.process(&connection, false).await;
        assert_eq!(completed.status.as_str(), "error");
    }

    #[tokio::test]
    async fn test_omitted_version_resolves_highest() {
        let processor = processor();
        let connection = web_connection();
        connection
            .set_params(json!({"action": "versioned"}).as_object().cloned().unwrap())
            .await;

        let completed = processor.process(&connection, false).await;
        assert_eq!(completed.status, ActionStatus::Success);
        assert_eq!(completed.version, ApiVersion::Number(3));
        assert_eq!(completed.response["ran"], json!(3));
    }

    #[tokio::test]
    async fn test_explicit_version_resolves_exactly() {
        let processor = processor();
        let connection = web_connection();
        connection
            .set_params(
                json!({"action": "versioned", "apiVersion": 1})
                    .as_object()
                    .cloned()
                    .unwrap(),
            )
            .await;

        let completed = processor.process(&connection, false).await;
        assert_eq!(completed.version, ApiVersion::Number(1));
        assert_eq!(completed.response["ran"], json!(1));
    }

    #[tokio::test]
    async fn test_middleware_veto_becomes_error_status() {
        let processor = processor();
        let connection = web_connection();
        connection
            .set_params(
                json!({"action": "echo", "word": "hi", "veto": true})
                    .as_object()
                    .cloned()
                    .unwrap(),
            )
            .await;

        let completed = processor.process(&connection, false).await;
        assert_eq!(completed.status.as_str(), "error");
        assert!(completed.response["error"]
            .as_str()
            .unwrap()
            .contains("vetoed"));
    }

    #[tokio::test]
    async fn test_undeclared_params_scrubbed_before_body() {
        let processor = processor();
        let connection = web_connection();
        connection
            .set_params(
                json!({"action": "echo", "word": "hi", "extra": "gone"})
                    .as_object()
                    .cloned()
                    .unwrap(),
            )
            .await;

        let completed = processor.process(&connection, false).await;
        assert_eq!(completed.status, ActionStatus::Success);
        // "extra" was scrubbed, "action" survived via the safe list
        assert!(!completed.response.to_string().contains("gone"));
    }
}
