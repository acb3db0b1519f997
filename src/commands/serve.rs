//! The `serve` command: boot a full node
//!
//! Loads configuration, registers the built-in actions, wires the Redis
//! queue store, and runs the HTTP transport until Ctrl-C.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;

use crate::action::{Action, ActionContext, ActionError, InputSpec};
use crate::config::Config;
use crate::metrics;
use crate::registry::{ApiRegistry, RegistryBuilder};
use crate::routes::table::RawRoutes;
use crate::server::Server;
use crate::store::RedisStore;
use crate::web::WebServer;

// ============================================================================
// Built-in Actions
// ============================================================================

/// Reports node identity and uptime
struct StatusAction {
    config: Arc<Config>,
    started_at: DateTime<Utc>,
}

#[async_trait]
impl Action for StatusAction {
    fn name(&self) -> &str {
        "status"
    }

    fn description(&self) -> &str {
        "Node identity, uptime, and health"
    }

    async fn run(&self, ctx: &mut ActionContext) -> Result<(), ActionError> {
        ctx.response
            .set("serverName", json!(self.config.general.server_name));
        ctx.response.set("nodeId", json!(self.config.general.node_id));
        ctx.response.set(
            "uptimeSecs",
            json!((Utc::now() - self.started_at).num_seconds()),
        );
        Ok(())
    }
}

/// Pauses for a requested number of milliseconds, then echoes it back.
/// Useful for exercising the concurrency gate.
struct SleepAction;

#[async_trait]
impl Action for SleepAction {
    fn name(&self) -> &str {
        "sleep"
    }

    fn description(&self) -> &str {
        "Sleep for sleepDuration milliseconds"
    }

    fn inputs(&self) -> HashMap<String, InputSpec> {
        HashMap::from([(
            String::from("sleepDuration"),
            InputSpec::optional().with_default(json!(1000)),
        )])
    }

    async fn run(&self, ctx: &mut ActionContext) -> Result<(), ActionError> {
        let ms = ctx
            .params
            .get("sleepDuration")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(1000);
        tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
        ctx.response.set("sleptMs", json!(ms));
        Ok(())
    }
}

/// Register the actions every node ships with
pub fn build_registry(config: &Arc<Config>) -> crate::error::Result<ApiRegistry> {
    RegistryBuilder::new()
        .register_action(Arc::new(StatusAction {
            config: Arc::clone(config),
            started_at: Utc::now(),
        }))
        .register_action(Arc::new(SleepAction))
        .build()
}

// ============================================================================
// Serve
// ============================================================================

/// Load config, either from a TOML file or the environment
pub fn load_config(config_path: Option<&str>) -> Result<Config> {
    let config = match config_path {
        Some(path) => {
            Config::from_file(std::path::Path::new(path)).context("failed to load config file")?
        }
        None => Config::from_env().context("failed to load config from environment")?,
    };
    config.validate().context("invalid configuration")?;
    Ok(config)
}

/// Load route declarations from a TOML file
fn load_routes(path: &str) -> Result<RawRoutes> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read routes file {path}"))?;
    toml::from_str(&text).with_context(|| format!("failed to parse routes file {path}"))
}

/// Boot a full node and serve until Ctrl-C
pub async fn serve(config_path: Option<String>, routes_path: Option<String>) -> Result<()> {
    let config = Arc::new(load_config(config_path.as_deref())?);

    if let Err(e) = metrics::init_metrics() {
        tracing::warn!(error = %e, "metrics initialization failed, continuing without");
    }

    let registry = build_registry(&config).context("failed to build action registry")?;
    let mut server = Server::new(Config::clone(&config), registry);

    let routes = match routes_path.as_deref() {
        Some(path) => Some(load_routes(path)?),
        None => None,
    };
    server.load_routes(routes).context("failed to load routes")?;

    if config.tasks.enabled {
        let store = RedisStore::new(&config.redis)
            .await
            .context("failed to connect to the queue store")?;
        server.attach_store(Arc::new(store));
    }

    let server = Arc::new(server);
    server.start().await.context("failed to start task system")?;

    let web = WebServer::new(Arc::clone(&server));
    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
    };
    web.start_with_shutdown(shutdown).await?;

    server.stop().await;
    Ok(())
}
