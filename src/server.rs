//! The server facade tying the pipeline, routes, connections, and the task
//! system together
//!
//! Transports hold an `Arc<Server>` and funnel every request through
//! [`Server::process`]; the task system is started and stopped here so one
//! process can serve requests and work queues at once.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::action::processor::{ActionProcessor, CompletedAction};
use crate::config::Config;
use crate::connection::{Connection, ConnectionRegistry};
use crate::error::Result;
use crate::exception;
use crate::metrics;
use crate::registry::ApiRegistry;
use crate::routes::table::{RawRoutes, RouteTable};
use crate::store::QueueStore;
use crate::task::{TaskQueues, TaskWorker};

/// Snapshot reported by the status endpoint
#[derive(Debug, Clone, serde::Serialize)]
pub struct ServerStatus {
    pub server_name: String,
    pub node_id: String,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: i64,
    pub connections: usize,
    pub actions: Vec<String>,
    pub queues: Option<Value>,
}

/// One running application server
pub struct Server {
    config: Arc<Config>,
    registry: Arc<ApiRegistry>,
    routes: RouteTable,
    connections: ConnectionRegistry,
    queues: Option<Arc<TaskQueues>>,
    workers: Vec<Arc<TaskWorker>>,
    worker_handles: tokio::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
    shutting_down: AtomicBool,
    started_at: DateTime<Utc>,
}

impl Server {
    pub fn new(config: Config, registry: ApiRegistry) -> Self {
        Self {
            config: Arc::new(config),
            registry: Arc::new(registry),
            routes: RouteTable::new(),
            connections: ConnectionRegistry::new(),
            queues: None,
            workers: Vec::new(),
            worker_handles: tokio::sync::Mutex::new(Vec::new()),
            shutting_down: AtomicBool::new(false),
            started_at: Utc::now(),
        }
    }

    /// Install the route declarations. Must happen before the server is
    /// shared with a transport.
    pub fn load_routes(&mut self, raw: Option<RawRoutes>) -> Result<()> {
        self.routes.load_routes(raw)?;
        Ok(())
    }

    /// Attach a queue store and build the task machinery on top of it.
    ///
    /// Skipped entirely when `tasks.enabled` is false.
    pub fn attach_store(&mut self, store: Arc<dyn QueueStore>) {
        if !self.config.tasks.enabled {
            return;
        }
        let queues = Arc::new(TaskQueues::new(
            store,
            self.config.tasks.namespace.clone(),
            self.config.general.node_id.clone(),
        ));
        for _ in 0..self.config.tasks.workers.max(1) {
            self.workers.push(Arc::new(TaskWorker::new(
                Arc::clone(&queues),
                Arc::clone(&self.registry),
                self.config.tasks.clone(),
            )));
        }
        self.queues = Some(queues);
    }

    /// Boot the task system: announce this node, recover crashed work, seed
    /// periodic definitions, and start the worker loops.
    pub async fn start(&self) -> Result<()> {
        let Some(queues) = &self.queues else {
            tracing::info!("task system disabled, serving requests only");
            return Ok(());
        };

        queues.register_node().await.map_err(record_boot_failure)?;

        let recovered = queues
            .recover_processing()
            .await
            .map_err(record_boot_failure)?;
        if recovered > 0 {
            metrics::record_tasks_recovered(recovered);
            tracing::warn!(recovered, "re-queued tasks from a previous crash");
        }

        let seeded = queues
            .seed_periodic_tasks(&self.registry)
            .await
            .map_err(record_boot_failure)?;
        tracing::info!(seeded, workers = self.workers.len(), "task system started");

        let mut handles = self.worker_handles.lock().await;
        for worker in &self.workers {
            handles.push(worker.start());
        }
        Ok(())
    }

    /// Flip into shutdown mode and wind the task system down.
    ///
    /// In-flight actions finish; new arrivals are refused by the admission
    /// gate from this point on.
    pub async fn stop(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        for worker in &self.workers {
            worker.stop();
        }
        for handle in self.worker_handles.lock().await.drain(..) {
            let _ = handle.await;
        }
        if let Some(queues) = &self.queues {
            if let Err(err) = queues.deregister_node().await {
                tracing::warn!(error = %err, "node deregistration failed");
            }
        }
        tracing::info!("server stopped");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ApiRegistry> {
        &self.registry
    }

    pub fn connections(&self) -> &ConnectionRegistry {
        &self.connections
    }

    pub fn queues(&self) -> Option<&Arc<TaskQueues>> {
        self.queues.as_ref()
    }

    /// Resolve a transport path against the route table, mutating the
    /// connection's params. Returns `true` when something matched.
    pub async fn resolve_route(
        &self,
        connection: &Arc<Connection>,
        verb: &str,
        path_parts: &[String],
    ) -> bool {
        self.routes
            .process_route(connection, &self.registry, verb, path_parts)
            .await
    }

    /// Run the connection's current params through the action pipeline
    pub async fn process(&self, connection: &Arc<Connection>) -> CompletedAction {
        let processor = ActionProcessor::new(
            Arc::clone(&self.config),
            Arc::clone(&self.registry),
            self.combined_whitelist(),
        );
        processor
            .process(connection, self.is_shutting_down())
            .await
    }

    /// Route-variable names merge into the scrub whitelist so path captures
    /// survive even when an action does not declare them.
    fn combined_whitelist(&self) -> HashSet<String> {
        self.routes.param_whitelist().clone()
    }

    /// Status snapshot for the introspection endpoint
    pub async fn status(&self) -> ServerStatus {
        let queues = match &self.queues {
            Some(queues) => match queues.stats().await {
                Ok(stats) => serde_json::to_value(stats).ok(),
                Err(err) => {
                    tracing::warn!(error = %err, "queue stats unavailable");
                    None
                }
            },
            None => None,
        };
        ServerStatus {
            server_name: self.config.general.server_name.clone(),
            node_id: self.config.general.node_id.clone(),
            started_at: self.started_at,
            uptime_secs: (Utc::now() - self.started_at).num_seconds(),
            connections: self.connections.count().await,
            actions: self.registry.action_names(),
            queues,
        }
    }
}

fn record_boot_failure(err: crate::task::TaskError) -> crate::error::Error {
    let err = crate::error::Error::from(err);
    exception::report_initializer("task_system", &err);
    err
}
